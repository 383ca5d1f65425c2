//! Stream-socket transport for the application connections.
//!
//! Frames are `u32` length-prefixed JSON, bidirectional, with responses
//! matched to requests by arrival order per connection. A handler panic on
//! the server side is recovered and answered with `Exception`; the
//! connection keeps serving.

use crate::app::{dispatch, AppRequest, AppResponse, Application};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Frames larger than this are treated as a protocol violation.
const MAX_FRAME_BYTES: u32 = 32 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum SocketError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large ({0} bytes)")]
    FrameTooLarge(u32),
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<(), SocketError> {
    if payload.len() as u32 > MAX_FRAME_BYTES {
        return Err(SocketError::FrameTooLarge(payload.len() as u32));
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, SocketError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(SocketError::FrameTooLarge(len));
    }
    let mut data = vec![0u8; len as usize];
    stream.read_exact(&mut data).await?;
    Ok(data)
}

/// Client end of one logical connection. `&mut self` on `call` enforces the
/// at-most-one-in-flight, FIFO contract.
pub struct AppClient {
    stream: TcpStream,
}

impl AppClient {
    pub async fn connect(addr: &str) -> Result<Self, SocketError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub async fn call(&mut self, req: &AppRequest) -> Result<AppResponse, SocketError> {
        let payload = serde_json::to_vec(req)?;
        write_frame(&mut self.stream, &payload).await?;
        let resp = read_frame(&mut self.stream).await?;
        Ok(serde_json::from_slice(&resp)?)
    }
}

/// Serves one application over TCP. Each accepted connection becomes one
/// logical app connection; the four consensus-side connections may arrive
/// as four sockets or fewer (multiplexing is the client's choice).
pub struct AppServer {
    listen_addr: String,
    app: Arc<Mutex<dyn Application>>,
}

impl AppServer {
    pub fn new(listen_addr: impl Into<String>, app: Arc<Mutex<dyn Application>>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            app,
        }
    }

    pub async fn run(self) -> Result<(), SocketError> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(addr = %self.listen_addr, "application server listening");
        loop {
            let (stream, remote) = listener.accept().await?;
            debug!(remote = %remote, "application connection accepted");
            let app = self.app.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, app).await {
                    debug!(remote = %remote, error = %e, "application connection closed");
                }
            });
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    app: Arc<Mutex<dyn Application>>,
) -> Result<(), SocketError> {
    stream.set_nodelay(true)?;
    loop {
        let frame = read_frame(&mut stream).await?;
        let resp = match serde_json::from_slice::<AppRequest>(&frame) {
            Ok(req) => {
                // A panic inside dispatch poisons the mutex; recover the
                // guard so the connection stays usable.
                let mut guard = app.lock().unwrap_or_else(|p| p.into_inner());
                dispatch(&mut *guard, req)
            }
            Err(e) => AppResponse::Exception {
                error: format!("malformed request: {}", e),
            },
        };
        let payload = serde_json::to_vec(&resp)?;
        write_frame(&mut stream, &payload).await?;
    }
}
