use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Append-only file handle that tolerates being rotated out from under it.
///
/// The handle is opened lazily on the next write, so an external rotator (or
/// a SIGHUP shim calling [`AutoFile::reopen`]) can move the file away at any
/// time without coordination. When `max_size` is exceeded the current file
/// is closed and atomically renamed to `<path>.old`, replacing the previous
/// generation, and a fresh file takes its place.
pub struct AutoFile {
    path: PathBuf,
    file: Option<File>,
    size: u64,
    max_size: u64,
}

/// Size limit that never rotates.
pub const NO_ROTATE: u64 = u64::MAX;

impl AutoFile {
    pub fn open(path: impl Into<PathBuf>, max_size: u64) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut af = Self {
            path,
            file: None,
            size: 0,
            max_size,
        };
        af.ensure_open()?;
        Ok(af)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the rotated-out previous generation.
    pub fn old_path(&self) -> PathBuf {
        let mut p = self.path.clone().into_os_string();
        p.push(".old");
        PathBuf::from(p)
    }

    fn ensure_open(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.size = file.metadata()?.len();
            self.file = Some(file);
        }
        Ok(self.file.as_mut().unwrap())
    }

    /// Drop the handle; the next write re-opens. This is the hook the
    /// signal-handling shim calls after external log rotation.
    pub fn reopen(&mut self) {
        self.file = None;
    }

    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.size.saturating_add(buf.len() as u64) > self.max_size {
            self.rotate()?;
        }
        let file = self.ensure_open()?;
        file.write_all(buf)?;
        self.size = self.size.saturating_add(buf.len() as u64);
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        if let Some(f) = self.file.as_mut() {
            f.flush()?;
            f.sync_data()?;
        }
        Ok(())
    }

    /// Close and rename current → `<path>.old`, then start fresh. The rename
    /// is atomic on the same filesystem, so a reader never observes a
    /// half-moved file.
    pub fn rotate(&mut self) -> io::Result<()> {
        self.flush()?;
        self.file = None;
        if self.path.exists() {
            std::fs::rename(&self.path, self.old_path())?;
        }
        self.size = 0;
        self.ensure_open()?;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_reopen_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let mut af = AutoFile::open(&path, NO_ROTATE).unwrap();
        af.write_all(b"one").unwrap();
        af.reopen();
        af.write_all(b"two").unwrap();
        af.flush().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"onetwo");
    }

    #[test]
    fn rotation_moves_old_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let mut af = AutoFile::open(&path, 8).unwrap();
        af.write_all(b"12345678").unwrap();
        af.write_all(b"abc").unwrap(); // exceeds 8, rotates first
        af.flush().unwrap();
        assert_eq!(std::fs::read(af.old_path()).unwrap(), b"12345678");
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }
}
