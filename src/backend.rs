//! Positioned file I/O — the only module that touches the filesystem.
//!
//! [`Backend`] wraps a [`std::fs::File`] and tracks two offsets:
//!
//! - `fpos` — the current file position, advanced by every read and write;
//! - `fend` — the known end of file, extended when a write runs past it.
//!
//! Tracking both in user space lets the chunk layer answer "am I at the
//! end?" without a syscall per chunk.  Reads that return fewer bytes than
//! requested are an error — the chunk layer depends on exact framing and
//! never accepts a partial read.
//!
//! # Open modes
//!
//! | Mode | Behavior |
//! |------|----------|
//! | `w`  | create/truncate, read+write, exclusive lock |
//! | `r`  | read-only, no lock |
//! | `a`  | read+write on an existing file, exclusive lock, positioned at 0 |
//!
//! On Unix the write modes take an advisory `flock(LOCK_EX | LOCK_NB)` so a
//! second writer fails fast instead of interleaving chunks.  Readers take
//! no lock.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// File open disposition; see the module docs for the mode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Create or truncate, then read/write.
    Write,
    /// Read-only.
    Read,
    /// Read/write an existing file (repair / append).
    Append,
}

pub struct Backend {
    file: File,
    mode: Mode,
    fpos: u64,
    fend: u64,
}

impl Backend {
    pub fn open<P: AsRef<Path>>(path: P, mode: Mode) -> Result<Self> {
        let path = path.as_ref();
        let file = match mode {
            Mode::Write => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
            Mode::Read => OpenOptions::new().read(true).open(path)?,
            Mode::Append => OpenOptions::new().read(true).write(true).open(path)?,
        };

        if mode != Mode::Read {
            lock_exclusive(&file)?;
        }

        let fend = file.metadata()?.len();
        Ok(Self { file, mode, fpos: 0, fend })
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current file position.
    #[inline]
    pub fn tell(&self) -> u64 {
        self.fpos
    }

    /// Known end-of-file offset.
    #[inline]
    pub fn end(&self) -> u64 {
        self.fend
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.fpos = offset;
        Ok(())
    }

    /// Position at the known end of file.
    pub fn seek_end(&mut self) -> Result<()> {
        self.seek(self.fend)
    }

    /// Read exactly `buf.len()` bytes.  A short read is an I/O error; the
    /// caller sees either a full buffer or a failure.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.file.read_exact(buf) {
            Ok(()) => {
                self.fpos += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Position after a failed read_exact is unspecified; re-sync.
                self.file.seek(SeekFrom::Start(self.fpos))?;
                Err(Error::Io(e))
            }
        }
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes)?;
        self.fpos += bytes.len() as u64;
        if self.fpos > self.fend {
            self.fend = self.fpos;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Discard everything after the current position.
    pub fn truncate_to_current_position(&mut self) -> Result<()> {
        self.file.set_len(self.fpos)?;
        self.fend = self.fpos;
        Ok(())
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn write_extends_end_and_read_roundtrips() {
        let tmp = NamedTempFile::new().unwrap();
        let mut b = Backend::open(tmp.path(), Mode::Write).unwrap();
        b.write(b"hello world").unwrap();
        assert_eq!(b.tell(), 11);
        assert_eq!(b.end(), 11);

        b.seek(6).unwrap();
        let mut buf = [0u8; 5];
        b.read(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
        assert_eq!(b.tell(), 11);
    }

    #[test]
    fn short_read_is_an_error() {
        let tmp = NamedTempFile::new().unwrap();
        let mut b = Backend::open(tmp.path(), Mode::Write).unwrap();
        b.write(b"abc").unwrap();
        b.seek(0).unwrap();
        let mut buf = [0u8; 8];
        assert!(b.read(&mut buf).is_err());
    }

    #[test]
    fn truncate_discards_tail() {
        let tmp = NamedTempFile::new().unwrap();
        let mut b = Backend::open(tmp.path(), Mode::Write).unwrap();
        b.write(&[0u8; 64]).unwrap();
        b.seek(16).unwrap();
        b.truncate_to_current_position().unwrap();
        assert_eq!(b.end(), 16);
        assert_eq!(std::fs::metadata(tmp.path()).unwrap().len(), 16);
    }

    #[test]
    fn append_mode_positions_at_start() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let mut b = Backend::open(tmp.path(), Mode::Write).unwrap();
            b.write(&[7u8; 32]).unwrap();
        }
        let b = Backend::open(tmp.path(), Mode::Append).unwrap();
        assert_eq!(b.tell(), 0);
        assert_eq!(b.end(), 32);
    }
}
