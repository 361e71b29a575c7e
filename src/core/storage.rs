//! Byte-addressable host files
//!
//! The engine never touches the file system directly. Every session owns a
//! [`Storage`] and performs all of its I/O through it, which keeps the codec
//! and allocator free of I/O and lets the SQLite shim plug in the lower VFS
//! file.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Random-access file underneath a session
pub trait Storage {
    /// Read into `buf` starting at `offset`, returning the number of bytes
    /// read. Fewer than `buf.len()` bytes means end of file.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()>;

    fn truncate(&mut self, size: u64) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()>;

    fn size(&mut self) -> io::Result<u64>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Fill `buf` completely or fail with `UnexpectedEof`
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let n = self.read_at(buf, offset)?;
        if n < buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read: {} of {} bytes at {}", n, buf.len(), offset),
            ));
        }
        Ok(())
    }
}

/// Disk-backed storage
pub struct FileStorage {
    file: File,
    path: PathBuf,
}

impl FileStorage {
    /// Open (or create) a read-write file
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Ok(FileStorage {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Create an empty file, discarding any previous contents
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(FileStorage {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn open_read_only<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(&path)?;

        Ok(FileStorage {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for FileStorage {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    fn truncate(&mut self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// In-memory storage
///
/// Clones share the same bytes, so a test can keep a handle, close the
/// session, tamper with the bytes and reopen.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        MemoryStorage {
            data: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    /// Run `f` against the raw bytes
    pub fn with_bytes<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        f(&mut self.data.lock())
    }
}

impl Storage for MemoryStorage {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self.data.lock();
        let start = offset as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> io::Result<()> {
        self.data.lock().resize(size as usize, 0);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.data.lock().len() as u64)
    }
}
