//! Use a plain file as a backend.

use crate::backend::{check_request, Backend, BackendOpenOptions, DEFAULT_SECTOR_SIZE};
use crate::io_buffers::{IoVector, IoVectorMut};
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Plain file backend.
#[derive(Debug)]
pub struct FileBackend {
    /// The file.
    file: fs::File,

    /// For debug purposes.
    filename: Option<PathBuf>,

    /// Addressing granularity.
    sector_size: usize,

    /// Whether the file was opened for writing.
    writable: bool,

    /// Cached file length.
    ///
    /// Third parties changing the length concurrently is pretty certain to break things anyway.
    size: AtomicU64,
}

impl FileBackend {
    /// Use an already opened file with 512 byte sectors.
    ///
    /// `writable` must reflect how the file was opened.
    pub fn from_file(file: fs::File, writable: bool) -> io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(FileBackend {
            file,
            filename: None,
            sector_size: DEFAULT_SECTOR_SIZE,
            writable,
            size: AtomicU64::new(size),
        })
    }

    /// Read into `buf` at `offset`, zero-filling anything past the end of file.
    fn read_full_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            #[cfg(unix)]
            let result = self.file.read_at(buf, offset);
            #[cfg(windows)]
            let result = self.file.seek_read(buf, offset);

            match result {
                Ok(0) => {
                    buf.fill(0);
                    break;
                }
                Ok(len) => {
                    buf = &mut buf[len..];
                    offset += len as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Write all of `buf` at `offset`.
    fn write_full_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            #[cfg(unix)]
            let result = self.file.write_at(buf, offset);
            #[cfg(windows)]
            let result = self.file.seek_write(buf, offset);

            match result {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(len) => {
                    buf = &buf[len..];
                    offset += len as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl Backend for FileBackend {
    async fn connect(opts: BackendOpenOptions) -> io::Result<Self> {
        let sector_size = opts.checked_sector_size()?;
        let filename = opts.filename.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Filename required")
        })?;

        let file = fs::OpenOptions::new()
            .read(true)
            .write(opts.writable)
            .create(opts.create)
            .truncate(false)
            .open(&filename)?;

        let mut backend = FileBackend::from_file(file, opts.writable)?;
        backend.filename = Some(filename);
        backend.sector_size = sector_size;
        Ok(backend)
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.size.load(Ordering::Relaxed))
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    async fn read(&self, sector: u64, mut bufv: IoVectorMut<'_>) -> io::Result<()> {
        check_request(self.sector_size, bufv.len())?;

        let mut offset = sector * self.sector_size as u64;
        for buf in bufv.iter_mut() {
            let len = buf.len() as u64;
            self.read_full_at(buf, offset)?;
            offset += len;
        }
        Ok(())
    }

    async fn write(&self, sector: u64, bufv: IoVector<'_>) -> io::Result<()> {
        check_request(self.sector_size, bufv.len())?;

        let mut offset = sector * self.sector_size as u64;
        for buf in bufv.iter() {
            self.write_full_at(buf, offset)?;
            offset += buf.len() as u64;
        }

        self.size.fetch_max(offset, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        if self.writable {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

impl Display for FileBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(filename) = self.filename.as_ref() {
            write!(f, "file:{filename:?}")
        } else {
            write!(f, "file:<unknown path>")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let opts = BackendOpenOptions::new().filename(&path).create(true);
        let backend = FileBackend::connect(opts).await.unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        backend.write(1, (&vec![0x42u8; 512]).into()).await.unwrap();
        assert_eq!(backend.get_info().unwrap().size_sectors, 2);
        backend.disconnect().await.unwrap();
        drop(backend);

        let backend = FileBackend::connect(BackendOpenOptions::new().filename(&path))
            .await
            .unwrap();
        assert!(!backend.is_writable());
        let mut buf = vec![0xffu8; 1536];
        backend.read(0, (&mut buf).into()).await.unwrap();
        assert!(buf[..512].iter().all(|b| *b == 0));
        assert!(buf[512..1024].iter().all(|b| *b == 0x42));
        assert!(buf[1024..].iter().all(|b| *b == 0));
        assert!(backend.to_string().contains("disk.img"));
    }

    #[tokio::test]
    async fn missing_file_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let opts = BackendOpenOptions::new().filename(dir.path().join("nope"));
        assert!(FileBackend::connect(opts).await.is_err());
    }
}
