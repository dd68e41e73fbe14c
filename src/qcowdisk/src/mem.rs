//! In-memory backend.
//!
//! Keeps the whole image in a growable byte vector.  Clones share the same contents, so a clone
//! kept aside can reconnect to an image after the device using it has been disconnected.

use crate::backend::{check_request, Backend, BackendOpenOptions, DEFAULT_SECTOR_SIZE};
use crate::io_buffers::{IoVector, IoVectorMut};
use std::io;
#[cfg(any(test, feature = "test_utils"))]
use std::sync::atomic::AtomicBool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Memory-backed storage.
#[derive(Clone, Debug)]
pub struct MemBackend {
    /// Contents.
    data: Arc<RwLock<Vec<u8>>>,

    /// Addressing granularity.
    sector_size: usize,

    /// Whether writes are refused.
    read_only: bool,

    /// Number of write requests served so far.
    writes: Arc<AtomicU64>,

    /// Fail every write request (for error path tests).
    #[cfg(any(test, feature = "test_utils"))]
    fail_writes: Arc<AtomicBool>,
}

impl MemBackend {
    /// Create an empty backend with 512 byte sectors.
    pub fn new() -> Self {
        Self::with_sector_size(DEFAULT_SECTOR_SIZE)
    }

    /// Create an empty backend with the given sector size (a power of two).
    pub fn with_sector_size(sector_size: usize) -> Self {
        MemBackend {
            data: Default::default(),
            sector_size,
            read_only: false,
            writes: Default::default(),
            #[cfg(any(test, feature = "test_utils"))]
            fail_writes: Default::default(),
        }
    }

    /// Create a backend holding `data`.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let backend = Self::new();
        *backend.data.write().unwrap_or_else(|e| e.into_inner()) = data;
        backend
    }

    /// Return a clone sharing the same contents that refuses writes.
    pub fn read_only(&self) -> Self {
        MemBackend {
            read_only: true,
            ..self.clone()
        }
    }

    /// Copy out the current contents.
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        Ok(self.lock_read()?.clone())
    }

    /// Number of write requests served so far (across all clones).
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Let every following write request fail (or stop doing so).
    #[cfg(any(test, feature = "test_utils"))]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Lock the contents for reading.
    fn lock_read(&self) -> io::Result<std::sync::RwLockReadGuard<'_, Vec<u8>>> {
        self.data
            .read()
            .map_err(|_| io::Error::other("Memory backend lock poisoned"))
    }
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemBackend {
    async fn connect(opts: BackendOpenOptions) -> io::Result<Self> {
        if opts.filename.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Memory backends do not take a filename",
            ));
        }

        let mut backend = Self::with_sector_size(opts.checked_sector_size()?);
        backend.read_only = !opts.writable;
        Ok(backend)
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.lock_read()?.len() as u64)
    }

    fn is_writable(&self) -> bool {
        !self.read_only
    }

    async fn read(&self, sector: u64, mut bufv: IoVectorMut<'_>) -> io::Result<()> {
        check_request(self.sector_size, bufv.len())?;
        let data = self.lock_read()?;

        let mut offset = sector
            .checked_mul(self.sector_size as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Offset overflow"))?;
        for buf in bufv.iter_mut() {
            let start = offset.min(data.len() as u64) as usize;
            let end = (offset + buf.len() as u64).min(data.len() as u64) as usize;
            let (present, beyond) = buf.split_at_mut(end - start);
            present.copy_from_slice(&data[start..end]);
            beyond.fill(0);
            offset += buf.len() as u64;
        }
        Ok(())
    }

    async fn write(&self, sector: u64, bufv: IoVector<'_>) -> io::Result<()> {
        if self.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "Memory backend is read-only",
            ));
        }
        #[cfg(any(test, feature = "test_utils"))]
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(io::Error::other("Injected write failure"));
        }
        check_request(self.sector_size, bufv.len())?;

        let offset = sector
            .checked_mul(self.sector_size as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Offset overflow"))?;
        let end: usize = offset
            .checked_add(bufv.len())
            .and_then(|end| end.try_into().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Write too long"))?;

        let mut data = self
            .data
            .write()
            .map_err(|_| io::Error::other("Memory backend lock poisoned"))?;
        if data.len() < end {
            data.resize(end, 0);
        }

        let mut offset = offset as usize;
        for buf in bufv.iter() {
            data[offset..offset + buf.len()].copy_from_slice(buf);
            offset += buf.len();
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        // Nothing to do, there are no buffers
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grows_on_write_and_zero_fills_reads() {
        let backend = MemBackend::new();
        let data = vec![3u8; 1024];
        backend.write(2, (&data).into()).await.unwrap();
        assert_eq!(backend.size().unwrap(), 2048);
        assert_eq!(backend.get_info().unwrap().size_sectors, 4);

        let mut buf = vec![0xffu8; 2048];
        backend.read(2, (&mut buf).into()).await.unwrap();
        assert!(buf[..1024].iter().all(|b| *b == 3));
        assert!(buf[1024..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn clones_share_contents() {
        let backend = MemBackend::new();
        let other = backend.clone();
        backend.write(0, (&vec![9u8; 512]).into()).await.unwrap();
        assert_eq!(other.to_bytes().unwrap(), vec![9u8; 512]);
        assert_eq!(other.write_count(), 1);
    }

    #[tokio::test]
    async fn rejects_partial_sectors_and_read_only_writes() {
        let backend = MemBackend::new();
        assert!(backend.write(0, (&vec![0u8; 100]).into()).await.is_err());

        let ro = backend.read_only();
        assert!(!ro.get_info().unwrap().read_write);
        let err = ro.write(0, (&vec![0u8; 512]).into()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn connect_honours_options() {
        let backend = MemBackend::connect(BackendOpenOptions::new().write(true).sector_size(4096))
            .await
            .unwrap();
        assert_eq!(backend.sector_size(), 4096);
        assert!(backend.is_writable());

        assert!(MemBackend::connect(BackendOpenOptions::new().sector_size(1000))
            .await
            .is_err());
    }
}
