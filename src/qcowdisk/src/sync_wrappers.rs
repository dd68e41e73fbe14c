//! Synchronous wrapper around [`Device`].

use crate::backend::Backend;
use crate::device::{CreateOptions, Device, DeviceInfo, Segment};
use crate::error::{Error, Result};
use crate::io_buffers::{IoVector, IoVectorMut};
use crate::qcow2::{CheckReport, Header};
use std::io;

/// Synchronous wrapper around [`Device`].
///
/// Creates and keeps a tokio runtime in which to run I/O.
#[must_use = "devices must be disconnected to flush outstanding writes"]
pub struct SyncDevice<B: Backend> {
    /// Wrapped asynchronous device.
    inner: Device<B>,

    /// Tokio runtime in which I/O is run.
    runtime: tokio::runtime::Runtime,
}

/// Create a single-threaded runtime for synchronous access.
fn new_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .map_err(|err| {
            Error::Io(io::Error::other(format!(
                "Failed to create a tokio runtime for synchronous device access: {err}"
            )))
        })
}

impl<B: Backend> SyncDevice<B> {
    /// Like [`Device::create()`], but create a synchronous wrapper.
    pub fn create(backend: B, size: u64, opts: &CreateOptions) -> Result<Self> {
        let runtime = new_runtime()?;
        let inner = runtime.block_on(Device::create(backend, size, opts))?;
        Ok(SyncDevice { inner, runtime })
    }

    /// Like [`Device::connect()`], but create a synchronous wrapper.
    pub fn connect(backend: B, writable: bool) -> Result<Self> {
        let runtime = new_runtime()?;
        let inner = runtime.block_on(Device::connect(backend, writable))?;
        Ok(SyncDevice { inner, runtime })
    }

    /// Get a reference to the contained async [`Device`].
    pub fn inner(&self) -> &Device<B> {
        &self.inner
    }

    /// Virtual size in sectors.
    pub fn size_sectors(&self) -> u64 {
        self.inner.size_sectors()
    }

    /// Read from `sector` into `bufv`.
    pub fn readv(&self, sector: u64, bufv: IoVectorMut<'_>) -> Result<()> {
        self.runtime.block_on(self.inner.read(sector, bufv))
    }

    /// Read from `sector` into `buf`.
    pub fn read<'a>(&'a self, sector: u64, buf: impl Into<IoVectorMut<'a>>) -> Result<()> {
        self.readv(sector, buf.into())
    }

    /// Write `bufv` to `sector`.
    pub fn writev(&self, sector: u64, bufv: IoVector<'_>) -> Result<()> {
        self.runtime.block_on(self.inner.write(sector, bufv))
    }

    /// Write `buf` to `sector`.
    pub fn write<'a>(&'a self, sector: u64, buf: impl Into<IoVector<'a>>) -> Result<()> {
        self.writev(sector, buf.into())
    }

    /// Discard `count` sectors from `sector`.
    pub fn discard(&self, sector: u64, count: u64) -> Result<()> {
        self.runtime.block_on(self.inner.discard(sector, count))
    }

    /// Visit all runs of backed and unbacked sectors, see [`Device::fold_over_mapped()`].
    pub fn fold_over_mapped<T, F>(&self, init: T, f: F) -> Result<T>
    where
        F: FnMut(T, Segment) -> T,
    {
        self.runtime.block_on(self.inner.fold_over_mapped(init, f))
    }

    /// Number of sectors stored in the image.
    pub fn allocated_sectors(&self) -> Result<u64> {
        self.runtime.block_on(self.inner.allocated_sectors())
    }

    /// A copy of the current image header.
    pub fn header(&self) -> Header {
        self.runtime.block_on(self.inner.header())
    }

    /// Summarize the device.
    pub fn get_info(&self) -> Result<DeviceInfo> {
        self.runtime.block_on(self.inner.get_info())
    }

    /// Verify the image structure.
    pub fn check(&self) -> Result<CheckReport> {
        self.runtime.block_on(self.inner.check())
    }

    /// Make all completed writes durable.
    pub fn flush(&self) -> Result<()> {
        self.runtime.block_on(self.inner.flush())
    }

    /// Flush and release the backend.
    pub fn disconnect(self) -> Result<()> {
        let SyncDevice { inner, runtime } = self;
        runtime.block_on(inner.disconnect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileBackend;
    use crate::mem::MemBackend;

    #[test]
    fn sync_round_trip() {
        let backend = MemBackend::new();
        let device = SyncDevice::create(backend.clone(), 1 << 20, &CreateOptions::new()).unwrap();
        let data = vec![0x5au8; 1024];
        device.write(3, &data).unwrap();
        device.disconnect().unwrap();

        let device = SyncDevice::connect(backend, false).unwrap();
        let mut buf = vec![0u8; 1024];
        device.read(3, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(device.allocated_sectors().unwrap(), 128);
        assert!(matches!(device.write(0, &data), Err(Error::ReadOnly)));
        device.check().unwrap();
    }

    #[test]
    fn sync_file_image() {
        let file = tempfile::tempfile().unwrap();
        let backend = FileBackend::from_file(file, true).unwrap();
        let device =
            SyncDevice::create(backend, 8 << 20, &CreateOptions::new().cluster_bits(12)).unwrap();
        let data = vec![0xa5u8; 4096];
        device.write(16383 - 7, &data).unwrap();
        device.discard(0, 8).unwrap();

        let mut buf = vec![0u8; 4096];
        device.read(16383 - 7, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(device.header().cluster_bits, 12);
        device.check().unwrap();
        device.disconnect().unwrap();
    }
}
