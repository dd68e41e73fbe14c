//! Provides the `BackendExt` trait for more convenient access.
//!
//! `Backend` is provided by the driver, so is supposed to be simple and only deal in whole
//! sectors.  `BackendExt` builds on that to allow byte-addressed requests of any alignment.

use super::Backend;
use crate::io_buffers::{IoVector, IoVectorMut};
use std::io;
use tracing::trace;

/// Helper methods for backends.
pub trait BackendExt: Backend {
    /// Read data at byte `offset` into `bufv`.
    ///
    /// Unaligned requests are widened to whole sectors using a bounce buffer.
    #[allow(async_fn_in_trait)] // No need for Send
    async fn read_at(&self, bufv: IoVectorMut<'_>, offset: u64) -> io::Result<()>;

    /// Write data from `bufv` to byte `offset`.
    ///
    /// Unaligned requests are widened to whole sectors with a read-modify-write cycle.  That cycle
    /// does not block concurrent writers; callers must serialize writes touching the same sectors.
    #[allow(async_fn_in_trait)] // No need for Send
    async fn write_at(&self, bufv: IoVector<'_>, offset: u64) -> io::Result<()>;

    /// Read `length` bytes at byte `offset` into a new buffer.
    #[allow(async_fn_in_trait)] // No need for Send
    async fn read_bytes(&self, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        self.read_at((&mut buf).into(), offset).await?;
        Ok(buf)
    }

    /// Whether a byte request at `offset` of `length` bytes covers whole sectors only.
    fn is_aligned(&self, offset: u64, length: u64) -> bool {
        let mask = self.sector_size() as u64 - 1;
        offset & mask == 0 && length & mask == 0
    }
}

impl<B: Backend> BackendExt for B {
    async fn read_at(&self, mut bufv: IoVectorMut<'_>, offset: u64) -> io::Result<()> {
        if bufv.is_empty() {
            return Ok(());
        }

        let sector_size = self.sector_size() as u64;
        if self.is_aligned(offset, bufv.len()) {
            return self.read(offset / sector_size, bufv).await;
        }

        let (padded_offset, padded_len) = pad(offset, bufv.len(), sector_size)?;
        trace!("Unaligned read: {offset:#x} + {}, padded to {padded_offset:#x} + {padded_len}", bufv.len());

        let mut bounce = vec![0u8; padded_len];
        self.read(padded_offset / sector_size, (&mut bounce).into())
            .await?;

        let start = (offset - padded_offset) as usize;
        let end = start + bufv.len() as usize;
        bufv.copy_from_slice(&bounce[start..end]);
        Ok(())
    }

    async fn write_at(&self, bufv: IoVector<'_>, offset: u64) -> io::Result<()> {
        if bufv.is_empty() {
            return Ok(());
        }

        let sector_size = self.sector_size() as u64;
        if self.is_aligned(offset, bufv.len()) {
            return self.write(offset / sector_size, bufv).await;
        }

        let (padded_offset, padded_len) = pad(offset, bufv.len(), sector_size)?;
        trace!("Unaligned write: {offset:#x} + {}, padded to {padded_offset:#x} + {padded_len}", bufv.len());

        let mut bounce = vec![0u8; padded_len];
        self.read(padded_offset / sector_size, (&mut bounce).into())
            .await?;

        let start = (offset - padded_offset) as usize;
        let end = start + bufv.len() as usize;
        bufv.copy_into_slice(&mut bounce[start..end]);

        self.write(padded_offset / sector_size, (&bounce).into())
            .await
    }
}

/// Widen `offset..offset + length` to whole sectors.
///
/// Returns the aligned start and the padded length.
fn pad(offset: u64, length: u64, sector_size: u64) -> io::Result<(u64, usize)> {
    let mask = sector_size - 1;
    let end = offset
        .checked_add(length)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Request end overflows"))?;
    let padded_offset = offset & !mask;
    let padded_end = end
        .checked_next_multiple_of(sector_size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Request end overflows"))?;
    let padded_len = (padded_end - padded_offset)
        .try_into()
        .map_err(|e| io::Error::other(format!("Cannot realign request: {e}")))?;
    Ok((padded_offset, padded_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemBackend;

    #[tokio::test]
    async fn unaligned_write_preserves_neighbours() {
        let backend = MemBackend::with_sector_size(4096);
        backend.write_at((&vec![0xaa; 8192]).into(), 0).await.unwrap();
        backend.write_at((&vec![0x55; 10]).into(), 4090).await.unwrap();

        let data = backend.read_bytes(0, 8192).await.unwrap();
        assert!(data[..4090].iter().all(|b| *b == 0xaa));
        assert!(data[4090..4100].iter().all(|b| *b == 0x55));
        assert!(data[4100..].iter().all(|b| *b == 0xaa));
    }

    #[tokio::test]
    async fn unaligned_read_past_end_reads_zero() {
        let backend = MemBackend::new();
        backend.write_at((&vec![1u8; 512]).into(), 0).await.unwrap();
        let data = backend.read_bytes(500, 100).await.unwrap();
        assert!(data[..12].iter().all(|b| *b == 1));
        assert!(data[12..].iter().all(|b| *b == 0));
    }

    #[test]
    fn padding() {
        assert_eq!(pad(0, 512, 512).unwrap(), (0, 512));
        assert_eq!(pad(8, 8, 512).unwrap(), (0, 512));
        assert_eq!(pad(510, 4, 512).unwrap(), (0, 1024));
        assert!(pad(u64::MAX - 1, 8, 512).is_err());
    }
}
