//! Block storage underneath an image.
//!
//! The image engine does not care where its bytes live.  Anything that can read and write whole
//! sectors, report its size, and flush can serve as a backend; see [`Backend`].  [`BackendExt`]
//! builds byte-addressed access with arbitrary alignment on top of that.

pub mod ext;

use crate::io_buffers::{IoVector, IoVectorMut};
pub use ext::BackendExt;
use std::fmt::Debug;
use std::io;
use std::path::PathBuf;

/// Default backend sector size in bytes.
pub const DEFAULT_SECTOR_SIZE: usize = 512;

/// Parameters from which a backend can be constructed.
#[derive(Clone, Debug)]
pub struct BackendOpenOptions {
    /// Filename to open.
    pub(crate) filename: Option<PathBuf>,

    /// Whether the object should be opened as writable or read-only.
    pub(crate) writable: bool,

    /// Whether to create the file if it does not exist.
    pub(crate) create: bool,

    /// Addressing granularity to use.
    pub(crate) sector_size: usize,
}

/// Information about a connected backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackendInfo {
    /// Size of one addressable unit, in bytes.
    pub sector_size: usize,

    /// Current length in sectors (rounded up).
    pub size_sectors: u64,

    /// Whether writes are permitted.
    pub read_write: bool,
}

/// Sector-addressed storage.
///
/// Requests address `sector_size()` units and must cover whole sectors.  Reads beyond the end
/// return zeroes, writes beyond the end grow the backend.
pub trait Backend: Debug + Send + Sync + Sized {
    /// Connect to a backend object.
    ///
    /// Different backend implementations may require different options.
    #[allow(async_fn_in_trait)] // No need for Send
    async fn connect(_opts: BackendOpenOptions) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!(
                "Cannot connect backends of type {}",
                std::any::type_name::<Self>()
            ),
        ))
    }

    /// Addressing granularity in bytes; a power of two.
    fn sector_size(&self) -> usize;

    /// Current length in bytes.
    fn size(&self) -> io::Result<u64>;

    /// Whether writes are permitted.
    fn is_writable(&self) -> bool;

    /// Summarize size and capabilities.
    fn get_info(&self) -> io::Result<BackendInfo> {
        let sector_size = self.sector_size();
        Ok(BackendInfo {
            sector_size,
            size_sectors: self.size()?.div_ceil(sector_size as u64),
            read_write: self.is_writable(),
        })
    }

    /// Read whole sectors starting at `sector` into `bufv`.
    ///
    /// `bufv.len()` must be a multiple of the sector size.  Never does short reads.
    #[allow(async_fn_in_trait)] // No need for Send
    async fn read(&self, sector: u64, bufv: IoVectorMut<'_>) -> io::Result<()>;

    /// Write whole sectors from `bufv` starting at `sector`.
    ///
    /// `bufv.len()` must be a multiple of the sector size.  Never does short writes.
    #[allow(async_fn_in_trait)] // No need for Send
    async fn write(&self, sector: u64, bufv: IoVector<'_>) -> io::Result<()>;

    /// Make all completed writes durable.
    #[allow(async_fn_in_trait)] // No need for Send
    async fn flush(&self) -> io::Result<()>;

    /// Release the backend.  No request may follow.
    #[allow(async_fn_in_trait)] // No need for Send
    async fn disconnect(&self) -> io::Result<()> {
        self.flush().await
    }

    /// Synchronous wrapper around [`Backend::connect()`].
    #[cfg(feature = "sync-wrappers")]
    fn connect_sync(opts: BackendOpenOptions) -> io::Result<Self> {
        tokio::runtime::Builder::new_current_thread()
            .build()?
            .block_on(Self::connect(opts))
    }
}

impl BackendOpenOptions {
    /// Create default options (read-only, no file name, 512 byte sectors).
    pub fn new() -> Self {
        BackendOpenOptions::default()
    }

    /// Set a filename to open.
    pub fn filename<P: Into<PathBuf>>(mut self, filename: P) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Whether the backend should be writable or not.
    pub fn write(mut self, write: bool) -> Self {
        self.writable = write;
        self
    }

    /// Whether a missing file should be created.
    ///
    /// Implies `write(true)`.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        if create {
            self.writable = true;
        }
        self
    }

    /// Set the sector size (a power of two).
    pub fn sector_size(mut self, sector_size: usize) -> Self {
        self.sector_size = sector_size;
        self
    }

    /// Check the sector size, returning it.
    pub(crate) fn checked_sector_size(&self) -> io::Result<usize> {
        if self.sector_size == 0 || !self.sector_size.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Sector size must be a power of two, not {}",
                    self.sector_size
                ),
            ));
        }
        Ok(self.sector_size)
    }
}

impl Default for BackendOpenOptions {
    fn default() -> Self {
        BackendOpenOptions {
            filename: None,
            writable: false,
            create: false,
            sector_size: DEFAULT_SECTOR_SIZE,
        }
    }
}

/// Check that a request covers whole sectors.
pub(crate) fn check_request(sector_size: usize, len: u64) -> io::Result<()> {
    if len % sector_size as u64 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Request length {len} is not a multiple of the sector size {sector_size}"),
        ));
    }
    Ok(())
}
