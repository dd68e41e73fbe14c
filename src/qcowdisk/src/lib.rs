#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! Sparse virtual disks in the qcow2 image format.
//!
//! A [`Device`] presents a fixed-size disk addressed in 512 byte sectors.  Storage on the
//! underlying [`Backend`] is only allocated for clusters that have been written; everything else
//! reads as zeroes.
//!
//! ```no_run
//! # let _ = async {
//! use qcowdisk::{CreateOptions, Device, MemBackend};
//!
//! let device = Device::create(MemBackend::new(), 64 << 20, &CreateOptions::new()).await?;
//!
//! let data = vec![42u8; 4096];
//! device.write(8, (&data).into()).await?;
//!
//! let mut buf = vec![0u8; 4096];
//! device.read(8, (&mut buf).into()).await?;
//! assert_eq!(buf, data);
//!
//! device.disconnect().await?;
//! # Ok::<(), qcowdisk::Error>(())
//! # };
//! ```
//!
//! Images live on anything implementing [`Backend`]; [`FileBackend`] stores them in regular
//! files.  With the `sync-wrappers` feature, `SyncDevice` offers the same operations without an
//! async runtime.

mod async_lru_cache;
pub mod backend;
pub mod device;
pub mod error;
pub mod extent;
pub mod file;
pub mod io_buffers;
mod macros;
pub mod mem;
mod misc_helpers;
pub mod qcow2;
#[cfg(feature = "sync-wrappers")]
mod sync_wrappers;

pub use backend::{Backend, BackendExt, BackendInfo, BackendOpenOptions};
pub use device::{CreateOptions, Device, DeviceInfo, Segment, SECTOR_SIZE};
pub use error::{Error, Result};
pub use extent::Extent;
pub use file::FileBackend;
pub use io_buffers::{IoVector, IoVectorMut};
pub use mem::MemBackend;
pub use qcow2::{CheckReport, Header, Version};
#[cfg(feature = "sync-wrappers")]
pub use sync_wrappers::SyncDevice;
