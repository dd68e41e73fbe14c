//! QCOW2 on-disk structures and the engine operating on them.

pub(crate) mod allocator;
mod cache;
pub(crate) mod check;
pub mod header;
pub(crate) mod tables;
pub(crate) mod translation;
pub(crate) mod types;

pub use check::CheckReport;
pub use header::{
    AutoclearFeatures, BackingFile, CompatibleFeatures, FeatureBlock, FeatureName, FeatureType,
    Header, HeaderExtension, IncompatibleFeatures, Version,
};

/// Maximum file length.
///
/// Offsets are limited to 56 bits by the table entry formats.
pub(crate) const MAX_FILE_LENGTH: u64 = 0x0100_0000_0000_0000u64;
