//! Image header codec.
//!
//! Decodes and encodes the fixed header at the start of every image, the v3 feature block, and
//! the header extension records following it.  Decoding and encoding are pure; reading the header
//! cluster from the backend and writing it back is up to the caller.

use crate::error::{Error, Result};
use crate::macros::wire_enum;
use bincode::Options;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::cmp;

/// First four bytes of every image: "QFI" followed by 0xfb.
pub const MAGIC: u32 = 0x51_46_49_fb;

/// Minimum log2 of the cluster size.
pub const MIN_CLUSTER_BITS: u32 = 9;

/// Maximum log2 of the cluster size (2 MiB clusters).
pub const MAX_CLUSTER_BITS: u32 = 21;

/// Maximum log2 of the refcount width in bits.
pub const MAX_REFCOUNT_ORDER: u32 = 6;

/// Refcount order implied by version 2 images.
pub const V2_REFCOUNT_ORDER: u32 = 4;

/// Maximum length of the backing file name.
pub const MAX_BACKING_FILE_NAME: u32 = 1023;

/// Length of a feature name table entry.
const FEATURE_NAME_ENTRY_SIZE: usize = 48;

/// Length of the name in a feature name table entry.
const FEATURE_NAME_SIZE: usize = FEATURE_NAME_ENTRY_SIZE - 2;

/// Fixed part of the header, common to all versions.
#[derive(Deserialize, Serialize)]
struct FixedFields {
    /// Must be [`MAGIC`].
    magic: u32,

    /// 2 or 3.
    version: u32,

    /// Offset of the backing file name (not NUL terminated), 0 if there is none.
    backing_file_offset: u64,

    /// Length of the backing file name in bytes.
    backing_file_size: u32,

    cluster_bits: u32,

    /// Guest-visible size.
    size: u64,

    /// 0 for plain images; 1 is AES, 2 is LUKS.
    crypt_method: u32,

    /// L1 entry count.
    l1_size: u32,

    /// Offset of the active L1 table.  Cluster-aligned.
    l1_table_offset: u64,

    /// Offset of the refcount table.  Cluster-aligned.
    refcount_table_offset: u64,

    /// Number of clusters the refcount table occupies.
    refcount_table_clusters: u32,

    /// Internal snapshot count.
    nb_snapshots: u32,

    /// Offset of the snapshot table.  Cluster-aligned.
    snapshots_offset: u64,
}

impl FixedFields {
    /// Encoded length.
    const RAW_SIZE: usize = 72;
}

/// Feature block following the fixed part in v3 images.
#[derive(Deserialize, Serialize)]
struct FeatureFields {
    /// Bitmask of incompatible features.
    incompatible_features: u64,

    /// Bitmask of compatible features.
    compatible_features: u64,

    /// Bitmask of auto-clear features.
    autoclear_features: u64,

    /// Refcount width is `1 << refcount_order` bits.
    refcount_order: u32,

    /// Length of the header structure in bytes, at least 104, a multiple of 8.
    header_length: u32,
}

impl FeatureFields {
    /// Encoded length; the v3 header is 104 bytes in total.
    const RAW_SIZE: usize = 104 - FixedFields::RAW_SIZE;
}

/// Type and length preceding each extension’s data.
#[derive(Deserialize, Serialize)]
struct ExtensionHead {
    extension_type: u32,

    /// Unpadded data length.
    length: u32,
}

impl ExtensionHead {
    /// Encoded length.
    const RAW_SIZE: usize = 8;
}

wire_enum! {
    /// Format generation.
    pub enum Version: u32 {
        /// Version 2: fixed 72 byte header, 16 bit refcounts.
        V2 = 2,
        /// Version 3: feature bitmasks, variable refcount width, zero clusters.
        V3 = 3,
    }
}

wire_enum! {
    /// Extension types this crate interprets.
    enum ExtensionKind: u32 {
        /// Terminates the list.
        End = 0,
        BackingFileFormat = 0xe2792aca,
        FeatureNameTable = 0x6803f857,
        ExternalDataFileName = 0x44415441,
    }
}

wire_enum! {
    /// Which of the three feature masks a feature name refers to.
    pub enum FeatureType: u8 {
        /// [`IncompatibleFeatures`]
        Incompatible = 0,
        /// [`CompatibleFeatures`]
        Compatible = 1,
        /// [`AutoclearFeatures`]
        Autoclear = 2,
    }
}

bitflags! {
    /// Incompatible feature bits.
    ///
    /// An implementation must refuse to open an image with unknown incompatible bits set.
    pub struct IncompatibleFeatures: u64 {
        /// Refcounts may be inconsistent.
        const DIRTY = 1 << 0;
        /// Any data structure may be corrupt; the image must not be written to.
        const CORRUPT = 1 << 1;
        /// Guest data lives in an external data file.
        const EXTERNAL_DATA_FILE = 1 << 2;
        /// Compressed clusters use a non-default compression type.
        const COMPRESSION_TYPE = 1 << 3;
        /// L2 entries carry subcluster allocation bitmaps.
        const EXTENDED_L2_ENTRIES = 1 << 4;
    }
}

bitflags! {
    /// Compatible feature bits.
    pub struct CompatibleFeatures: u64 {
        /// Refcount updates may be postponed while the image is marked dirty.
        const LAZY_REFCOUNTS = 1 << 0;
    }
}

bitflags! {
    /// Auto-clear feature bits.
    ///
    /// A writer must clear any bit it does not understand before modifying the image.
    pub struct AutoclearFeatures: u64 {
        /// Bitmaps extension data is consistent.
        const BITMAPS = 1 << 0;
        /// The external data file is a consistent raw image.
        const RAW_EXTERNAL_DATA = 1 << 1;
    }
}

/// Location of the backing file name string.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackingFile {
    /// Byte offset of the name in the image.
    pub offset: u64,

    /// Length of the name in bytes.
    pub length: u32,
}

/// V3 feature block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FeatureBlock {
    /// Raw incompatible feature mask (unknown bits included).
    pub incompatible: u64,

    /// Raw compatible feature mask (unknown bits included).
    pub compatible: u64,

    /// Raw auto-clear feature mask (unknown bits included).
    pub autoclear: u64,

    /// log2 of the refcount width in bits.
    pub refcount_order: u32,

    /// Header fields beyond the 104 byte base, kept verbatim (length is a multiple of 8).
    pub additional_fields: Vec<u8>,
}

/// Entry of the feature name table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FeatureName {
    /// Raw feature type (see [`FeatureType`]); unknown types are kept as they are.
    pub feature_type: u8,

    /// Bit number inside the respective mask.
    pub bit: u8,

    /// Human-readable name (at most 46 bytes).
    pub name: String,
}

/// Header extension record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HeaderExtension {
    /// Format name of the backing file, e.g. `raw`.
    BackingFileFormat(String),

    /// Map of feature bits to human-readable names, in on-disk order.
    FeatureNameTable(Vec<FeatureName>),

    /// Name of the file holding guest data (not supported for I/O).
    ExternalDataFileName(String),

    /// Unknown extension, kept verbatim.
    Unknown {
        /// Raw type code.
        extension_type: u32,
        /// Payload without padding.
        data: Vec<u8>,
    },
}

/// Decoded image header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    /// Format version.
    pub version: Version,

    /// Backing file name location, if any.
    pub backing_file: Option<BackingFile>,

    /// log2 of the cluster size.
    pub cluster_bits: u32,

    /// Virtual disk size in bytes.
    pub size: u64,

    /// Encryption method (0 means none).
    pub crypt_method: u32,

    /// Number of L1 table entries.
    pub l1_size: u32,

    /// Offset of the L1 table.
    pub l1_table_offset: u64,

    /// Offset of the refcount table.
    pub refcount_table_offset: u64,

    /// Number of clusters occupied by the refcount table.
    pub refcount_table_clusters: u32,

    /// Number of internal snapshots.
    pub nb_snapshots: u32,

    /// Offset of the snapshot table.
    pub snapshots_offset: u64,

    /// Feature block; always present for v3, never for v2.
    pub features: Option<FeatureBlock>,

    /// Header extensions, in on-disk order.
    pub extensions: Vec<HeaderExtension>,
}

/// Big-endian fixed-width serialization, as the format requires.
fn bincode_options() -> impl Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
}

/// Generate an [`Error::MalformedHeader`].
fn malformed<S: Into<String>>(msg: S) -> Error {
    Error::MalformedHeader(msg.into())
}

/// Generate an [`Error::MalformedExtension`].
fn malformed_ext<S: Into<String>>(msg: S) -> Error {
    Error::MalformedExtension(msg.into())
}

impl Header {
    /// Create a fresh header for an image of `size` bytes.
    ///
    /// Table locations are left at zero; the caller lays out the image and fills them in.
    pub fn new(version: Version, cluster_bits: u32, refcount_order: u32, size: u64) -> Self {
        let features = match version {
            Version::V2 => None,
            Version::V3 => Some(FeatureBlock {
                incompatible: 0,
                compatible: 0,
                autoclear: 0,
                refcount_order,
                additional_fields: Vec::new(),
            }),
        };

        Header {
            version,
            backing_file: None,
            cluster_bits,
            size,
            crypt_method: 0,
            l1_size: 0,
            l1_table_offset: 0,
            refcount_table_offset: 0,
            refcount_table_clusters: 0,
            nb_snapshots: 0,
            snapshots_offset: 0,
            features,
            extensions: Vec::new(),
        }
    }

    /// Decode a header from the start of an image.
    ///
    /// `bytes` should be the whole first cluster; it must at least contain the header, all
    /// extensions, and the end-of-extensions marker.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bincode = bincode_options();

        if bytes.len() < FixedFields::RAW_SIZE {
            return Err(malformed(format!(
                "Header truncated: {} < {} bytes",
                bytes.len(),
                FixedFields::RAW_SIZE
            )));
        }

        let v2: FixedFields = bincode
            .deserialize(&bytes[..FixedFields::RAW_SIZE])
            .map_err(|e| malformed(e.to_string()))?;
        if v2.magic != MAGIC {
            return Err(malformed(format!("Bad magic 0x{:08x}", v2.magic)));
        }

        let version = Version::try_from(v2.version).map_err(Error::UnsupportedVersion)?;

        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&v2.cluster_bits) {
            return Err(malformed(format!(
                "Invalid cluster size: 2^{}; must be between 2^{} and 2^{}",
                v2.cluster_bits, MIN_CLUSTER_BITS, MAX_CLUSTER_BITS,
            )));
        }
        let cluster_size = 1u64 << v2.cluster_bits;

        let (features, ext_start) = match version {
            Version::V2 => (None, FixedFields::RAW_SIZE),
            Version::V3 => {
                let base_end = FixedFields::RAW_SIZE + FeatureFields::RAW_SIZE;
                if bytes.len() < base_end {
                    return Err(malformed(format!(
                        "v3 header truncated: {} < {} bytes",
                        bytes.len(),
                        base_end
                    )));
                }
                let v3: FeatureFields = bincode
                    .deserialize(&bytes[FixedFields::RAW_SIZE..base_end])
                    .map_err(|e| malformed(e.to_string()))?;

                let header_length = v3.header_length as usize;
                if header_length < base_end {
                    return Err(malformed(format!(
                        "Header too short: {header_length} < {base_end}"
                    )));
                }
                if header_length % 8 != 0 {
                    return Err(malformed(format!(
                        "Header length {header_length} is not a multiple of 8"
                    )));
                }
                if header_length as u64 > cluster_size || header_length > bytes.len() {
                    return Err(malformed(format!(
                        "Header length {header_length} exceeds the first cluster"
                    )));
                }

                if v3.refcount_order > MAX_REFCOUNT_ORDER {
                    return Err(malformed(format!(
                        "Invalid refcount width: 2^{}; must not exceed 2^{}",
                        v3.refcount_order, MAX_REFCOUNT_ORDER
                    )));
                }

                let features = FeatureBlock {
                    incompatible: v3.incompatible_features,
                    compatible: v3.compatible_features,
                    autoclear: v3.autoclear_features,
                    refcount_order: v3.refcount_order,
                    additional_fields: bytes[base_end..header_length].to_vec(),
                };
                (Some(features), header_length)
            }
        };

        if v2.l1_table_offset % cluster_size != 0 {
            return Err(malformed(format!(
                "Unaligned L1 table: 0x{:x}",
                v2.l1_table_offset
            )));
        }
        if v2.refcount_table_offset % cluster_size != 0 {
            return Err(malformed(format!(
                "Unaligned refcount table: 0x{:x}",
                v2.refcount_table_offset
            )));
        }

        let required_l1 = Self::required_l1_entries(v2.size, v2.cluster_bits);
        if (v2.l1_size as u64) < required_l1 {
            return Err(malformed(format!(
                "L1 table too small for the disk size: {} < {}",
                v2.l1_size, required_l1
            )));
        }

        let backing_file = if v2.backing_file_offset != 0 {
            let (offset, length) = (v2.backing_file_offset, v2.backing_file_size);
            if length > MAX_BACKING_FILE_NAME {
                return Err(malformed(format!(
                    "Backing file name is too long ({length}, must not exceed {MAX_BACKING_FILE_NAME})"
                )));
            }
            let end = offset
                .checked_add(length as u64)
                .ok_or_else(|| malformed("Backing file name offset is invalid (too high)"))?;
            if end > cluster_size {
                return Err(malformed(
                    "Backing file name offset is invalid (beyond first cluster)",
                ));
            }
            Some(BackingFile { offset, length })
        } else {
            None
        };

        let extensions = Self::decode_extensions(bytes, ext_start, cluster_size)?;

        Ok(Header {
            version,
            backing_file,
            cluster_bits: v2.cluster_bits,
            size: v2.size,
            crypt_method: v2.crypt_method,
            l1_size: v2.l1_size,
            l1_table_offset: v2.l1_table_offset,
            refcount_table_offset: v2.refcount_table_offset,
            refcount_table_clusters: v2.refcount_table_clusters,
            nb_snapshots: v2.nb_snapshots,
            snapshots_offset: v2.snapshots_offset,
            features,
            extensions,
        })
    }

    /// Decode the extension chain starting at `offset`.
    fn decode_extensions(bytes: &[u8], mut offset: usize, cluster_size: u64) -> Result<Vec<HeaderExtension>> {
        let bincode = bincode_options();
        let limit = cmp::min(bytes.len() as u64, cluster_size) as usize;
        let mut extensions = Vec::new();

        loop {
            let hdr_end = offset + ExtensionHead::RAW_SIZE;
            if hdr_end > limit {
                return Err(malformed_ext(format!(
                    "Extension chain is not terminated within {limit} bytes"
                )));
            }

            let ext_hdr: ExtensionHead = bincode
                .deserialize(&bytes[offset..hdr_end])
                .map_err(|e| malformed_ext(e.to_string()))?;

            let data_end = (hdr_end as u64) + ext_hdr.length as u64;
            if data_end > limit as u64 {
                return Err(malformed_ext(format!(
                    "Extension 0x{:08x} of {} bytes exceeds the header area",
                    ext_hdr.extension_type, ext_hdr.length
                )));
            }
            let data = bytes[hdr_end..data_end as usize].to_vec();
            offset = (data_end as usize).next_multiple_of(8);

            match HeaderExtension::deserialize(ext_hdr.extension_type, data)? {
                Some(ext) => extensions.push(ext),
                None => break,
            }
        }

        Ok(extensions)
    }

    /// Encode this header, including its extensions and the end marker.
    ///
    /// The result is a multiple of 8 bytes long.  The backing file name string is not part of it.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bincode = bincode_options();

        let (backing_file_offset, backing_file_size) = self
            .backing_file
            .map(|b| (b.offset, b.length))
            .unwrap_or((0, 0));

        let v2 = FixedFields {
            magic: MAGIC,
            version: self.version.into(),
            backing_file_offset,
            backing_file_size,
            cluster_bits: self.cluster_bits,
            size: self.size,
            crypt_method: self.crypt_method,
            l1_size: self.l1_size,
            l1_table_offset: self.l1_table_offset,
            refcount_table_offset: self.refcount_table_offset,
            refcount_table_clusters: self.refcount_table_clusters,
            nb_snapshots: self.nb_snapshots,
            snapshots_offset: self.snapshots_offset,
        };
        let mut buf = bincode.serialize(&v2).map_err(|e| malformed(e.to_string()))?;

        match (self.version, self.features.as_ref()) {
            (Version::V2, None) => (),
            (Version::V3, Some(features)) => {
                let additional_len = features.additional_fields.len().next_multiple_of(8);
                let header_length = FixedFields::RAW_SIZE + FeatureFields::RAW_SIZE + additional_len;
                let v3 = FeatureFields {
                    incompatible_features: features.incompatible,
                    compatible_features: features.compatible,
                    autoclear_features: features.autoclear,
                    refcount_order: features.refcount_order,
                    header_length: header_length
                        .try_into()
                        .map_err(|_| malformed("Header length overflow"))?,
                };
                buf.append(&mut bincode.serialize(&v3).map_err(|e| malformed(e.to_string()))?);
                buf.extend_from_slice(&features.additional_fields);
                buf.resize(header_length, 0);
            }
            (Version::V2, Some(_)) => {
                return Err(malformed("Version 2 headers cannot carry a feature block"))
            }
            (Version::V3, None) => return Err(malformed("Version 3 headers need a feature block")),
        }

        for ext in &self.extensions {
            let mut data = ext.serialize_data();
            let ext_hdr = ExtensionHead {
                extension_type: ext.extension_type(),
                length: data.len().try_into().map_err(|_| {
                    malformed_ext(format!("Header extension too long ({})", data.len()))
                })?,
            };
            buf.append(&mut bincode.serialize(&ext_hdr).map_err(|e| malformed_ext(e.to_string()))?);
            buf.append(&mut data);
            buf.resize(buf.len().next_multiple_of(8), 0);
        }

        let end = ExtensionHead {
            extension_type: ExtensionKind::End.into(),
            length: 0,
        };
        buf.append(&mut bincode.serialize(&end).map_err(|e| malformed_ext(e.to_string()))?);

        Ok(buf)
    }

    /// Minimum number of L1 entries needed to address `size` bytes.
    pub fn required_l1_entries(size: u64, cluster_bits: u32) -> u64 {
        // Each L1 entry covers one L2 table's worth of clusters
        let l2_coverage_bits = cluster_bits + (cluster_bits - 3);
        size.div_ceil(1u64 << l2_coverage_bits)
    }

    /// Bytes per cluster.
    pub fn cluster_size(&self) -> usize {
        1 << self.cluster_bits
    }

    /// Refcounts are `1 << refcount_order()` bits wide; v2 images always use 16.
    pub fn refcount_order(&self) -> u32 {
        self.features
            .as_ref()
            .map(|f| f.refcount_order)
            .unwrap_or(V2_REFCOUNT_ORDER)
    }

    /// Each refcount block holds `1 << rb_bits()` refcounts.
    pub fn rb_bits(&self) -> u32 {
        // log2(cluster_size >> (refcount_order - 3)), written so sub-byte widths work
        self.cluster_bits + 3 - self.refcount_order()
    }

    /// Refcounts per refcount block.
    pub fn rb_entries(&self) -> usize {
        1 << self.rb_bits()
    }

    /// Refcount table length in entries.
    pub fn reftable_entries(&self) -> usize {
        (self.refcount_table_clusters as usize) << (self.cluster_bits - 3)
    }

    /// Known incompatible features that are set.
    pub fn incompatible_features(&self) -> IncompatibleFeatures {
        IncompatibleFeatures::from_bits_truncate(self.raw_incompatible())
    }

    /// Incompatible feature bits this implementation does not know.
    pub fn unknown_incompatible_features(&self) -> u64 {
        self.raw_incompatible() & !IncompatibleFeatures::all().bits()
    }

    /// Known compatible features that are set.
    pub fn compatible_features(&self) -> CompatibleFeatures {
        CompatibleFeatures::from_bits_truncate(self.features.as_ref().map_or(0, |f| f.compatible))
    }

    /// Known auto-clear features that are set.
    pub fn autoclear_features(&self) -> AutoclearFeatures {
        AutoclearFeatures::from_bits_truncate(self.features.as_ref().map_or(0, |f| f.autoclear))
    }

    /// Whether any auto-clear bit (known or not) is set.
    pub fn has_autoclear_bits(&self) -> bool {
        self.features.as_ref().is_some_and(|f| f.autoclear != 0)
    }

    /// Clear all auto-clear bits.
    ///
    /// Returns whether anything changed.
    pub fn clear_autoclear_bits(&mut self) -> bool {
        match self.features.as_mut() {
            Some(f) if f.autoclear != 0 => {
                f.autoclear = 0;
                true
            }
            _ => false,
        }
    }

    /// Raw incompatible feature mask (0 for v2).
    fn raw_incompatible(&self) -> u64 {
        self.features.as_ref().map_or(0, |f| f.incompatible)
    }

    /// Backing format string from the header extensions (if any).
    pub fn backing_format(&self) -> Option<&str> {
        self.extensions.iter().find_map(|e| match e {
            HeaderExtension::BackingFileFormat(fmt) => Some(fmt.as_str()),
            _ => None,
        })
    }

    /// External data file name from the header extensions (if any).
    pub fn external_data_file_name(&self) -> Option<&str> {
        self.extensions.iter().find_map(|e| match e {
            HeaderExtension::ExternalDataFileName(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Name of feature `bit` as given by the image’s feature name table.
    pub fn feature_name(&self, feat_type: FeatureType, bit: u8) -> Option<&str> {
        self.extensions
            .iter()
            .filter_map(|e| match e {
                HeaderExtension::FeatureNameTable(names) => Some(names),
                _ => None,
            })
            .flatten()
            .find(|f| f.feature_type == u8::from(feat_type) && f.bit == bit)
            .map(|f| f.name.as_str())
    }

    /// Describe all set bits of `mask`, naming them where the feature name table allows.
    pub(crate) fn describe_features(&self, feat_type: FeatureType, mask: u64) -> String {
        (0..64u8)
            .filter(|bit| mask & (1u64 << bit) != 0)
            .map(|bit| match self.feature_name(feat_type, bit) {
                Some(name) => format!("{bit} ({name})"),
                None => format!("{bit}"),
            })
            .collect::<Vec<String>>()
            .join(", ")
    }
}

impl HeaderExtension {
    /// Interpret one extension.
    ///
    /// `None` marks the end of the list.  Types not known here become [`HeaderExtension::Unknown`].
    fn deserialize(ext_type: u32, data: Vec<u8>) -> Result<Option<Self>> {
        let Ok(known) = ExtensionKind::try_from(ext_type) else {
            return Ok(Some(HeaderExtension::Unknown {
                extension_type: ext_type,
                data,
            }));
        };

        let ext = match known {
            ExtensionKind::End => return Ok(None),
            ExtensionKind::BackingFileFormat => {
                let fmt = String::from_utf8(data)
                    .map_err(|err| malformed_ext(format!("Invalid backing file format: {err}")))?;
                HeaderExtension::BackingFileFormat(fmt)
            }
            ExtensionKind::FeatureNameTable => {
                if data.len() % FEATURE_NAME_ENTRY_SIZE != 0 {
                    return Err(malformed_ext(format!(
                        "Feature name table length {} is not a multiple of {}",
                        data.len(),
                        FEATURE_NAME_ENTRY_SIZE
                    )));
                }
                let feats = data
                    .chunks(FEATURE_NAME_ENTRY_SIZE)
                    .map(|feat| {
                        // May not be NUL-terminated; cut at the first NUL if there is one
                        let name_bytes = feat[2..].split(|c| *c == 0).next().unwrap_or(&[]);
                        FeatureName {
                            feature_type: feat[0],
                            bit: feat[1],
                            name: String::from_utf8_lossy(name_bytes).into_owned(),
                        }
                    })
                    .collect();
                HeaderExtension::FeatureNameTable(feats)
            }
            ExtensionKind::ExternalDataFileName => {
                let filename = String::from_utf8(data).map_err(|err| {
                    malformed_ext(format!("Invalid external data file name: {err}"))
                })?;
                HeaderExtension::ExternalDataFileName(filename)
            }
        };

        Ok(Some(ext))
    }

    /// Raw type code.
    fn extension_type(&self) -> u32 {
        match self {
            HeaderExtension::BackingFileFormat(_) => u32::from(ExtensionKind::BackingFileFormat),
            HeaderExtension::FeatureNameTable(_) => u32::from(ExtensionKind::FeatureNameTable),
            HeaderExtension::ExternalDataFileName(_) => {
                u32::from(ExtensionKind::ExternalDataFileName)
            }
            HeaderExtension::Unknown { extension_type, .. } => *extension_type,
        }
    }

    /// Serialize this extension’s data (excluding its header).
    fn serialize_data(&self) -> Vec<u8> {
        match self {
            HeaderExtension::BackingFileFormat(fmt) => fmt.as_bytes().into(),
            HeaderExtension::FeatureNameTable(feats) => {
                let mut result = Vec::with_capacity(feats.len() * FEATURE_NAME_ENTRY_SIZE);
                for feat in feats {
                    result.push(feat.feature_type);
                    result.push(feat.bit);

                    let mut name = [0u8; FEATURE_NAME_SIZE];
                    let raw_name = feat.name.as_bytes();
                    // Byte-wise truncation; a multibyte character may be cut
                    let len = cmp::min(raw_name.len(), FEATURE_NAME_SIZE);
                    name[..len].copy_from_slice(&raw_name[..len]);
                    result.extend_from_slice(&name);
                }
                result
            }
            HeaderExtension::ExternalDataFileName(filename) => filename.as_bytes().into(),
            HeaderExtension::Unknown { data, .. } => data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// A minimal valid v3 header for a 1 MiB disk with 64k clusters.
    fn sample_v3() -> Header {
        let mut h = Header::new(Version::V3, 16, 4, 1 << 20);
        h.l1_size = 1;
        h.l1_table_offset = 0x20000;
        h.refcount_table_offset = 0x10000;
        h.refcount_table_clusters = 1;
        h
    }

    /// Pad an encoded header to a full cluster, as it is found on disk.
    fn on_disk(h: &Header) -> Vec<u8> {
        let mut bytes = h.encode().unwrap();
        bytes.resize(h.cluster_size(), 0);
        bytes
    }

    #[test]
    fn v3_layout() {
        let h = sample_v3();
        let bytes = h.encode().unwrap();
        // 104 byte header plus end marker
        assert_eq!(bytes.len(), 112);
        assert_eq!(&bytes[0..4], &[0x51, 0x46, 0x49, 0xfb]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 3]);
        assert_eq!(&bytes[20..24], &[0, 0, 0, 16]);
        // header_length
        assert_eq!(&bytes[100..104], &[0, 0, 0, 104]);
        assert_eq!(Header::decode(&bytes).unwrap(), h);
    }

    #[test]
    fn v2_layout() {
        let mut h = Header::new(Version::V2, 16, 4, 1 << 20);
        h.l1_size = 1;
        h.l1_table_offset = 0x20000;
        h.refcount_table_offset = 0x10000;
        h.refcount_table_clusters = 1;
        let bytes = h.encode().unwrap();
        assert_eq!(bytes.len(), 80);
        let decoded = Header::decode(&on_disk(&h)).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(decoded.refcount_order(), 4);
        assert_eq!(decoded.rb_bits(), 15);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut bytes = on_disk(&sample_v3());
        bytes[0] = 0;
        assert!(matches!(Header::decode(&bytes), Err(Error::MalformedHeader(_))));

        let mut bytes = on_disk(&sample_v3());
        bytes[7] = 4;
        assert!(matches!(
            Header::decode(&bytes),
            Err(Error::UnsupportedVersion(4))
        ));

        assert!(matches!(
            Header::decode(&[0x51, 0x46, 0x49, 0xfb]),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn rejects_invariant_violations() {
        let mut h = sample_v3();
        h.cluster_bits = 22;
        assert!(matches!(
            Header::decode(&h.encode().unwrap()),
            Err(Error::MalformedHeader(_))
        ));

        let mut h = sample_v3();
        h.l1_table_offset = 0x20200;
        assert!(matches!(
            Header::decode(&on_disk(&h)),
            Err(Error::MalformedHeader(_))
        ));

        let mut h = sample_v3();
        h.features.as_mut().unwrap().refcount_order = 7;
        assert!(matches!(
            Header::decode(&on_disk(&h)),
            Err(Error::MalformedHeader(_))
        ));

        let mut h = sample_v3();
        h.size = 1 << 40;
        assert!(matches!(
            Header::decode(&on_disk(&h)),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn unterminated_extensions() {
        let mut h = sample_v3();
        h.extensions
            .push(HeaderExtension::BackingFileFormat(String::from("raw")));
        let bytes = h.encode().unwrap();
        // Cut off the end marker
        let truncated = &bytes[..bytes.len() - 8];
        assert!(matches!(
            Header::decode(truncated),
            Err(Error::MalformedExtension(_))
        ));

        // Length field pointing beyond the cluster
        let mut bytes = on_disk(&sample_v3());
        bytes[104..108].copy_from_slice(&0x1234_5678u32.to_be_bytes());
        bytes[108..112].copy_from_slice(&0x0010_0000u32.to_be_bytes());
        assert!(matches!(
            Header::decode(&bytes),
            Err(Error::MalformedExtension(_))
        ));
    }

    #[test]
    fn extensions_round_trip_in_order() {
        let mut h = sample_v3();
        h.extensions = vec![
            HeaderExtension::Unknown {
                extension_type: 0x1234_5678,
                data: vec![1, 2, 3],
            },
            HeaderExtension::FeatureNameTable(vec![
                FeatureName {
                    feature_type: FeatureType::Incompatible.into(),
                    bit: 0,
                    name: String::from("dirty bit"),
                },
                FeatureName {
                    feature_type: 7,
                    bit: 9,
                    name: String::from("from the future"),
                },
            ]),
            HeaderExtension::BackingFileFormat(String::from("qcow2")),
        ];
        let bytes = h.encode().unwrap();
        assert_eq!(bytes.len() % 8, 0);
        let decoded = Header::decode(&bytes).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(decoded.backing_format(), Some("qcow2"));
        assert_eq!(
            decoded.feature_name(FeatureType::Incompatible, 0),
            Some("dirty bit")
        );
        assert_eq!(decoded.describe_features(FeatureType::Incompatible, 0b101), "0 (dirty bit), 2");
    }

    #[test]
    fn additional_fields_are_preserved() {
        let mut h = sample_v3();
        let features = h.features.as_mut().unwrap();
        features.additional_fields = vec![0, 0, 0, 0, 0, 0, 0, 0];
        features.incompatible = 1 << 40;
        features.autoclear = 0x3;
        let bytes = h.encode().unwrap();
        assert_eq!(&bytes[100..104], &[0, 0, 0, 112]);

        let mut decoded = Header::decode(&bytes).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(decoded.unknown_incompatible_features(), 1 << 40);
        assert!(decoded.incompatible_features().is_empty());
        assert_eq!(decoded.autoclear_features(), AutoclearFeatures::all());
        assert!(decoded.clear_autoclear_bits());
        assert!(!decoded.has_autoclear_bits());
        assert!(!decoded.clear_autoclear_bits());
    }

    #[test]
    fn backing_file_fields() {
        let mut h = sample_v3();
        h.backing_file = Some(BackingFile {
            offset: 512,
            length: 10,
        });
        assert_eq!(Header::decode(&on_disk(&h)).unwrap(), h);

        h.backing_file = Some(BackingFile {
            offset: 65530,
            length: 10,
        });
        assert!(matches!(
            Header::decode(&on_disk(&h)),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn required_l1() {
        assert_eq!(Header::required_l1_entries(1024, 16), 1);
        assert_eq!(Header::required_l1_entries(1 << 20, 16), 1);
        assert_eq!(Header::required_l1_entries(1 << 50, 16), 2097152);
        assert_eq!(Header::required_l1_entries(0, 16), 0);
        // 512 byte clusters: one L2 table covers 64 * 512 bytes
        assert_eq!(Header::required_l1_entries(32768, 9), 1);
        assert_eq!(Header::required_l1_entries(32769, 9), 2);
    }

    fn extension() -> impl Strategy<Value = HeaderExtension> {
        prop_oneof![
            "[a-z0-9]{0,20}".prop_map(HeaderExtension::BackingFileFormat),
            "[a-z/._]{1,40}".prop_map(HeaderExtension::ExternalDataFileName),
            prop::collection::vec((0u8..4, any::<u8>(), "[a-z ]{0,46}"), 0..4).prop_map(
                |entries| HeaderExtension::FeatureNameTable(
                    entries
                        .into_iter()
                        .map(|(feature_type, bit, name)| FeatureName {
                            feature_type,
                            bit,
                            name,
                        })
                        .collect()
                )
            ),
            // Type 0 is the end marker, and known types decode into their own variants
            (1u32..0x4000_0000, prop::collection::vec(any::<u8>(), 0..64)).prop_map(
                |(extension_type, data)| HeaderExtension::Unknown {
                    extension_type,
                    data,
                }
            ),
        ]
    }

    fn header() -> impl Strategy<Value = Header> {
        (
            any::<bool>(),
            MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS,
            0u32..=MAX_REFCOUNT_ORDER,
            0u64..(1 << 44),
            any::<u64>(),
            any::<u64>(),
            0usize..3,
            prop::collection::vec(extension(), 0..4),
        )
            .prop_map(
                |(v3, cb, order, size, incompat, autoclear, extra_words, extensions)| {
                    let version = if v3 { Version::V3 } else { Version::V2 };
                    let mut h = Header::new(version, cb, order, size);
                    h.l1_size = Header::required_l1_entries(size, cb) as u32;
                    h.l1_table_offset = 2 << cb;
                    h.refcount_table_offset = 1 << cb;
                    h.refcount_table_clusters = 1;
                    if let Some(f) = h.features.as_mut() {
                        f.incompatible = incompat;
                        f.autoclear = autoclear;
                        f.additional_fields = vec![0xa5; extra_words * 8];
                    }
                    h.extensions = extensions;
                    h
                },
            )
    }

    proptest! {
        #[test]
        fn round_trip(h in header()) {
            let bytes = h.encode().unwrap();
            prop_assert_eq!(bytes.len() % 8, 0);
            // Sizes generated above can exceed 512 byte clusters; only test those that fit
            prop_assume!(bytes.len() <= h.cluster_size());
            prop_assert_eq!(Header::decode(&bytes).unwrap(), h);
        }
    }
}
