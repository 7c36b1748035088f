//! On-disk layout of the binary blob.
//!
//! ```text
//! [0       .. 16)      source UUID
//! [16      .. 32)      container UUID
//! [32      .. 32+8N)   mass axis, N x f64 LE
//! [32+8N   .. 32+16N)  mean spectrum, N x f64 LE
//! [32+16N  .. 32+24N)  base spectrum, N x f64 LE
//! [32+24N  .. ...)     channel records: f32 LE scale + PNG raster bytes
//! [after last channel] normalization vectors: P x f64 LE, contiguous
//! ```

use uuid::Uuid;

use crate::error::{Error, Result};

/// Current container format version, written to and checked against the
/// sidecar.
pub const FORMAT_VERSION: u32 = 1;

/// Fixed header size in bytes for a dataset with `channel_count` mass
/// channels: two UUIDs plus three f64 reference arrays.
pub fn header_len(channel_count: usize) -> u64 {
    32 + 24 * channel_count as u64
}

/// The two 16-byte UUIDs identifying a dataset.
///
/// Both are stored in the blob header and in the sidecar; the copies must
/// byte-compare equal or the dataset is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetIdentity {
    /// UUID of the upstream spectral source the container was built from.
    pub source_uuid: Uuid,
    /// UUID of this container.
    pub container_uuid: Uuid,
}

impl DatasetIdentity {
    /// Identity for a fresh container: keeps the source UUID, mints a new
    /// container UUID.
    pub fn for_source(source_uuid: Uuid) -> Self {
        Self {
            source_uuid,
            container_uuid: Uuid::new_v4(),
        }
    }
}

/// Location of one channel record inside the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEntry {
    /// Byte offset of the record (the f32 scale field).
    pub offset: u64,
    /// Byte length of the record: 4 scale bytes plus the compressed
    /// raster.
    pub length: u64,
}

impl ChannelEntry {
    /// Byte offset one past the end of this record.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// A named per-pixel coefficient vector stored after the channel records.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
    /// Name under which the vector is addressed (e.g. "TIC").
    pub name: String,
    /// Byte offset of the vector inside the blob.
    pub offset: u64,
    /// The P coefficients.
    pub values: Vec<f64>,
}

/// Enforce the channel directory invariants: one entry per channel,
/// `offset[0]` at the fixed header, offsets strictly increasing and
/// gap-free (`offset[i+1] == offset[i] + length[i]`).
pub fn validate_directory(directory: &[ChannelEntry], channel_count: usize) -> Result<()> {
    if directory.len() != channel_count {
        return Err(Error::DimensionMismatch {
            context: "channel directory length",
            expected: channel_count,
            actual: directory.len(),
        });
    }
    for (index, entry) in directory.iter().enumerate() {
        if index == 0 {
            let expected = header_len(channel_count);
            if entry.offset != expected {
                return Err(Error::DirectoryInvariant {
                    index,
                    detail: format!(
                        "first offset is {}, expected header end {}",
                        entry.offset, expected
                    ),
                });
            }
        } else {
            let previous = &directory[index - 1];
            if entry.offset != previous.end() {
                return Err(Error::DirectoryInvariant {
                    index,
                    detail: format!(
                        "offset {} leaves a gap after {} + {}",
                        entry.offset, previous.offset, previous.length
                    ),
                });
            }
        }
        if entry.length == 0 {
            return Err(Error::DirectoryInvariant {
                index,
                detail: "zero-length channel record".to_string(),
            });
        }
    }
    Ok(())
}
