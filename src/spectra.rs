//! Columnar spectral source feeding the encoder.
//!
//! The encoder pulls raw per-pixel intensities through the
//! [`SpectraSource`] trait. The shipped implementation, [`IbdSource`],
//! reads an imzML-style continuous-mode `.ibd` file: one intensity array
//! per pixel, all aligned on the dataset's common mass axis, located by a
//! per-pixel byte offset directory and stored in one of four numeric
//! encodings. Everything is widened to `f64` on read; only the 64-bit
//! float case is a direct copy, the other three go through a typed
//! intermediate buffer.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Numeric encoding of the elements in a spectral source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataEncoding {
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit IEEE float.
    Float32,
    /// 64-bit IEEE float.
    Float64,
}

impl DataEncoding {
    /// Bytes per element.
    pub fn byte_size(&self) -> usize {
        match self {
            DataEncoding::Int32 | DataEncoding::Float32 => 4,
            DataEncoding::Int64 | DataEncoding::Float64 => 8,
        }
    }
}

/// Location of one pixel's intensity array inside the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpectrumEntry {
    /// Byte offset of the first element.
    pub offset: u64,
    /// Number of elements. Zero marks a pixel with no contribution; its
    /// intensities read as all zero.
    pub element_count: u64,
}

/// Supplier of raw per-pixel intensities on the common mass axis.
pub trait SpectraSource {
    /// Total number of mass channels in the source.
    fn channel_count(&self) -> usize;

    /// Read intensities for `pixel_ids` over the channel window
    /// `[start_channel, start_channel + channel_count)`.
    ///
    /// Returns a pixel-major matrix of `pixel_ids.len() * channel_count`
    /// values: row `r` holds the requested window for `pixel_ids[r]`,
    /// with zeros for pixels that contribute nothing at a channel.
    fn read_channel_range(
        &mut self,
        pixel_ids: &[usize],
        start_channel: usize,
        channel_count: usize,
    ) -> Result<Vec<f64>>;
}

/// Continuous-mode `.ibd` file reader.
pub struct IbdSource {
    path: PathBuf,
    file: BufReader<File>,
    encoding: DataEncoding,
    directory: Vec<SpectrumEntry>,
    channel_count: usize,
}

impl IbdSource {
    /// Open a source file with its per-pixel directory and declared
    /// element encoding.
    pub fn open(
        path: impl AsRef<Path>,
        encoding: DataEncoding,
        directory: Vec<SpectrumEntry>,
        channel_count: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| Error::OpenFailure {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            file: BufReader::new(file),
            encoding,
            directory,
            channel_count,
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read `count` raw elements starting at `byte_offset`, widened to
    /// `f64` according to `encoding`.
    pub fn read_elements(
        &mut self,
        byte_offset: u64,
        count: usize,
        encoding: DataEncoding,
    ) -> Result<Vec<f64>> {
        let byte_len = count * encoding.byte_size();
        self.file.seek(SeekFrom::Start(byte_offset))?;

        let mut bytes = vec![0u8; byte_len];
        let mut filled = 0usize;
        while filled < byte_len {
            let n = self.file.read(&mut bytes[filled..])?;
            if n == 0 {
                return Err(Error::ShortRead {
                    offset: byte_offset,
                    expected: byte_len,
                    actual: filled,
                });
            }
            filled += n;
        }

        let mut out = vec![0f64; count];
        match encoding {
            // Already double precision, no intermediate buffer needed.
            DataEncoding::Float64 => LittleEndian::read_f64_into(&bytes, &mut out),
            DataEncoding::Float32 => {
                let mut buffer = vec![0f32; count];
                LittleEndian::read_f32_into(&bytes, &mut buffer);
                for (slot, value) in out.iter_mut().zip(buffer) {
                    *slot = value as f64;
                }
            }
            DataEncoding::Int32 => {
                let mut buffer = vec![0i32; count];
                LittleEndian::read_i32_into(&bytes, &mut buffer);
                for (slot, value) in out.iter_mut().zip(buffer) {
                    *slot = value as f64;
                }
            }
            DataEncoding::Int64 => {
                let mut buffer = vec![0i64; count];
                LittleEndian::read_i64_into(&bytes, &mut buffer);
                for (slot, value) in out.iter_mut().zip(buffer) {
                    *slot = value as f64;
                }
            }
        }
        Ok(out)
    }

    /// Write raw elements back into the source file.
    ///
    /// The write direction is not production-ready and unconditionally
    /// fails; this crate only consumes spectral sources.
    pub fn write_elements(&mut self, _byte_offset: u64, _values: &[f64]) -> Result<()> {
        Err(Error::Unsupported("spectral source write path"))
    }
}

impl SpectraSource for IbdSource {
    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn read_channel_range(
        &mut self,
        pixel_ids: &[usize],
        start_channel: usize,
        channel_count: usize,
    ) -> Result<Vec<f64>> {
        if start_channel + channel_count > self.channel_count {
            return Err(Error::WindowOutOfRange {
                start: start_channel,
                count: channel_count,
                channels: self.channel_count,
            });
        }

        let element_size = self.encoding.byte_size() as u64;
        let mut matrix = vec![0f64; pixel_ids.len() * channel_count];
        for (row, &pixel_id) in pixel_ids.iter().enumerate() {
            let entry = *self.directory.get(pixel_id).ok_or(Error::DimensionMismatch {
                context: "spectral source pixel directory",
                expected: pixel_id + 1,
                actual: self.directory.len(),
            })?;
            if entry.element_count == 0 {
                continue;
            }
            if entry.element_count as usize != self.channel_count {
                return Err(Error::DimensionMismatch {
                    context: "pixel spectrum length",
                    expected: self.channel_count,
                    actual: entry.element_count as usize,
                });
            }
            let offset = entry.offset + start_channel as u64 * element_size;
            let row_values = self.read_elements(offset, channel_count, self.encoding)?;
            matrix[row * channel_count..(row + 1) * channel_count].copy_from_slice(&row_values);
        }
        Ok(matrix)
    }
}
