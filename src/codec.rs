//! Per-channel raster codec.
//!
//! Each mass channel is stored as a lossless 16-bit grayscale PNG of
//! fixed-point samples plus a single `f32` scale. The codec is lossy by
//! construction: intensities are quantized to `raw = round(v / scale * R)`
//! with `R = 65535`, and the scale (taken from the external base spectrum
//! at encode time) is never recomputed on decode. For a deterministic
//! input raster the compressed output is byte-for-byte reproducible.

use std::io::Cursor;

use image::{DynamicImage, ImageBuffer, ImageFormat, Luma};

use crate::error::{Error, Result};
use crate::geometry::{Geometry, Raster};

/// Size of the fixed-point quantization range (16-bit encoding).
pub const ENCODER_RANGE: f64 = 65535.0;

/// Bytes occupied by the scale field preceding each compressed raster.
pub const SCALE_FIELD_BYTES: usize = 4;

fn quantize(value: f64, scale: f32) -> u16 {
    if scale <= 0.0 {
        return 0;
    }
    let raw = (value / scale as f64 * ENCODER_RANGE).round();
    if !(raw > 0.0) {
        0
    } else if raw >= ENCODER_RANGE {
        u16::MAX
    } else {
        raw as u16
    }
}

fn dequantize(raw: u16, scale: f32) -> f64 {
    raw as f64 / ENCODER_RANGE * scale as f64
}

/// Quantize a raster against `scale` and compress it to PNG bytes.
///
/// Samples outside `[0, scale]` are clamped to the quantization range; a
/// non-positive scale produces an all-zero raster.
pub fn encode(raster: &Raster, scale: f32) -> Result<Vec<u8>> {
    let samples: Vec<u16> = raster
        .data()
        .iter()
        .map(|&value| quantize(value, scale))
        .collect();

    let buffer: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_raw(raster.width(), raster.height(), samples).ok_or_else(|| {
            Error::FormatMismatch("raster length disagrees with its dimensions".to_string())
        })?;

    let mut compressed = Vec::new();
    DynamicImage::ImageLuma16(buffer).write_to(&mut Cursor::new(&mut compressed), ImageFormat::Png)?;
    Ok(compressed)
}

/// Decompress PNG bytes and descale them back to intensities.
///
/// Fails with [`Error::CodecGeometry`] when the decoded dimensions do not
/// match `geometry`, which signals corruption of the blob.
pub fn decode(compressed: &[u8], scale: f32, geometry: &Geometry) -> Result<Raster> {
    let decoded = image::load_from_memory_with_format(compressed, ImageFormat::Png)?;
    if decoded.width() != geometry.width || decoded.height() != geometry.height {
        return Err(Error::CodecGeometry {
            expected_width: geometry.width,
            expected_height: geometry.height,
            actual_width: decoded.width(),
            actual_height: decoded.height(),
        });
    }

    let samples = decoded.into_luma16();
    let mut raster = Raster::zeros(geometry);
    for y in 0..geometry.height {
        for x in 0..geometry.width {
            raster.set(x, y, dequantize(samples.get_pixel(x, y)[0], scale));
        }
    }
    Ok(raster)
}
