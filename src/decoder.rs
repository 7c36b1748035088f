//! Windowed ion-image decoder.
//!
//! Reconstructs a max-projection raster over a contiguous channel window
//! from the blob. The window's records are fetched with a single
//! contiguous read (valid because the directory is gap-free by
//! invariant), decoded in parallel into per-worker private rasters and
//! folded by per-pixel maximum — no shared mutable raster, no lock.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use rayon::prelude::*;

use crate::codec::{self, SCALE_FIELD_BYTES};
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::geometry::{Geometry, PixelTable, Raster};
use crate::layout::ChannelEntry;

/// Decode the channel window `[start_channel, start_channel + count)`
/// into one raster, merging channels by per-pixel maximum, then apply
/// per-pixel normalization.
///
/// Pixels whose coefficient is greater than zero are divided by it;
/// coefficients of zero or below leave the pixel untouched (deliberate
/// no-op, avoiding division by zero and sign inversion).
///
/// Fails before touching the blob when the window is out of range, when
/// `normalization.len() != P`, or when the window's cumulative byte
/// length exceeds the configured memory budget.
pub fn decode_window(
    blob_path: &Path,
    directory: &[ChannelEntry],
    geometry: &Geometry,
    pixels: &PixelTable,
    start_channel: usize,
    count: usize,
    normalization: &[f64],
    config: &StreamConfig,
) -> Result<Raster> {
    if start_channel + count > directory.len() {
        return Err(Error::WindowOutOfRange {
            start: start_channel,
            count,
            channels: directory.len(),
        });
    }
    if normalization.len() != pixels.len() {
        return Err(Error::DimensionMismatch {
            context: "normalization coefficient vector",
            expected: pixels.len(),
            actual: normalization.len(),
        });
    }

    let window = &directory[start_channel..start_channel + count];
    let byte_count: u64 = window.iter().map(|entry| entry.length).sum();
    if byte_count > config.memory_budget as u64 {
        return Err(Error::ResourceExceeded {
            requested: byte_count,
            budget: config.memory_budget as u64,
        });
    }
    if count == 0 {
        return Ok(Raster::zeros(geometry));
    }

    let base_offset = window[0].offset;
    let buffer = read_window(blob_path, base_offset, byte_count as usize)?;
    debug!(
        "decoding {} channels ({} bytes) from {}",
        count,
        byte_count,
        blob_path.display()
    );

    let mut raster = window
        .par_iter()
        .enumerate()
        .map(|(position, entry)| {
            let record = record_slice(&buffer, base_offset, entry, start_channel + position)?;
            let scale = LittleEndian::read_f32(&record[..SCALE_FIELD_BYTES]);
            codec::decode(&record[SCALE_FIELD_BYTES..], scale, geometry)
        })
        .try_reduce(|| Raster::zeros(geometry), |a, b| Ok(a.merge_max(b)))?;

    for (pixel_id, pixel) in pixels.iter() {
        let coefficient = normalization[pixel_id];
        if coefficient > 0.0 {
            let value = raster.get(pixel.x, pixel.y);
            raster.set(pixel.x, pixel.y, value / coefficient);
        }
    }
    Ok(raster)
}

/// One contiguous read of the whole window.
fn read_window(blob_path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
    let file = File::open(blob_path).map_err(|source| Error::OpenFailure {
        path: blob_path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(offset))?;

    let mut buffer = vec![0u8; len];
    let mut filled = 0usize;
    while filled < len {
        let n = reader.read(&mut buffer[filled..])?;
        if n == 0 {
            return Err(Error::ShortRead {
                offset,
                expected: len,
                actual: filled,
            });
        }
        filled += n;
    }
    Ok(buffer)
}

fn record_slice<'a>(
    buffer: &'a [u8],
    base_offset: u64,
    entry: &ChannelEntry,
    channel: usize,
) -> Result<&'a [u8]> {
    let start = (entry.offset - base_offset) as usize;
    let record = buffer
        .get(start..start + entry.length as usize)
        .ok_or_else(|| Error::DirectoryInvariant {
            index: channel,
            detail: format!(
                "record at offset {} length {} exceeds the window buffer",
                entry.offset, entry.length
            ),
        })?;
    if record.len() < SCALE_FIELD_BYTES {
        return Err(Error::ShortRead {
            offset: entry.offset,
            expected: SCALE_FIELD_BYTES,
            actual: record.len(),
        });
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Pixel;

    fn geometry() -> Geometry {
        Geometry { width: 2, height: 1, pixel_size_um: 1.0 }
    }

    fn pixels() -> PixelTable {
        PixelTable::new(vec![
            Pixel { x: 0, y: 0, motor_x: 0.0, motor_y: 0.0 },
            Pixel { x: 1, y: 0, motor_x: 1.0, motor_y: 0.0 },
        ])
    }

    #[test]
    fn over_budget_window_fails_without_reading() {
        // The blob path does not exist: reaching OpenFailure instead of
        // ResourceExceeded would mean a read was attempted.
        let directory = vec![
            ChannelEntry { offset: 56, length: 1 << 20 },
            ChannelEntry { offset: 56 + (1 << 20), length: 1 << 20 },
        ];
        let config = StreamConfig::default().with_memory_budget(1024);
        let result = decode_window(
            Path::new("/nonexistent/blob.bmsi"),
            &directory,
            &geometry(),
            &pixels(),
            0,
            2,
            &[1.0, 1.0],
            &config,
        );
        assert!(matches!(
            result,
            Err(Error::ResourceExceeded { requested, budget: 1024 }) if requested == 2 << 20
        ));
    }

    #[test]
    fn window_past_directory_end_is_rejected() {
        let directory = vec![ChannelEntry { offset: 56, length: 10 }];
        let result = decode_window(
            Path::new("/nonexistent/blob.bmsi"),
            &directory,
            &geometry(),
            &pixels(),
            1,
            1,
            &[1.0, 1.0],
            &StreamConfig::default(),
        );
        assert!(matches!(result, Err(Error::WindowOutOfRange { .. })));
    }

    #[test]
    fn coefficient_vector_must_cover_every_pixel() {
        let directory = vec![ChannelEntry { offset: 56, length: 10 }];
        let result = decode_window(
            Path::new("/nonexistent/blob.bmsi"),
            &directory,
            &geometry(),
            &pixels(),
            0,
            1,
            &[1.0],
            &StreamConfig::default(),
        );
        assert!(matches!(
            result,
            Err(Error::DimensionMismatch { expected: 2, actual: 1, .. })
        ));
    }

    #[test]
    fn truncated_blob_reports_short_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, &[0u8; 8]).unwrap();
        let directory = vec![ChannelEntry { offset: 0, length: 32 }];
        let result = decode_window(
            file.path(),
            &directory,
            &geometry(),
            &pixels(),
            0,
            1,
            &[1.0, 1.0],
            &StreamConfig::default(),
        );
        assert!(matches!(
            result,
            Err(Error::ShortRead { expected: 32, actual: 8, .. })
        ));
    }
}
