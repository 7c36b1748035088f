//! Streaming channel encoder.
//!
//! Converts a columnar [`SpectraSource`] into the channel-record region
//! of the blob under a fixed memory budget. Channels are processed in
//! batches sized so that two raw batches fit in the budget; while a
//! background thread encodes and writes batch `i`, the caller loads
//! batch `i + 1` from the source (pipeline depth 2 — the hand-off is a
//! rendezvous, so the swap blocks until the in-flight batch has been
//! consumed). Within a batch, per-channel encode tasks run on the
//! ordered worker pool, and the drain appends records to the blob in
//! strictly increasing channel order regardless of completion order.

use std::io::Write;
use std::thread;

use byteorder::{LittleEndian, WriteBytesExt};
use crossbeam_channel::bounded;
use log::{debug, info};

use crate::codec::{self, SCALE_FIELD_BYTES};
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::geometry::{Geometry, PixelTable, Raster};
use crate::layout::{header_len, ChannelEntry};
use crate::spectra::SpectraSource;

/// One loaded batch of raw intensities: a pixel-major
/// `P x channel_count` matrix for channels `[start, start + count)`.
struct Batch {
    start: usize,
    count: usize,
    matrix: Vec<f64>,
}

/// Number of channels per batch such that two raw fixed-point batches
/// stay within the memory budget.
fn batch_channels(geometry: &Geometry, memory_budget: usize, channel_count: usize) -> usize {
    let bytes_per_channel = geometry.cell_count() * 2 + SCALE_FIELD_BYTES;
    (memory_budget / bytes_per_channel).clamp(1, channel_count)
}

/// Encode every channel of `source` and append the records to `blob`,
/// which must be positioned at the end of the fixed header.
///
/// Returns the channel directory: gap-free, strictly increasing entries
/// with `offset[0] == header_len(N)`. Any source, codec or I/O failure
/// aborts the whole operation; bytes already written are not rolled
/// back (atomicity of creation is the container's concern).
pub fn encode_image_stream<S, W>(
    source: &mut S,
    blob: &mut W,
    pixels: &PixelTable,
    geometry: &Geometry,
    base_spectrum: &[f64],
    config: &StreamConfig,
) -> Result<Vec<ChannelEntry>>
where
    S: SpectraSource,
    W: Write + Send,
{
    let channel_count = source.channel_count();
    if base_spectrum.len() != channel_count {
        return Err(Error::DimensionMismatch {
            context: "base spectrum length",
            expected: channel_count,
            actual: base_spectrum.len(),
        });
    }
    if channel_count == 0 {
        return Ok(Vec::new());
    }

    let batch = batch_channels(geometry, config.memory_budget, channel_count);
    let workers = config.workers.max(1);
    let first_offset = header_len(channel_count);
    info!(
        "encoding {} channels for {} pixels in batches of {} ({} workers)",
        channel_count,
        pixels.len(),
        batch,
        workers
    );

    thread::scope(|scope| {
        // Rendezvous hand-off: the send blocks until the writer thread
        // has taken the batch, bounding in-flight raw data to two
        // batches (one loading here, one being encoded there).
        let (batch_tx, batch_rx) = bounded::<Batch>(0);

        let writer = thread::Builder::new()
            .name("msibin-encoder".to_string())
            .spawn_scoped(scope, move || -> Result<Vec<ChannelEntry>> {
                let mut entries: Vec<ChannelEntry> = Vec::with_capacity(channel_count);
                for batch in batch_rx {
                    let channels: Vec<usize> = (batch.start..batch.start + batch.count).collect();
                    let matrix = &batch.matrix;
                    crate::pool::process_ordered(
                        channels,
                        workers,
                        |_, channel| {
                            let column = channel - batch.start;
                            let mut raster = Raster::zeros(geometry);
                            for (pixel_id, pixel) in pixels.iter() {
                                raster.set(
                                    pixel.x,
                                    pixel.y,
                                    matrix[pixel_id * batch.count + column],
                                );
                            }
                            let scale = base_spectrum[channel] as f32;
                            let compressed = codec::encode(&raster, scale)?;
                            Ok((scale, compressed))
                        },
                        |_, (scale, compressed): (f32, Vec<u8>)| {
                            blob.write_f32::<LittleEndian>(scale)?;
                            blob.write_all(&compressed)?;
                            let offset = entries
                                .last()
                                .map(ChannelEntry::end)
                                .unwrap_or(first_offset);
                            entries.push(ChannelEntry {
                                offset,
                                length: (SCALE_FIELD_BYTES + compressed.len()) as u64,
                            });
                            Ok(())
                        },
                    )?;
                    debug!(
                        "encoded channels [{}, {})",
                        batch.start,
                        batch.start + batch.count
                    );
                }
                Ok(entries)
            })
            .map_err(Error::Stream)?;

        let pixel_ids: Vec<usize> = (0..pixels.len()).collect();
        let mut load_result: Result<()> = Ok(());
        let mut start = 0usize;
        while start < channel_count {
            let count = batch.min(channel_count - start);
            match source.read_channel_range(&pixel_ids, start, count) {
                Ok(matrix) => {
                    if matrix.len() != pixel_ids.len() * count {
                        load_result = Err(Error::DimensionMismatch {
                            context: "spectral source batch matrix",
                            expected: pixel_ids.len() * count,
                            actual: matrix.len(),
                        });
                        break;
                    }
                    // A failed send means the writer exited early; its
                    // error is picked up at the join below.
                    if batch_tx.send(Batch { start, count, matrix }).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    load_result = Err(error);
                    break;
                }
            }
            start += count;
        }
        drop(batch_tx);

        let entries = writer.join().map_err(|_| Error::WorkerPanicked)??;
        load_result?;
        Ok(entries)
    })
}
