use byteorder::{LittleEndian, WriteBytesExt};
use msibin::config::StreamConfig;
use msibin::container::{DatasetDescription, MsiContainer};
use msibin::error::Error;
use msibin::geometry::{Geometry, Pixel, PixelTable};
use msibin::spectra::{DataEncoding, IbdSource, SpectrumEntry};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tempfile::tempdir;
use uuid::Uuid;

const BASE: [f64; 3] = [10.0, 20.0, 30.0];

/// Per-pixel intensities on the common 3-channel axis, pixel-id order.
const TABLE: [[f32; 3]; 4] = [
    [1.0, 5.0, 12.0],
    [2.0, 0.0, 9.0],
    [3.0, 0.0, 30.0],
    [4.0, 10.0, 0.0],
];

fn write_ibd(path: &Path) -> Vec<SpectrumEntry> {
    let mut data = Vec::new();
    let mut directory = Vec::new();
    for row in &TABLE {
        let offset = data.len() as u64;
        for &value in row {
            data.write_f32::<LittleEndian>(value).unwrap();
        }
        directory.push(SpectrumEntry { offset, element_count: row.len() as u64 });
    }
    let mut file = File::create(path).unwrap();
    file.write_all(&data).unwrap();
    directory
}

fn description() -> DatasetDescription {
    DatasetDescription {
        name: "kidney-s3".to_string(),
        source_uuid: Uuid::new_v4(),
        geometry: Geometry { width: 2, height: 2, pixel_size_um: 25.0 },
        mass_axis: vec![104.1, 156.3, 204.9],
        mean_spectrum: vec![2.5, 3.75, 12.75],
        base_spectrum: BASE.to_vec(),
        pixels: PixelTable::new(vec![
            Pixel { x: 0, y: 0, motor_x: 0.0, motor_y: 0.0 },
            Pixel { x: 1, y: 0, motor_x: 25.0, motor_y: 0.0 },
            Pixel { x: 0, y: 1, motor_x: 0.0, motor_y: 25.0 },
            Pixel { x: 1, y: 1, motor_x: 25.0, motor_y: 25.0 },
        ]),
    }
}

fn build_container(dir: &Path, config: StreamConfig) -> MsiContainer {
    let _ = env_logger::builder().is_test(true).try_init();
    let ibd_path = dir.join("kidney-s3.ibd");
    let directory = write_ibd(&ibd_path);
    let mut source = IbdSource::open(&ibd_path, DataEncoding::Float32, directory, 3).unwrap();
    MsiContainer::create(
        dir,
        description(),
        &mut source,
        &[("TIC".to_string(), vec![18.0, 11.0, 33.0, 14.0])],
        config,
    )
    .unwrap()
}

/// Worst-case absolute quantization error for a channel stored with
/// `scale`: half a fixed-point step, padded for f32 scale rounding.
fn tolerance(scale: f64) -> f64 {
    scale / 65535.0
}

#[test]
fn single_channel_window_reproduces_the_raster() {
    let dir = tempdir().unwrap();
    let container = build_container(dir.path(), StreamConfig::default());

    let image = container.ion_image(1, 1, &[1.0; 4]).unwrap();
    let expected = [[5.0, 0.0], [0.0, 10.0]];
    for y in 0..2 {
        for x in 0..2 {
            let got = image.get(x, y);
            let want = expected[y as usize][x as usize];
            assert!(
                (got - want).abs() <= tolerance(BASE[1]),
                "pixel ({x}, {y}): got {got}, want {want}"
            );
        }
    }
}

#[test]
fn multi_channel_window_is_the_elementwise_max_of_single_channels() {
    let dir = tempdir().unwrap();
    let container = build_container(dir.path(), StreamConfig::default());
    let ones = [1.0; 4];

    let combined = container.ion_image(0, 3, &ones).unwrap();
    let singles: Vec<_> = (0..3)
        .map(|c| container.ion_image(c, 1, &ones).unwrap())
        .collect();
    for y in 0..2 {
        for x in 0..2 {
            let expected = singles
                .iter()
                .map(|s| s.get(x, y))
                .fold(f64::NEG_INFINITY, f64::max);
            assert_eq!(combined.get(x, y), expected, "pixel ({x}, {y})");
        }
    }
}

#[test]
fn normalization_divides_only_where_the_coefficient_is_positive() {
    let dir = tempdir().unwrap();
    let container = build_container(dir.path(), StreamConfig::default());

    let plain = container.ion_image(0, 3, &[1.0; 4]).unwrap();
    let normalized = container.ion_image(0, 3, &[2.0, 4.0, 0.0, -1.0]).unwrap();

    assert_eq!(normalized.get(0, 0), plain.get(0, 0) / 2.0);
    assert_eq!(normalized.get(1, 0), plain.get(1, 0) / 4.0);
    // Zero and negative coefficients leave their pixels unscaled.
    assert_eq!(normalized.get(0, 1), plain.get(0, 1));
    assert_eq!(normalized.get(1, 1), plain.get(1, 1));
}

#[test]
fn stored_tic_vector_can_drive_normalization() {
    let dir = tempdir().unwrap();
    let container = build_container(dir.path(), StreamConfig::default());

    let coefficients = container.normalization("TIC").unwrap().values.clone();
    let image = container.ion_image(2, 1, &coefficients).unwrap();
    assert!((image.get(0, 0) - 12.0 / 18.0).abs() <= tolerance(BASE[2]) / 18.0 + 1e-12);
    assert!((image.get(0, 1) - 30.0 / 33.0).abs() <= tolerance(BASE[2]) / 33.0 + 1e-12);
}

#[test]
fn tight_budget_still_produces_a_valid_container() {
    let dir = tempdir().unwrap();
    // Budget of one channel per encode batch.
    let config = StreamConfig::default().with_memory_budget(2 * 2 * 2 + 4).with_workers(2);
    let container = build_container(dir.path(), config);
    assert_eq!(container.directory().len(), 3);

    let reopened =
        MsiContainer::open(container.sidecar_path(), StreamConfig::default()).unwrap();
    let image = reopened.ion_image(1, 1, &[1.0; 4]).unwrap();
    assert!((image.get(1, 1) - 10.0).abs() <= tolerance(BASE[1]));
}

#[test]
fn over_budget_query_is_refused() {
    let dir = tempdir().unwrap();
    let container = build_container(dir.path(), StreamConfig::default());

    let starved = MsiContainer::open(
        container.sidecar_path(),
        StreamConfig::default().with_memory_budget(1),
    )
    .unwrap();
    let result = starved.ion_image(0, 3, &[1.0; 4]);
    assert!(matches!(result, Err(Error::ResourceExceeded { budget: 1, .. })));
}

#[test]
fn unknown_format_version_is_refused_on_open() {
    let dir = tempdir().unwrap();
    let container = build_container(dir.path(), StreamConfig::default());

    let sidecar_path = container.sidecar_path();
    let xml = std::fs::read_to_string(&sidecar_path).unwrap();
    let bumped = xml.replace("<msiContainer version=\"1\"", "<msiContainer version=\"99\"");
    assert_ne!(xml, bumped);
    std::fs::write(&sidecar_path, bumped).unwrap();

    let result = MsiContainer::open(&sidecar_path, StreamConfig::default());
    assert!(matches!(
        result,
        Err(Error::FormatMismatch(message)) if message.contains("version 99")
    ));
}

#[test]
fn missing_blob_is_an_open_failure() {
    let dir = tempdir().unwrap();
    let container = build_container(dir.path(), StreamConfig::default());

    std::fs::remove_file(container.blob_path()).unwrap();
    let result = MsiContainer::open(container.sidecar_path(), StreamConfig::default());
    assert!(matches!(result, Err(Error::OpenFailure { .. })));
}
