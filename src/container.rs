//! Container lifecycle: create, open, query, extend.
//!
//! A container is a pair of files sharing a stem: `<name>.xmsi` (the XML
//! metadata sidecar) and `<name>.bmsi` (the binary blob). Creation is
//! atomic per file: both are staged as temporary files in the target
//! directory and persisted by rename only after they are complete, blob
//! first, so an interrupted build never leaves a readable-looking pair
//! behind.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::info;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::decoder;
use crate::encoder;
use crate::error::{Error, Result};
use crate::geometry::{Geometry, PixelTable, Raster};
use crate::layout::{
    header_len, validate_directory, ChannelEntry, DatasetIdentity, Normalization, FORMAT_VERSION,
};
use crate::sidecar::{self, SidecarDoc};
use crate::spectra::SpectraSource;

/// Everything a caller must supply to build a new container, apart from
/// the spectral source itself.
#[derive(Debug, Clone)]
pub struct DatasetDescription {
    /// Dataset name; becomes the file stem of both container files.
    pub name: String,
    /// UUID of the upstream spectral source.
    pub source_uuid: Uuid,
    /// Raster geometry.
    pub geometry: Geometry,
    /// Common mass axis, one value per channel.
    pub mass_axis: Vec<f64>,
    /// Mean spectrum over all pixels, one value per channel.
    pub mean_spectrum: Vec<f64>,
    /// Base (per-channel maximum) spectrum; also supplies the
    /// quantization scale of each channel record.
    pub base_spectrum: Vec<f64>,
    /// All acquired pixels with corrected and motor coordinates.
    pub pixels: PixelTable,
}

/// An open mass spectrometry imaging container.
///
/// Both file paths are resolved once, at create or open time, and every
/// later blob access goes through them; the dataset name stored in the
/// sidecar is metadata only and never re-derives a path.
pub struct MsiContainer {
    blob_path: PathBuf,
    sidecar_path: PathBuf,
    name: String,
    identity: DatasetIdentity,
    geometry: Geometry,
    mass_axis: Vec<f64>,
    mean_spectrum: Vec<f64>,
    base_spectrum: Vec<f64>,
    pixels: PixelTable,
    directory: Vec<ChannelEntry>,
    normalizations: Vec<Normalization>,
    config: StreamConfig,
}

impl MsiContainer {
    /// Build a new container in `dir` by streaming every channel of
    /// `source` through the encoder, then append the given normalization
    /// vectors and write the sidecar.
    ///
    /// A fresh container UUID is minted; the source UUID is carried over
    /// from the description. On any failure the target paths are left
    /// untouched.
    pub fn create<S: SpectraSource>(
        dir: impl AsRef<Path>,
        description: DatasetDescription,
        source: &mut S,
        normalizations: &[(String, Vec<f64>)],
        config: StreamConfig,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let channel_count = description.mass_axis.len();
        if channel_count == 0 {
            return Err(Error::FormatMismatch(
                "mass axis contains zero channels".to_string(),
            ));
        }
        check_len("mean spectrum length", channel_count, description.mean_spectrum.len())?;
        check_len("base spectrum length", channel_count, description.base_spectrum.len())?;
        check_len("source channel count", channel_count, source.channel_count())?;
        description.pixels.validate(&description.geometry)?;
        let pixel_count = description.pixels.len();
        for (_, values) in normalizations {
            if values.len() != pixel_count {
                return Err(Error::DimensionMismatch {
                    context: "normalization vector length",
                    expected: pixel_count,
                    actual: values.len(),
                });
            }
        }

        let identity = DatasetIdentity::for_source(description.source_uuid);
        info!(
            "creating container '{}' in {}: {} channels, {} pixels",
            description.name,
            dir.display(),
            channel_count,
            pixel_count
        );

        let mut blob_temp = NamedTempFile::new_in(&dir)?;
        let (directory, normalization_entries) = {
            let mut blob = BufWriter::new(blob_temp.as_file_mut());
            blob.write_all(identity.source_uuid.as_bytes())?;
            blob.write_all(identity.container_uuid.as_bytes())?;
            write_f64_array(&mut blob, &description.mass_axis)?;
            write_f64_array(&mut blob, &description.mean_spectrum)?;
            write_f64_array(&mut blob, &description.base_spectrum)?;

            let directory = encoder::encode_image_stream(
                source,
                &mut blob,
                &description.pixels,
                &description.geometry,
                &description.base_spectrum,
                &config,
            )?;

            let mut cursor = directory
                .last()
                .map(ChannelEntry::end)
                .unwrap_or_else(|| header_len(channel_count));
            let mut entries = Vec::with_capacity(normalizations.len());
            for (name, values) in normalizations {
                write_f64_array(&mut blob, values)?;
                entries.push(Normalization {
                    name: name.clone(),
                    offset: cursor,
                    values: values.clone(),
                });
                cursor += 8 * values.len() as u64;
            }
            blob.flush()?;
            (directory, entries)
        };

        let container = Self {
            blob_path: dir.join(format!("{}.bmsi", description.name)),
            sidecar_path: dir.join(format!("{}.xmsi", description.name)),
            name: description.name,
            identity,
            geometry: description.geometry,
            mass_axis: description.mass_axis,
            mean_spectrum: description.mean_spectrum,
            base_spectrum: description.base_spectrum,
            pixels: description.pixels,
            directory,
            normalizations: normalization_entries,
            config,
        };

        persist(blob_temp, &container.blob_path)?;
        container.write_sidecar()?;
        Ok(container)
    }

    /// Open an existing container from its sidecar path, verifying the
    /// format version, the pixel table, the channel directory and the
    /// blob-vs-sidecar UUID agreement, and loading the reference arrays
    /// and normalization vectors.
    pub fn open(sidecar_path: impl AsRef<Path>, config: StreamConfig) -> Result<Self> {
        let sidecar_path = sidecar_path.as_ref();
        let file = File::open(sidecar_path).map_err(|source| Error::OpenFailure {
            path: sidecar_path.to_path_buf(),
            source,
        })?;
        let doc = sidecar::read_sidecar(BufReader::new(file))?;
        if doc.format_version != FORMAT_VERSION {
            return Err(Error::FormatMismatch(format!(
                "unsupported container format version {} (this build reads version {})",
                doc.format_version, FORMAT_VERSION
            )));
        }
        doc.pixels.validate(&doc.geometry)?;
        validate_directory(&doc.directory, doc.channel_count)?;

        let blob_path = sidecar_path.with_extension("bmsi");
        let blob = File::open(&blob_path).map_err(|source| Error::OpenFailure {
            path: blob_path.clone(),
            source,
        })?;
        let mut blob = BufReader::new(blob);

        let mut uuid_bytes = [0u8; 16];
        read_exact_at(&mut blob, 0, &mut uuid_bytes)?;
        if uuid_bytes != *doc.identity.source_uuid.as_bytes() {
            return Err(Error::UuidMismatch { which: "source" });
        }
        read_exact_at(&mut blob, 16, &mut uuid_bytes)?;
        if uuid_bytes != *doc.identity.container_uuid.as_bytes() {
            return Err(Error::UuidMismatch { which: "container" });
        }

        let n = doc.channel_count;
        let mass_axis = read_f64_array(&mut blob, 32, n)?;
        let mean_spectrum = read_f64_array(&mut blob, 32 + 8 * n as u64, n)?;
        let base_spectrum = read_f64_array(&mut blob, 32 + 16 * n as u64, n)?;

        let pixel_count = doc.pixels.len();
        let mut normalizations = Vec::with_capacity(doc.normalizations.len());
        for (name, offset) in doc.normalizations {
            let values = read_f64_array(&mut blob, offset, pixel_count)?;
            normalizations.push(Normalization { name, offset, values });
        }

        Ok(Self {
            blob_path,
            sidecar_path: sidecar_path.to_path_buf(),
            name: doc.name,
            identity: doc.identity,
            geometry: doc.geometry,
            mass_axis,
            mean_spectrum,
            base_spectrum,
            pixels: doc.pixels,
            directory: doc.directory,
            normalizations,
            config,
        })
    }

    /// Decode the channel window `[start_channel, start_channel + count)`
    /// into a max-projection ion image, normalized per pixel by
    /// `normalization` (one coefficient per pixel; values of zero or
    /// below leave their pixel unscaled).
    pub fn ion_image(
        &self,
        start_channel: usize,
        count: usize,
        normalization: &[f64],
    ) -> Result<Raster> {
        decoder::decode_window(
            &self.blob_path,
            &self.directory,
            &self.geometry,
            &self.pixels,
            start_channel,
            count,
            normalization,
            &self.config,
        )
    }

    /// Append additional normalization vectors to the blob and rewrite
    /// the sidecar to list them.
    ///
    /// The blob grows in place (new vectors land after everything already
    /// stored); the sidecar swap is atomic, so a crash mid-way leaves the
    /// container readable with its old normalization list.
    pub fn append_normalizations(&mut self, extra: &[(String, Vec<f64>)]) -> Result<()> {
        let pixel_count = self.pixels.len();
        for (_, values) in extra {
            if values.len() != pixel_count {
                return Err(Error::DimensionMismatch {
                    context: "normalization vector length",
                    expected: pixel_count,
                    actual: values.len(),
                });
            }
        }

        let file = OpenOptions::new()
            .append(true)
            .open(&self.blob_path)
            .map_err(|source| Error::OpenFailure {
                path: self.blob_path.clone(),
                source,
            })?;
        let mut writer = BufWriter::new(file);
        let mut cursor = writer.seek(SeekFrom::End(0))?;
        let mut appended = Vec::with_capacity(extra.len());
        for (name, values) in extra {
            write_f64_array(&mut writer, values)?;
            appended.push(Normalization {
                name: name.clone(),
                offset: cursor,
                values: values.clone(),
            });
            cursor += 8 * values.len() as u64;
        }
        writer.flush()?;

        self.normalizations.extend(appended);
        self.write_sidecar()
    }

    /// Dataset name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source and container UUIDs.
    pub fn identity(&self) -> DatasetIdentity {
        self.identity
    }

    /// Raster geometry.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Number of mass channels N.
    pub fn channel_count(&self) -> usize {
        self.mass_axis.len()
    }

    /// Common mass axis.
    pub fn mass_axis(&self) -> &[f64] {
        &self.mass_axis
    }

    /// Mean spectrum over all pixels.
    pub fn mean_spectrum(&self) -> &[f64] {
        &self.mean_spectrum
    }

    /// Base (per-channel maximum) spectrum.
    pub fn base_spectrum(&self) -> &[f64] {
        &self.base_spectrum
    }

    /// Pixel table.
    pub fn pixels(&self) -> &PixelTable {
        &self.pixels
    }

    /// Channel directory.
    pub fn directory(&self) -> &[ChannelEntry] {
        &self.directory
    }

    /// All stored normalization vectors.
    pub fn normalizations(&self) -> &[Normalization] {
        &self.normalizations
    }

    /// Look up a normalization vector by name.
    pub fn normalization(&self, name: &str) -> Option<&Normalization> {
        self.normalizations.iter().find(|n| n.name == name)
    }

    /// Path of the binary blob.
    pub fn blob_path(&self) -> &Path {
        &self.blob_path
    }

    /// Path of the metadata sidecar.
    pub fn sidecar_path(&self) -> &Path {
        &self.sidecar_path
    }

    fn write_sidecar(&self) -> Result<()> {
        let doc = SidecarDoc {
            format_version: FORMAT_VERSION,
            name: self.name.clone(),
            identity: self.identity,
            channel_count: self.channel_count(),
            geometry: self.geometry,
            pixels: self.pixels.clone(),
            directory: self.directory.clone(),
            normalizations: self
                .normalizations
                .iter()
                .map(|n| (n.name.clone(), n.offset))
                .collect(),
        };
        let dir = self.sidecar_path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            sidecar::write_sidecar(&mut writer, &doc)?;
            writer.flush()?;
        }
        persist(temp, &self.sidecar_path)
    }
}

fn check_len(context: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(Error::DimensionMismatch { context, expected, actual });
    }
    Ok(())
}

fn persist(temp: NamedTempFile, target: &Path) -> Result<()> {
    temp.persist(target).map_err(|error| Error::OpenFailure {
        path: target.to_path_buf(),
        source: error.error,
    })?;
    Ok(())
}

fn write_f64_array<W: Write>(writer: &mut W, values: &[f64]) -> Result<()> {
    for &value in values {
        writer.write_f64::<LittleEndian>(value)?;
    }
    Ok(())
}

fn read_exact_at<R: Read + Seek>(reader: &mut R, offset: u64, buf: &mut [u8]) -> Result<()> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(Error::ShortRead {
                offset,
                expected: buf.len(),
                actual: filled,
            });
        }
        filled += n;
    }
    Ok(())
}

fn read_f64_array<R: Read + Seek>(reader: &mut R, offset: u64, count: usize) -> Result<Vec<f64>> {
    let mut bytes = vec![0u8; count * 8];
    read_exact_at(reader, offset, &mut bytes)?;
    let mut values = vec![0f64; count];
    LittleEndian::read_f64_into(&bytes, &mut values);
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Pixel;

    struct TableSource {
        channels: usize,
        table: Vec<Vec<f64>>,
        fail: bool,
    }

    impl SpectraSource for TableSource {
        fn channel_count(&self) -> usize {
            self.channels
        }

        fn read_channel_range(
            &mut self,
            pixel_ids: &[usize],
            start_channel: usize,
            channel_count: usize,
        ) -> Result<Vec<f64>> {
            if self.fail {
                return Err(Error::FormatMismatch("synthetic source failure".to_string()));
            }
            let mut matrix = Vec::with_capacity(pixel_ids.len() * channel_count);
            for &pixel in pixel_ids {
                matrix.extend_from_slice(
                    &self.table[pixel][start_channel..start_channel + channel_count],
                );
            }
            Ok(matrix)
        }
    }

    fn description() -> DatasetDescription {
        DatasetDescription {
            name: "brain-s1".to_string(),
            source_uuid: Uuid::new_v4(),
            geometry: Geometry { width: 2, height: 2, pixel_size_um: 30.0 },
            mass_axis: vec![100.0, 200.0, 300.0],
            mean_spectrum: vec![2.5, 3.75, 12.75],
            base_spectrum: vec![10.0, 20.0, 30.0],
            pixels: PixelTable::new(vec![
                Pixel { x: 0, y: 0, motor_x: 0.0, motor_y: 0.0 },
                Pixel { x: 1, y: 0, motor_x: 30.0, motor_y: 0.0 },
                Pixel { x: 0, y: 1, motor_x: 0.0, motor_y: 30.0 },
                Pixel { x: 1, y: 1, motor_x: 30.0, motor_y: 30.0 },
            ]),
        }
    }

    fn source() -> TableSource {
        TableSource {
            channels: 3,
            table: vec![
                vec![1.0, 5.0, 12.0],
                vec![2.0, 0.0, 9.0],
                vec![3.0, 0.0, 30.0],
                vec![4.0, 10.0, 0.0],
            ],
            fail: false,
        }
    }

    #[test]
    fn create_then_open_preserves_metadata_and_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let created = MsiContainer::create(
            dir.path(),
            description(),
            &mut source(),
            &[("TIC".to_string(), vec![18.0, 11.0, 33.0, 14.0])],
            StreamConfig::default(),
        )
        .unwrap();

        let opened = MsiContainer::open(created.sidecar_path(), StreamConfig::default()).unwrap();
        assert_eq!(opened.name(), "brain-s1");
        assert_eq!(opened.identity(), created.identity());
        assert_eq!(opened.mass_axis(), created.mass_axis());
        assert_eq!(opened.mean_spectrum(), created.mean_spectrum());
        assert_eq!(opened.base_spectrum(), created.base_spectrum());
        assert_eq!(opened.pixels(), created.pixels());
        assert_eq!(opened.directory(), created.directory());
        assert_eq!(
            opened.normalization("TIC").unwrap().values,
            vec![18.0, 11.0, 33.0, 14.0]
        );
    }

    #[test]
    fn source_uuid_is_kept_and_container_uuid_is_minted() {
        let dir = tempfile::tempdir().unwrap();
        let description = description();
        let source_uuid = description.source_uuid;
        let container = MsiContainer::create(
            dir.path(),
            description,
            &mut source(),
            &[],
            StreamConfig::default(),
        )
        .unwrap();
        assert_eq!(container.identity().source_uuid, source_uuid);
        assert_ne!(container.identity().container_uuid, source_uuid);
    }

    #[test]
    fn failed_creation_leaves_no_container_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source();
        source.fail = true;
        let result = MsiContainer::create(
            dir.path(),
            description(),
            &mut source,
            &[],
            StreamConfig::default(),
        );
        assert!(result.is_err());
        assert!(!dir.path().join("brain-s1.bmsi").exists());
        assert!(!dir.path().join("brain-s1.xmsi").exists());
    }

    #[test]
    fn empty_mass_axis_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut description = description();
        description.mass_axis.clear();
        description.mean_spectrum.clear();
        description.base_spectrum.clear();
        let result = MsiContainer::create(
            dir.path(),
            description,
            &mut source(),
            &[],
            StreamConfig::default(),
        );
        assert!(matches!(result, Err(Error::FormatMismatch(_))));
    }

    #[test]
    fn wrong_length_normalization_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = MsiContainer::create(
            dir.path(),
            description(),
            &mut source(),
            &[("TIC".to_string(), vec![1.0, 2.0])],
            StreamConfig::default(),
        );
        assert!(matches!(
            result,
            Err(Error::DimensionMismatch { expected: 4, actual: 2, .. })
        ));
    }

    #[test]
    fn appended_normalizations_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut container = MsiContainer::create(
            dir.path(),
            description(),
            &mut source(),
            &[("TIC".to_string(), vec![18.0, 11.0, 33.0, 14.0])],
            StreamConfig::default(),
        )
        .unwrap();
        container
            .append_normalizations(&[("RMS".to_string(), vec![2.0, 4.0, 6.0, 8.0])])
            .unwrap();

        let opened = MsiContainer::open(container.sidecar_path(), StreamConfig::default()).unwrap();
        assert_eq!(opened.normalizations().len(), 2);
        assert_eq!(opened.normalization("RMS").unwrap().values, vec![2.0, 4.0, 6.0, 8.0]);
        assert_eq!(
            opened.normalization("TIC").unwrap().values,
            vec![18.0, 11.0, 33.0, 14.0]
        );
    }

    #[test]
    fn renamed_container_pair_stays_queryable() {
        let dir = tempfile::tempdir().unwrap();
        let created = MsiContainer::create(
            dir.path(),
            description(),
            &mut source(),
            &[("TIC".to_string(), vec![18.0, 11.0, 33.0, 14.0])],
            StreamConfig::default(),
        )
        .unwrap();
        std::fs::rename(created.sidecar_path(), dir.path().join("moved.xmsi")).unwrap();
        std::fs::rename(created.blob_path(), dir.path().join("moved.bmsi")).unwrap();

        let mut moved =
            MsiContainer::open(dir.path().join("moved.xmsi"), StreamConfig::default()).unwrap();
        assert_eq!(moved.name(), "brain-s1");
        // Queries must hit the blob that open() validated, not a path
        // rebuilt from the stored dataset name.
        let image = moved.ion_image(0, 1, &[1.0; 4]).unwrap();
        assert!(image.get(1, 1) > 0.0);

        moved
            .append_normalizations(&[("RMS".to_string(), vec![1.0, 1.0, 1.0, 1.0])])
            .unwrap();
        let reopened =
            MsiContainer::open(dir.path().join("moved.xmsi"), StreamConfig::default()).unwrap();
        assert!(reopened.normalization("RMS").is_some());
        assert!(!dir.path().join("brain-s1.xmsi").exists());
        assert!(!dir.path().join("brain-s1.bmsi").exists());
    }

    #[test]
    fn truncated_normalization_vector_reports_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let container = MsiContainer::create(
            dir.path(),
            description(),
            &mut source(),
            &[("TIC".to_string(), vec![18.0, 11.0, 33.0, 14.0])],
            StreamConfig::default(),
        )
        .unwrap();

        let blob_path = container.blob_path().to_path_buf();
        let len = std::fs::metadata(&blob_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&blob_path).unwrap();
        file.set_len(len - 8).unwrap();
        drop(file);

        let result = MsiContainer::open(container.sidecar_path(), StreamConfig::default());
        assert!(matches!(
            result,
            Err(Error::ShortRead { expected: 32, actual: 24, .. })
        ));
    }

    #[test]
    fn blob_uuid_corruption_is_detected_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let container = MsiContainer::create(
            dir.path(),
            description(),
            &mut source(),
            &[],
            StreamConfig::default(),
        )
        .unwrap();

        let blob_path = container.blob_path();
        let mut file = OpenOptions::new().write(true).open(&blob_path).unwrap();
        file.seek(SeekFrom::Start(20)).unwrap();
        file.write_all(&[0xFF; 4]).unwrap();
        drop(file);

        let result = MsiContainer::open(container.sidecar_path(), StreamConfig::default());
        assert!(matches!(result, Err(Error::UuidMismatch { which: "container" })));
    }
}
