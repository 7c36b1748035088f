//! # msibin - A Raster Container for Mass Spectrometry Imaging
//!
//! `msibin` stores a mass spectrometry imaging dataset as a pair of files
//! sharing one stem: `<name>.bmsi`, a binary blob of per-channel rasters
//! compressed as lossless 16-bit grayscale PNG, and `<name>.xmsi`, an XML
//! metadata sidecar describing everything needed to interpret the blob.
//!
//! ## Key Features
//!
//! - **Streaming creation**: the encoder pulls raw intensities from a
//!   columnar [`spectra::SpectraSource`] in channel batches sized to a
//!   fixed memory budget, so datasets far larger than RAM can be built.
//!
//! - **Fixed-point raster codec**: each channel's raster is quantized
//!   against the channel's base-spectrum value into 16 bits and stored as
//!   a PNG, giving good compression with a known, bounded error.
//!
//! - **Windowed queries**: [`container::MsiContainer::ion_image`] decodes
//!   any contiguous channel window into a max-projection ion image with
//!   per-pixel normalization, reading only that window's bytes.
//!
//! - **Atomic lifecycle**: container files are staged as temporary files
//!   and persisted by rename, so an interrupted build never leaves a
//!   half-written container behind.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use msibin::config::StreamConfig;
//! use msibin::container::{DatasetDescription, MsiContainer};
//! use msibin::geometry::{Geometry, Pixel, PixelTable};
//! use msibin::spectra::{DataEncoding, IbdSource, SpectrumEntry};
//! use uuid::Uuid;
//!
//! // Describe the dataset.
//! let description = DatasetDescription {
//!     name: "slide-a".to_string(),
//!     source_uuid: Uuid::new_v4(),
//!     geometry: Geometry { width: 2, height: 1, pixel_size_um: 20.0 },
//!     mass_axis: vec![100.0, 200.0],
//!     mean_spectrum: vec![1.0, 2.0],
//!     base_spectrum: vec![10.0, 20.0],
//!     pixels: PixelTable::new(vec![
//!         Pixel { x: 0, y: 0, motor_x: 0.0, motor_y: 0.0 },
//!         Pixel { x: 1, y: 0, motor_x: 20.0, motor_y: 0.0 },
//!     ]),
//! };
//!
//! // Open the raw spectral source and build the container.
//! let directory = vec![
//!     SpectrumEntry { offset: 0, element_count: 2 },
//!     SpectrumEntry { offset: 16, element_count: 2 },
//! ];
//! let mut source = IbdSource::open("slide-a.ibd", DataEncoding::Float64, directory, 2)?;
//! let container = MsiContainer::create(
//!     ".",
//!     description,
//!     &mut source,
//!     &[("TIC".to_string(), vec![3.0, 2.0])],
//!     StreamConfig::default(),
//! )?;
//!
//! // Query an ion image over channels [0, 2).
//! let coefficients = container.normalization("TIC").unwrap().values.clone();
//! let image = container.ion_image(0, 2, &coefficients)?;
//! println!("pixel (0,0) = {}", image.get(0, 0));
//! # Ok::<(), msibin::error::Error>(())
//! ```

#![deny(missing_docs)]

pub mod codec;
pub mod config;
pub mod container;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod geometry;
pub mod layout;
pub mod pool;
pub mod sidecar;
pub mod spectra;

pub use config::StreamConfig;
pub use container::{DatasetDescription, MsiContainer};
pub use error::{Error, Result};
pub use geometry::{Geometry, Pixel, PixelTable, Raster};
