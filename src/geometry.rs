//! Raster geometry, pixel table and the ion-image value type.

use crate::error::{Error, Result};

/// Dimensions of the regular sampling grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    /// Number of pixels along x.
    pub width: u32,
    /// Number of pixels along y.
    pub height: u32,
    /// Physical pixel size in micrometers.
    pub pixel_size_um: f64,
}

impl Geometry {
    /// Number of cells in one raster.
    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// One acquired pixel: its position on the corrected sampling grid plus
/// the raw motor coordinates it was acquired at (kept for provenance).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pixel {
    /// Corrected grid x coordinate, in `[0, width)`.
    pub x: u32,
    /// Corrected grid y coordinate, in `[0, height)`.
    pub y: u32,
    /// Raw motor x coordinate.
    pub motor_x: f64,
    /// Raw motor y coordinate.
    pub motor_y: f64,
}

/// Dense table of all acquired pixels, indexed by pixel id `0..P`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PixelTable {
    pixels: Vec<Pixel>,
}

impl PixelTable {
    /// Build a pixel table from a dense pixel list.
    pub fn new(pixels: Vec<Pixel>) -> Self {
        Self { pixels }
    }

    /// Number of pixels P.
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    /// True when the table holds no pixels.
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// All pixels in id order.
    pub fn pixels(&self) -> &[Pixel] {
        &self.pixels
    }

    /// Iterate over `(pixel_id, pixel)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Pixel)> {
        self.pixels.iter().enumerate()
    }

    /// Check that every corrected coordinate lies inside `geometry` and
    /// that no two pixels share a grid cell.
    pub fn validate(&self, geometry: &Geometry) -> Result<()> {
        let mut occupied = vec![false; geometry.cell_count()];
        for (id, pixel) in self.iter() {
            if pixel.x >= geometry.width || pixel.y >= geometry.height {
                return Err(Error::FormatMismatch(format!(
                    "pixel {} at ({}, {}) is outside the {}x{} raster",
                    id, pixel.x, pixel.y, geometry.width, geometry.height
                )));
            }
            let cell = pixel.x as usize + geometry.width as usize * pixel.y as usize;
            if occupied[cell] {
                return Err(Error::FormatMismatch(format!(
                    "pixel {} at ({}, {}) collides with an earlier pixel",
                    id, pixel.x, pixel.y
                )));
            }
            occupied[cell] = true;
        }
        Ok(())
    }
}

/// A width x height grid of intensities, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    width: u32,
    height: u32,
    data: Vec<f64>,
}

impl Raster {
    /// Zero-initialized raster for the given geometry.
    pub fn zeros(geometry: &Geometry) -> Self {
        Self {
            width: geometry.width,
            height: geometry.height,
            data: vec![0.0; geometry.cell_count()],
        }
    }

    /// Raster width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Raster height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Intensity at `(x, y)`.
    pub fn get(&self, x: u32, y: u32) -> f64 {
        self.data[self.index(x, y)]
    }

    /// Overwrite the intensity at `(x, y)`.
    pub fn set(&mut self, x: u32, y: u32, value: f64) {
        let index = self.index(x, y);
        self.data[index] = value;
    }

    /// Row-major backing slice.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Merge `other` into `self` by per-cell maximum and return the
    /// result. The operation is associative and commutative, so rasters
    /// decoded by independent workers can be folded in any order.
    pub fn merge_max(mut self, other: Raster) -> Raster {
        debug_assert_eq!((self.width, self.height), (other.width, other.height));
        for (cell, value) in self.data.iter_mut().zip(other.data) {
            if value > *cell {
                *cell = value;
            }
        }
        self
    }

    fn index(&self, x: u32, y: u32) -> usize {
        debug_assert!(x < self.width && y < self.height);
        x as usize + self.width as usize * y as usize
    }
}
