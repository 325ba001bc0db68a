//! Color histogram fingerprints
//!
//! Images are resampled to a fixed canvas and every channel is quantized into 16 bins.
//! Spatial layout is discarded on purpose: two photos of the same food at different
//! sizes and framings should still land close together.

use image::imageops::FilterType;
use image::{DynamicImage, ImageResult};
use std::path::Path;

/// Side of the square canvas every image is resampled to
pub const CANVAS_SIZE: u32 = 64;
/// Bins per color channel
pub const BIN_COUNT: usize = 16;
/// Largest count a single bin can reach on the canvas
pub const MAX_BIN_COUNT: u32 = CANVAS_SIZE * CANVAS_SIZE;

const BIN_WIDTH: u8 = (256 / BIN_COUNT) as u8;

/// Per-channel bin counts over the resampled canvas. Immutable once computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHistogram {
    red: [u32; BIN_COUNT],
    green: [u32; BIN_COUNT],
    blue: [u32; BIN_COUNT],
}

impl ImageHistogram {
    pub fn from_image(image: &DynamicImage) -> Self {
        let canvas = image
            .resize_exact(CANVAS_SIZE, CANVAS_SIZE, FilterType::Triangle)
            .to_rgb8();
        let mut histogram = Self {
            red: [0; BIN_COUNT],
            green: [0; BIN_COUNT],
            blue: [0; BIN_COUNT],
        };
        for pixel in canvas.pixels() {
            let [r, g, b] = pixel.0;
            histogram.red[(r / BIN_WIDTH) as usize] += 1;
            histogram.green[(g / BIN_WIDTH) as usize] += 1;
            histogram.blue[(b / BIN_WIDTH) as usize] += 1;
        }
        histogram
    }

    /// Decode an in-memory image of any supported format
    pub fn from_bytes(bytes: &[u8]) -> ImageResult<Self> {
        let image = image::load_from_memory(bytes)?;
        Ok(Self::from_image(&image))
    }

    /// Decode an image file, sniffing the format from its content
    pub fn open(path: &Path) -> ImageResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn red(&self) -> &[u32; BIN_COUNT] {
        &self.red
    }

    pub fn green(&self) -> &[u32; BIN_COUNT] {
        &self.green
    }

    pub fn blue(&self) -> &[u32; BIN_COUNT] {
        &self.blue
    }

    fn bins(&self) -> impl Iterator<Item = u32> + '_ {
        self.red.iter().chain(&self.green).chain(&self.blue).copied()
    }

    /// Euclidean distance over all 48 bins
    pub fn distance(&self, other: &Self) -> f64 {
        self.bins()
            .zip(other.bins())
            .map(|(a, b)| {
                let d = a as f64 - b as f64;
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }

    /// Similarity in [0, 1]; 1.0 means identical histograms.
    ///
    /// The normalization assumes every bin could hold the whole canvas, which no real pair of
    /// images reaches, so scores cluster toward the upper half of the range.
    pub fn similarity(&self, other: &Self) -> f64 {
        (1.0 - self.distance(other) / max_distance()).clamp(0.0, 1.0)
    }
}

/// Normalization constant for `similarity`
pub fn max_distance() -> f64 {
    let max = MAX_BIN_COUNT as f64;
    (3.0 * BIN_COUNT as f64 * max * max).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(width: u32, height: u32, color: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)))
    }

    fn stripes(width: u32, height: u32) -> DynamicImage {
        let image = RgbImage::from_fn(width, height, |x, _| {
            if x % 2 == 0 { Rgb([250, 10, 10]) } else { Rgb([10, 10, 250]) }
        });
        DynamicImage::ImageRgb8(image)
    }

    #[test]
    fn test_counts_sum_to_canvas() {
        let h = ImageHistogram::from_image(&stripes(300, 120));
        for channel in [h.red(), h.green(), h.blue()] {
            assert_eq!(channel.iter().sum::<u32>(), MAX_BIN_COUNT);
        }
    }

    #[test]
    fn test_solid_color_lands_in_one_bin() {
        let h = ImageHistogram::from_image(&solid(10, 10, [255, 0, 130]));
        assert_eq!(h.red()[15], MAX_BIN_COUNT);
        assert_eq!(h.green()[0], MAX_BIN_COUNT);
        assert_eq!(h.blue()[130 / 16], MAX_BIN_COUNT);
    }

    #[test]
    fn test_similarity_is_reflexive() {
        let h = ImageHistogram::from_image(&stripes(64, 64));
        assert_eq!(h.similarity(&h), 1.0);
    }

    #[test]
    fn test_resolution_invariance() {
        let small = ImageHistogram::from_image(&solid(8, 8, [40, 200, 90]));
        let large = ImageHistogram::from_image(&solid(640, 480, [40, 200, 90]));
        assert_eq!(small, large);
    }

    #[test]
    fn test_similarity_is_bounded_and_ordered() {
        let red = ImageHistogram::from_image(&solid(32, 32, [250, 0, 0]));
        let dark_red = ImageHistogram::from_image(&solid(32, 32, [200, 0, 0]));
        let blue = ImageHistogram::from_image(&solid(32, 32, [0, 0, 250]));
        for (a, b) in [(&red, &blue), (&red, &dark_red), (&blue, &dark_red)] {
            let s = a.similarity(b);
            assert!((0.0..=1.0).contains(&s), "similarity {} out of range", s);
            assert_eq!(s, b.similarity(a));
        }
        // Only the red channel differs for dark red, both red and blue differ for blue
        assert!(red.similarity(&dark_red) > red.similarity(&blue));
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(ImageHistogram::from_bytes(b"definitely not an image").is_err());
    }

    #[test]
    fn test_from_bytes_png() {
        let mut bytes = std::io::Cursor::new(Vec::new());
        solid(16, 16, [1, 2, 3]).write_to(&mut bytes, image::ImageFormat::Png).unwrap();
        let h = ImageHistogram::from_bytes(bytes.get_ref()).unwrap();
        assert_eq!(h.red()[0], MAX_BIN_COUNT);
    }

    #[test]
    fn test_max_distance_constant() {
        let expected = (3.0 * 16.0 * 4096.0f64 * 4096.0).sqrt();
        assert!((max_distance() - expected).abs() < 1e-9);
    }
}
