//! Image adjustment and PNG encoding for outgoing frames.
//!
//! The panels accept PNG payloads. Pixel content is produced elsewhere; this
//! module only applies per-panel orientation and brightness and picks the
//! encoding settings.

use crate::error::SessionError;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::imageops::{self, ColorMap};
use image::{ExtendedColorType, ImageEncoder, Rgb, RgbImage};
use std::collections::BTreeMap;

/// Palette size used by the compact encoding.
pub const COMPACT_COLORS: usize = 64;

/// Counter-clockwise rotation applied before sending, keeping the image size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    None,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Parses a rotation in degrees. Only quarter turns are valid.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::None),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    pub fn degrees(&self) -> i32 {
        match self {
            Rotation::None => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

/// Applies rotation and brightness to an image.
pub fn adjust(image: RgbImage, rotation: Rotation, brightness: f32) -> RgbImage {
    let mut image = rotate(image, rotation);
    if (brightness - 1.0).abs() > f32::EPSILON {
        scale_brightness(&mut image, brightness);
    }
    image
}

/// Decodes `png`, applies rotation and brightness, and re-encodes it.
pub fn adjust_png(png: &[u8], rotation: Rotation, brightness: f32) -> Result<Vec<u8>, SessionError> {
    let image = image::load_from_memory(png)?.to_rgb8();
    encode_png(&adjust(image, rotation, brightness))
}

/// Encodes an image as PNG with default settings.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, SessionError> {
    let mut out = Vec::new();
    PngEncoder::new(&mut out).write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(out)
}

/// Reduces the image to 64 colours and encodes it with maximum compression.
///
/// Lossy. Used when frames are prepared ahead of time for streaming, where
/// payload size dominates transfer time.
pub fn encode_png_compact(image: &RgbImage) -> Result<Vec<u8>, SessionError> {
    let mut quantized = image.clone();
    quantize(&mut quantized);

    let mut out = Vec::new();
    PngEncoder::new_with_quality(&mut out, CompressionType::Best, FilterType::Adaptive)
        .write_image(
            quantized.as_raw(),
            quantized.width(),
            quantized.height(),
            ExtendedColorType::Rgb8,
        )?;
    Ok(out)
}

/// Maps the image onto an adaptive palette of at most [`COMPACT_COLORS`]
/// colours.
///
/// Pixels are mapped to their nearest palette entry without error diffusion,
/// so flat areas stay flat and PNG filtering keeps working. Images that
/// already use few enough colours are left unchanged.
pub fn quantize(image: &mut RgbImage) {
    let palette = AdaptivePalette::median_cut(image, COMPACT_COLORS);
    for pixel in image.pixels_mut() {
        palette.map_color(pixel);
    }
}

fn rotate(image: RgbImage, rotation: Rotation) -> RgbImage {
    let (width, height) = image.dimensions();
    let rotated = match rotation {
        Rotation::None => return image,
        Rotation::Deg180 => return imageops::rotate180(&image),
        // Counter-clockwise quarter turns
        Rotation::Deg90 => imageops::rotate270(&image),
        Rotation::Deg270 => imageops::rotate90(&image),
    };
    if rotated.dimensions() == (width, height) {
        return rotated;
    }

    // Non-square: centre on a canvas of the input size
    let mut canvas = RgbImage::new(width, height);
    let x = (width as i64 - rotated.width() as i64) / 2;
    let y = (height as i64 - rotated.height() as i64) / 2;
    imageops::overlay(&mut canvas, &rotated, x, y);
    canvas
}

fn scale_brightness(image: &mut RgbImage, factor: f32) {
    for pixel in image.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = (*channel as f32 * factor).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Colour population: distinct colours with their pixel counts.
type Population = Vec<([u8; 3], u32)>;

/// Palette derived from the image's own colours by median cut.
struct AdaptivePalette {
    colors: Vec<Rgb<u8>>,
}

impl AdaptivePalette {
    fn median_cut(image: &RgbImage, max_colors: usize) -> Self {
        // Ordered map so equal images always produce the same palette
        let mut histogram: BTreeMap<[u8; 3], u32> = BTreeMap::new();
        for pixel in image.pixels() {
            *histogram.entry(pixel.0).or_insert(0) += 1;
        }

        let mut boxes: Vec<Population> = vec![histogram.into_iter().collect()];
        while boxes.len() < max_colors.max(1) {
            let widest = boxes
                .iter()
                .enumerate()
                .filter(|(_, population)| population.len() > 1)
                .map(|(index, population)| {
                    let (channel, range) = widest_channel(population);
                    (index, channel, range)
                })
                .max_by_key(|&(index, _, range)| (range, std::cmp::Reverse(index)));
            let Some((index, channel, _)) = widest else {
                break;
            };

            let mut lower = boxes.swap_remove(index);
            lower.sort_unstable_by_key(|&(color, _)| (color[channel], color));
            let upper = lower.split_off(median_split(&lower));
            boxes.push(lower);
            boxes.push(upper);
        }

        Self {
            colors: boxes.iter().map(|population| mean_color(population)).collect(),
        }
    }

    fn nearest(&self, color: &Rgb<u8>) -> usize {
        let distance = |candidate: &Rgb<u8>| -> i32 {
            color
                .0
                .iter()
                .zip(candidate.0.iter())
                .map(|(&a, &b)| (a as i32 - b as i32).pow(2))
                .sum()
        };
        self.colors
            .iter()
            .enumerate()
            .min_by_key(|(_, candidate)| distance(candidate))
            .map_or(0, |(index, _)| index)
    }
}

impl ColorMap for AdaptivePalette {
    type Color = Rgb<u8>;

    fn index_of(&self, color: &Rgb<u8>) -> usize {
        self.nearest(color)
    }

    fn map_color(&self, color: &mut Rgb<u8>) {
        if let Some(mapped) = self.colors.get(self.nearest(color)) {
            *color = *mapped;
        }
    }
}

/// Channel with the largest value range, and that range.
fn widest_channel(population: &[([u8; 3], u32)]) -> (usize, u8) {
    (0..3)
        .map(|channel| {
            let values = population.iter().map(|(color, _)| color[channel]);
            let min = values.clone().min().unwrap_or(0);
            let max = values.max().unwrap_or(0);
            (channel, max - min)
        })
        .max_by_key(|&(channel, range)| (range, std::cmp::Reverse(channel)))
        .unwrap_or((0, 0))
}

/// Index of the pixel-weighted median of a sorted population. Both halves
/// are non-empty.
fn median_split(population: &[([u8; 3], u32)]) -> usize {
    let total: u64 = population.iter().map(|&(_, count)| count as u64).sum();
    let mut seen = 0u64;
    let mut split = population.len() / 2;
    for (index, &(_, count)) in population.iter().enumerate() {
        seen += count as u64;
        if seen * 2 >= total {
            split = index + 1;
            break;
        }
    }
    split.clamp(1, population.len().saturating_sub(1).max(1))
}

fn mean_color(population: &[([u8; 3], u32)]) -> Rgb<u8> {
    let total: u64 = population.iter().map(|&(_, count)| count as u64).sum();
    if total == 0 {
        return Rgb([0, 0, 0]);
    }
    let mut sums = [0u64; 3];
    for &(color, count) in population {
        for (sum, &value) in sums.iter_mut().zip(color.iter()) {
            *sum += value as u64 * count as u64;
        }
    }
    Rgb(sums.map(|sum| ((sum + total / 2) / total) as u8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 11 % 256) as u8, ((x + y) * 3 % 256) as u8])
        })
    }

    #[test]
    fn test_rotation_from_degrees() {
        assert_eq!(Rotation::from_degrees(0), Some(Rotation::None));
        assert_eq!(Rotation::from_degrees(90), Some(Rotation::Deg90));
        assert_eq!(Rotation::from_degrees(-90), Some(Rotation::Deg270));
        assert_eq!(Rotation::from_degrees(450), Some(Rotation::Deg90));
        assert_eq!(Rotation::from_degrees(45), None);
        assert_eq!(Rotation::Deg180.degrees(), 180);
    }

    #[test]
    fn test_rotate_counter_clockwise() {
        let mut image = RgbImage::new(2, 2);
        image.put_pixel(1, 0, Rgb([255, 0, 0])); // top-right

        let rotated = adjust(image.clone(), Rotation::Deg90, 1.0);
        // A quarter turn counter-clockwise moves top-right to top-left
        assert_eq!(rotated.get_pixel(0, 0), &Rgb([255, 0, 0]));

        let rotated = adjust(image.clone(), Rotation::Deg270, 1.0);
        assert_eq!(rotated.get_pixel(1, 1), &Rgb([255, 0, 0]));

        let rotated = adjust(image, Rotation::Deg180, 1.0);
        assert_eq!(rotated.get_pixel(0, 1), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_rotate_keeps_size_for_non_square() {
        let rotated = adjust(gradient(64, 32), Rotation::Deg90, 1.0);
        assert_eq!(rotated.dimensions(), (64, 32));
    }

    #[test]
    fn test_brightness_scaling() {
        let image = RgbImage::from_pixel(1, 1, Rgb([200, 100, 11]));
        let dimmed = adjust(image, Rotation::None, 0.5);
        assert_eq!(dimmed.get_pixel(0, 0), &Rgb([100, 50, 6]));
    }

    #[test]
    fn test_adjust_png_roundtrip() {
        let png = encode_png(&gradient(32, 32)).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");

        let adjusted = adjust_png(&png, Rotation::None, 1.0).unwrap();
        let decoded = image::load_from_memory(&adjusted).unwrap().to_rgb8();
        assert_eq!(decoded, gradient(32, 32));
    }

    #[test]
    fn test_adjust_png_rejects_garbage() {
        let result = adjust_png(b"not an image", Rotation::None, 1.0);
        assert!(matches!(result, Err(SessionError::Image(_))));
    }

    /// Smooth, non-linear shading: every pixel distinct, no flat areas.
    fn shaded(width: u32, height: u32) -> RgbImage {
        let (w, h) = ((width - 1).max(1), (height - 1).max(1));
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                ((x * x + y * y) * 255 / (w * w + h * h)) as u8,
                (x * y * 255 / (w * h)) as u8,
                (255 - x * x * 255 / (w * w)) as u8,
            ])
        })
    }

    #[test]
    fn test_quantize_limits_palette() {
        let mut image = shaded(32, 32);
        let before: HashSet<[u8; 3]> = image.pixels().map(|p| p.0).collect();
        assert!(before.len() > COMPACT_COLORS);

        quantize(&mut image);
        let colors: HashSet<[u8; 3]> = image.pixels().map(|p| p.0).collect();
        assert!(colors.len() <= COMPACT_COLORS);
        assert!(colors.len() > COMPACT_COLORS / 2);
    }

    #[test]
    fn test_quantize_keeps_small_palettes() {
        let original = RgbImage::from_fn(16, 16, |x, y| {
            Rgb([(x / 4 * 60) as u8, (y / 4 * 60) as u8, 90])
        });
        let mut image = original.clone();
        quantize(&mut image);
        assert_eq!(image, original);
    }

    #[test]
    fn test_quantize_does_not_diffuse_error() {
        let mut image = RgbImage::from_fn(32, 32, |x, _| {
            if x < 16 {
                Rgb([10, 20, 30])
            } else {
                Rgb([200, 210, 220])
            }
        });
        // Noise in one corner must not spread into the flat areas
        for i in 0..100u32 {
            image.put_pixel(i % 10, i / 10, Rgb([(i * 2) as u8, 77, (255 - i) as u8]));
        }
        quantize(&mut image);
        let left = *image.get_pixel(0, 31);
        let right = *image.get_pixel(31, 31);
        assert!((10..32).all(|y| (0..16).all(|x| image.get_pixel(x, y) == &left)));
        assert!((0..32).all(|y| (16..32).all(|x| image.get_pixel(x, y) == &right)));
        assert_ne!(left, right);
    }

    #[test]
    fn test_quantize_is_deterministic() {
        let mut first = shaded(32, 32);
        let mut second = shaded(32, 32);
        quantize(&mut first);
        quantize(&mut second);
        assert_eq!(first, second);
    }

    #[test]
    fn test_compact_encoding_is_smaller() {
        for size in [32, 64] {
            let tile = shaded(size, size);
            let plain = encode_png(&tile).unwrap();
            let compact = encode_png_compact(&tile).unwrap();
            assert!(
                compact.len() < plain.len(),
                "{0}x{0}: compact {1} bytes, plain {2} bytes",
                size,
                compact.len(),
                plain.len()
            );

            let decoded = image::load_from_memory(&compact).unwrap().to_rgb8();
            assert_eq!(decoded.dimensions(), (size, size));
        }
    }
}
