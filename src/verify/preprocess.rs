//! Preprocessing variants for OCR passes.
//!
//! Each verification pass OCRs a differently-preprocessed copy of the source
//! page, in a fixed order: the raw image first, then a hard binarization,
//! then median denoising, then sharpening, and finally a 2× upscale. Passes
//! beyond the defined variants reuse the raw image. The source image is
//! never mutated.

use image::{DynamicImage, imageops::FilterType};
use imageproc::filter::median_filter;

/// Binarization cutoff on an 8-bit scale. Values strictly above this map to
/// white, everything else to black.
const BINARIZE_THRESHOLD: u8 = 128;

/// Sharpening convolution, pre-divided by its weight sum of 16.
const SHARPEN_KERNEL: [f32; 9] = [
    -0.125, -0.125, -0.125, //
    -0.125, 2.0, -0.125, //
    -0.125, -0.125, -0.125,
];

/// The transform applied to the source image before one OCR pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PassVariant {
    /// The unmodified source image.
    Identity,
    /// Two-level quantization at [`BINARIZE_THRESHOLD`].
    Binarize,
    /// 3×3 median filter, to suppress speckle noise.
    Denoise,
    /// Fixed-kernel sharpening, to enhance edge contrast.
    Sharpen,
    /// Dimensions doubled with Lanczos resampling, to help OCR on small
    /// source text. Memory-intensive, so only the fifth pass uses it.
    Upscale,
}

impl PassVariant {
    /// The variant used for the pass with the given index.
    pub fn for_pass(index: usize) -> Self {
        match index {
            0 => Self::Identity,
            1 => Self::Binarize,
            2 => Self::Denoise,
            3 => Self::Sharpen,
            4 => Self::Upscale,
            _ => Self::Identity,
        }
    }

    /// A short name for log messages and warnings.
    pub fn label(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Binarize => "binarize",
            Self::Denoise => "denoise",
            Self::Sharpen => "sharpen",
            Self::Upscale => "upscale",
        }
    }

    /// Apply this transform, returning a new image buffer.
    pub fn apply(self, source: &DynamicImage) -> DynamicImage {
        match self {
            Self::Identity => source.clone(),
            Self::Binarize => binarize(source),
            Self::Denoise => denoise(source),
            Self::Sharpen => source.filter3x3(&SHARPEN_KERNEL),
            Self::Upscale => source.resize_exact(
                source.width() * 2,
                source.height() * 2,
                FilterType::Lanczos3,
            ),
        }
    }
}

/// Two-level quantization: per-intensity for grayscale images, per-channel
/// otherwise.
fn binarize(source: &DynamicImage) -> DynamicImage {
    match source {
        DynamicImage::ImageLuma8(gray) => {
            let mut out = gray.clone();
            for pixel in out.pixels_mut() {
                pixel.0[0] = quantize(pixel.0[0]);
            }
            DynamicImage::ImageLuma8(out)
        }
        other => {
            let mut rgb = other.to_rgb8();
            for pixel in rgb.pixels_mut() {
                for channel in pixel.0.iter_mut() {
                    *channel = quantize(*channel);
                }
            }
            DynamicImage::ImageRgb8(rgb)
        }
    }
}

fn quantize(value: u8) -> u8 {
    if value > BINARIZE_THRESHOLD { 255 } else { 0 }
}

/// 3×3 median filter (radius 1 in each direction).
fn denoise(source: &DynamicImage) -> DynamicImage {
    match source {
        DynamicImage::ImageLuma8(gray) => {
            DynamicImage::ImageLuma8(median_filter(gray, 1, 1))
        }
        other => DynamicImage::ImageRgb8(median_filter(&other.to_rgb8(), 1, 1)),
    }
}

/// An iterator over the preprocessed images for one page's OCR passes.
///
/// Yields exactly `pass_count` images, one per pass, lazily, so only one
/// preprocessed buffer exists at a time.
pub struct PassSequence<'a> {
    source: &'a DynamicImage,
    pass_count: usize,
    next_index: usize,
}

impl<'a> PassSequence<'a> {
    /// Create a sequence of `pass_count` preprocessed copies of `source`.
    pub fn new(source: &'a DynamicImage, pass_count: usize) -> Self {
        Self {
            source,
            pass_count,
            next_index: 0,
        }
    }
}

impl Iterator for PassSequence<'_> {
    type Item = (PassVariant, DynamicImage);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_index >= self.pass_count {
            return None;
        }
        let variant = PassVariant::for_pass(self.next_index);
        self.next_index += 1;
        Some((variant, variant.apply(self.source)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.pass_count - self.next_index;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image() -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::from_fn(8, 8, |x, y| {
            image::Rgb([(x * 32) as u8, (y * 32) as u8, 100])
        }))
    }

    #[test]
    fn yields_exactly_n_images() {
        let source = test_image();
        for pass_count in 1..=7 {
            let variants = PassSequence::new(&source, pass_count).count();
            assert_eq!(variants, pass_count);
        }
    }

    #[test]
    fn variant_order_is_fixed_and_extra_passes_reuse_identity() {
        let source = test_image();
        let variants: Vec<_> = PassSequence::new(&source, 7)
            .map(|(variant, _)| variant)
            .collect();
        assert_eq!(
            variants,
            vec![
                PassVariant::Identity,
                PassVariant::Binarize,
                PassVariant::Denoise,
                PassVariant::Sharpen,
                PassVariant::Upscale,
                PassVariant::Identity,
                PassVariant::Identity,
            ]
        );
    }

    #[test]
    fn source_image_is_not_mutated() {
        let source = test_image();
        let before = source.clone();
        for (_, _image) in PassSequence::new(&source, 5) {}
        assert_eq!(source.as_bytes(), before.as_bytes());
    }

    #[test]
    fn binarize_produces_two_level_output() {
        let binarized = PassVariant::Binarize.apply(&test_image());
        for &byte in binarized.as_bytes() {
            assert!(byte == 0 || byte == 255, "found mid-range value {}", byte);
        }
    }

    #[test]
    fn binarize_keeps_grayscale_images_grayscale() {
        let gray = DynamicImage::ImageLuma8(image::GrayImage::from_fn(4, 4, |x, _| {
            image::Luma([(x * 80) as u8])
        }));
        let binarized = PassVariant::Binarize.apply(&gray);
        assert!(matches!(binarized, DynamicImage::ImageLuma8(_)));
        for &byte in binarized.as_bytes() {
            assert!(byte == 0 || byte == 255);
        }
    }

    #[test]
    fn upscale_doubles_dimensions() {
        let source = test_image();
        let upscaled = PassVariant::Upscale.apply(&source);
        assert_eq!(upscaled.width(), source.width() * 2);
        assert_eq!(upscaled.height(), source.height() * 2);
    }
}
