//! Display mapping: decoded samples to an 8-bit RGBA raster.

use crate::decoder::{DecodedFrame, FrameSamples, decode_frame};
use crate::error::DecodeError;
use crate::metadata::{SliceMetadata, Window, parse_metadata};
use image::{ImageFormat, RgbaImage};
use rayon::prelude::*;
use std::io::Cursor;

const PLACEHOLDER_SIZE: u32 = 256;
const PLACEHOLDER_BACKGROUND: [u8; 4] = [32, 32, 32, 255];
const PLACEHOLDER_MARK: [u8; 4] = [200, 32, 32, 255];

/// 8-bit RGBA raster, rows top to bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RasterImage {
    /// Returns `None` when `pixels` does not hold `width * height` RGBA values.
    #[must_use]
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        (pixels.len() == width as usize * height as usize * 4).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    #[must_use]
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self {
            width,
            height,
            pixels: rgba.repeat(width as usize * height as usize),
        }
    }

    /// Fixed 256x256 dark raster crossed by a red X, returned in place of a
    /// frame that could not be produced.
    #[must_use]
    pub fn placeholder() -> Self {
        let mut raster = Self::filled(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE, PLACEHOLDER_BACKGROUND);
        for i in 0..PLACEHOLDER_SIZE {
            for offset in [0, 1] {
                let j = (i + offset).min(PLACEHOLDER_SIZE - 1);
                raster.set_pixel(i, j, PLACEHOLDER_MARK);
                raster.set_pixel(PLACEHOLDER_SIZE - 1 - i, j, PLACEHOLDER_MARK);
            }
        }
        raster
    }

    #[inline]
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2], self.pixels[i + 3]]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        self.pixels[i..i + 4].copy_from_slice(&rgba);
    }

    #[must_use]
    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
    }

    /// Lossless PNG encoding of the raster.
    ///
    /// # Errors
    ///
    /// Returns the encoder error of the `image` crate.
    pub fn to_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut out = Cursor::new(Vec::new());
        image::write_buffer_with_format(
            &mut out,
            &self.pixels,
            self.width,
            self.height,
            image::ExtendedColorType::Rgba8,
            ImageFormat::Png,
        )?;
        Ok(out.into_inner())
    }
}

/// Maps a decoded frame to RGBA.
///
/// Color frames are copied as is. Grayscale frames are rescaled, windowed and,
/// for MONOCHROME1, inverted. The window is `window` when valid, else the
/// slice's own window, else the observed range of the rescaled values.
#[must_use]
pub fn map_to_raster(
    frame: &DecodedFrame,
    metadata: &SliceMetadata,
    window: Option<Window>,
) -> RasterImage {
    if let FrameSamples::Rgb(rgb) = &frame.samples {
        let pixels = rgb
            .par_chunks_exact(3)
            .flat_map_iter(|px| [px[0], px[1], px[2], u8::MAX])
            .collect();
        return RasterImage {
            width: frame.width,
            height: frame.height,
            pixels,
        };
    }

    let rescale = metadata.rescale;
    let values: Vec<f64> = (0..frame.pixel_count())
        .into_par_iter()
        .map(|i| rescale.apply(frame.gray_at(i)))
        .collect();

    let (low, high) = window
        .filter(Window::is_valid)
        .or(metadata.window.filter(Window::is_valid))
        .map_or_else(|| observed_bounds(&values), |w| w.bounds());
    let range = high - low;
    let invert = frame.photometric.should_invert();

    let pixels = values
        .par_iter()
        .flat_map_iter(|&value| {
            let normalized = ((value - low) / range).clamp(0.0, 1.0);
            let mut level = (normalized * 255.0).round() as u8;
            if invert {
                level = u8::MAX - level;
            }
            [level, level, level, u8::MAX]
        })
        .collect();

    RasterImage {
        width: frame.width,
        height: frame.height,
        pixels,
    }
}

/// `[min, max]` of the values, widened to `[min, min + 1]` when flat.
fn observed_bounds(values: &[f64]) -> (f64, f64) {
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if !min.is_finite() || !max.is_finite() {
        return (0.0, 1.0);
    }
    if max > min { (min, max) } else { (min, min + 1.0) }
}

/// Parses, decodes and maps one frame of a slice buffer.
///
/// # Errors
///
/// Any [`DecodeError`] of parsing or decoding.
pub fn render_frame(
    buffer: &[u8],
    frame_index: u32,
    window: Option<Window>,
) -> Result<RasterImage, DecodeError> {
    let metadata = parse_metadata(buffer)?;
    let frame = decode_frame(&metadata, frame_index)?;
    Ok(map_to_raster(&frame, &metadata, window))
}

#[derive(Debug)]
pub enum FrameOutcome {
    Rendered(RasterImage),
    Placeholder {
        raster: RasterImage,
        reason: DecodeError,
    },
}

impl FrameOutcome {
    #[must_use]
    pub fn raster(&self) -> &RasterImage {
        match self {
            Self::Rendered(raster) | Self::Placeholder { raster, .. } => raster,
        }
    }

    #[must_use]
    pub fn into_raster(self) -> RasterImage {
        match self {
            Self::Rendered(raster) | Self::Placeholder { raster, .. } => raster,
        }
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder { .. })
    }
}

/// Like [`render_frame`] but never fails: a frame that cannot be produced
/// yields the marked placeholder raster.
#[must_use]
pub fn render_frame_or_placeholder(
    buffer: &[u8],
    frame_index: u32,
    window: Option<Window>,
) -> FrameOutcome {
    match render_frame(buffer, frame_index, window) {
        Ok(raster) => FrameOutcome::Rendered(raster),
        Err(reason) => {
            log::warn!("frame {frame_index} replaced by placeholder: {reason}");
            FrameOutcome::Placeholder {
                raster: RasterImage::placeholder(),
                reason,
            }
        }
    }
}
