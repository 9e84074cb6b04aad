//! Pixel frame decoding: raw slice bytes to one numeric sample buffer.

use crate::codec::{FragmentCodec, codec_for};
use crate::error::DecodeError;
use crate::metadata::{
    PhotometricInterpretation, PixelData, PixelEncoding, PlanarConfiguration, SliceMetadata,
};
use std::borrow::Cow;
use std::ops::Range;

/// Sample storage of a decoded frame, chosen by bit depth, pixel
/// representation and samples per pixel.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameSamples {
    U8(Vec<u8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    /// Interleaved 8-bit RGB.
    Rgb(Vec<u8>),
}

/// One decoded frame. Produced per request, never cached.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub samples_per_pixel: u16,
    /// Photometric interpretation of `samples`, RGB once color was decoded.
    pub photometric: PhotometricInterpretation,
    pub samples: FrameSamples,
}

impl DecodedFrame {
    #[inline]
    #[must_use]
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    #[inline]
    #[must_use]
    pub fn is_color(&self) -> bool {
        matches!(self.samples, FrameSamples::Rgb(_))
    }

    /// Stored value of pixel `index`; color pixels yield their channel average.
    #[inline]
    #[must_use]
    pub fn gray_at(&self, index: usize) -> f64 {
        match &self.samples {
            FrameSamples::U8(v) => f64::from(v[index]),
            FrameSamples::U16(v) => f64::from(v[index]),
            FrameSamples::I16(v) => f64::from(v[index]),
            FrameSamples::Rgb(v) => {
                let px = &v[index * 3..index * 3 + 3];
                (f64::from(px[0]) + f64::from(px[1]) + f64::from(px[2])) / 3.0
            }
        }
    }
}

/// How the bytes of one frame are laid out.
struct SampleLayout {
    width: u32,
    height: u32,
    samples_per_pixel: u16,
    bits_allocated: u16,
    bits_stored: u16,
    signed: bool,
    big_endian: bool,
    planar: PlanarConfiguration,
    photometric: PhotometricInterpretation,
}

impl SampleLayout {
    fn of(metadata: &SliceMetadata) -> Self {
        Self {
            width: u32::from(metadata.columns),
            height: u32::from(metadata.rows),
            samples_per_pixel: metadata.samples_per_pixel,
            bits_allocated: metadata.bits_allocated,
            bits_stored: metadata.bits_stored,
            signed: metadata.is_signed(),
            big_endian: metadata.transfer_syntax.big_endian,
            planar: metadata.planar_configuration,
            photometric: metadata.photometric_interpretation.clone(),
        }
    }

    fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn validate(&self) -> Result<(), DecodeError> {
        match (self.samples_per_pixel, self.bits_allocated) {
            (1, 8 | 16) => Ok(()),
            (1, bits) => Err(DecodeError::UnsupportedEncoding(format!(
                "{bits}-bit grayscale"
            ))),
            (3, 8) if self.photometric == PhotometricInterpretation::YbrFull422 => Err(
                DecodeError::UnsupportedEncoding("uncompressed YBR_FULL_422".to_string()),
            ),
            (3, 8) => Ok(()),
            (3, bits) => Err(DecodeError::UnsupportedEncoding(format!("{bits}-bit color"))),
            (samples, _) => Err(DecodeError::UnsupportedEncoding(format!(
                "{samples} samples per pixel"
            ))),
        }
    }
}

/// Decodes frame `frame_index` of a slice from the pixel data held by its
/// metadata.
///
/// # Errors
///
/// - [`DecodeError::FrameIndexOutOfRange`] when `frame_index >= number_of_frames`
/// - [`DecodeError::MissingPixelData`] when the slice has no pixel data element
/// - [`DecodeError::UnsupportedEncoding`] for layouts or compressions without a decoder
/// - [`DecodeError::TruncatedPixelData`] when the frame extends past the pixel data
pub fn decode_frame(metadata: &SliceMetadata, frame_index: u32) -> Result<DecodedFrame, DecodeError> {
    if frame_index >= metadata.number_of_frames {
        return Err(DecodeError::FrameIndexOutOfRange {
            index: frame_index,
            count: metadata.number_of_frames,
        });
    }
    let codec = match metadata.transfer_syntax.encoding {
        PixelEncoding::Encapsulated(_) => Some(codec_for(&metadata.transfer_syntax).ok_or_else(|| {
            DecodeError::UnsupportedEncoding(format!(
                "compressed transfer syntax {}",
                metadata.transfer_syntax
            ))
        })?),
        PixelEncoding::Native => None,
    };
    let pixel_data = metadata
        .pixel_data
        .as_ref()
        .ok_or(DecodeError::MissingPixelData)?;
    if metadata.rows == 0 || metadata.columns == 0 {
        return Err(DecodeError::EmptyGeometry {
            rows: metadata.rows,
            columns: metadata.columns,
        });
    }

    match (pixel_data, codec) {
        (
            PixelData::Encapsulated {
                offset_table,
                fragments,
            },
            Some(codec),
        ) => {
            let encoded = frame_bytes_encapsulated(
                offset_table,
                fragments,
                frame_index,
                metadata.number_of_frames,
                &codec,
            )?;
            let output = codec.decode(&encoded, metadata)?;
            log::debug!(
                "{} frame {frame_index} decoded to {}x{}x{}",
                codec.name(),
                output.width,
                output.height,
                output.samples_per_pixel
            );

            let bits_stored = if output.bits_allocated == metadata.bits_allocated {
                metadata.bits_stored
            } else {
                output.bits_allocated
            };
            let layout = SampleLayout {
                width: output.width,
                height: output.height,
                samples_per_pixel: output.samples_per_pixel,
                bits_allocated: output.bits_allocated,
                bits_stored,
                signed: metadata.is_signed() && output.samples_per_pixel == 1,
                big_endian: false,
                planar: PlanarConfiguration::Interleaved,
                photometric: output.photometric,
            };
            layout.validate()?;
            interpret(&output.bytes, &layout)
        }
        (PixelData::Native(bytes), None) => {
            let layout = SampleLayout::of(metadata);
            layout.validate()?;
            let bytes = frame_bytes_native(bytes, frame_index, metadata.bytes_per_frame())?;
            interpret(bytes, &layout)
        }
        _ => Err(DecodeError::UnsupportedEncoding(format!(
            "pixel data does not match transfer syntax {}",
            metadata.transfer_syntax
        ))),
    }
}

fn frame_bytes_native(bytes: &[u8], frame_index: u32, bytes_per_frame: usize) -> Result<&[u8], DecodeError> {
    let truncated = |start: Option<usize>| DecodeError::TruncatedPixelData {
        needed: bytes_per_frame,
        available: start.map_or(0, |start| bytes.len().saturating_sub(start)),
    };
    let start = usize::try_from(frame_index)
        .ok()
        .and_then(|frame| frame.checked_mul(bytes_per_frame))
        .ok_or_else(|| truncated(None))?;
    let end = start
        .checked_add(bytes_per_frame)
        .ok_or_else(|| truncated(Some(start)))?;
    bytes.get(start..end).ok_or_else(|| truncated(Some(start)))
}

/// Concatenated fragment bytes of one encapsulated frame.
fn frame_bytes_encapsulated<'a>(
    offset_table: &[u32],
    fragments: &'a [Vec<u8>],
    frame_index: u32,
    frame_count: u32,
    codec: &dyn FragmentCodec,
) -> Result<Cow<'a, [u8]>, DecodeError> {
    if fragments.is_empty() {
        return Err(DecodeError::MissingPixelData);
    }
    let range = fragments_from_offset_table(offset_table, fragments, frame_index, frame_count)
        .or_else(|| fragments_by_scan(fragments, frame_index, frame_count, codec))
        .ok_or_else(|| {
            DecodeError::Codec(format!(
                "cannot locate fragments of frame {frame_index} among {} fragments",
                fragments.len()
            ))
        })?;

    if range.len() == 1 {
        return Ok(Cow::Borrowed(fragments[range.start].as_slice()));
    }
    Ok(Cow::Owned(fragments[range].concat()))
}

/// Offset of each fragment's item tag relative to the first fragment item,
/// the unit of the Basic Offset Table.
fn item_positions(fragments: &[Vec<u8>]) -> Vec<u64> {
    fragments
        .iter()
        .scan(0u64, |next, fragment| {
            let position = *next;
            *next += 8 + fragment.len() as u64;
            Some(position)
        })
        .collect()
}

fn fragments_from_offset_table(
    offset_table: &[u32],
    fragments: &[Vec<u8>],
    frame_index: u32,
    frame_count: u32,
) -> Option<Range<usize>> {
    if offset_table.is_empty() || offset_table.len() != frame_count as usize {
        return None;
    }
    let positions = item_positions(fragments);
    let frame = frame_index as usize;
    let position_of = |offset: u32| positions.iter().position(|&p| p == u64::from(offset));

    let start = position_of(offset_table[frame])?;
    let end = match offset_table.get(frame + 1) {
        Some(&next) => position_of(next)?,
        None => fragments.len(),
    };
    (start < end).then_some(start..end)
}

fn fragments_by_scan(
    fragments: &[Vec<u8>],
    frame_index: u32,
    frame_count: u32,
    codec: &dyn FragmentCodec,
) -> Option<Range<usize>> {
    let fragment_count = fragments.len();
    let frame = frame_index as usize;
    if fragment_count == frame_count as usize {
        return Some(frame..frame + 1);
    }
    if frame_count == 1 {
        return Some(0..fragment_count);
    }

    let starts: Vec<usize> = fragments
        .iter()
        .enumerate()
        .filter(|(_, fragment)| codec.is_frame_start(fragment))
        .map(|(i, _)| i)
        .collect();
    let start = *starts.get(frame)?;
    let end = starts.get(frame + 1).copied().unwrap_or(fragment_count);
    Some(start..end)
}

fn interpret(bytes: &[u8], layout: &SampleLayout) -> Result<DecodedFrame, DecodeError> {
    let pixel_count = layout.pixel_count();
    let needed = pixel_count * usize::from(layout.samples_per_pixel) * usize::from(layout.bits_allocated / 8);
    if bytes.len() < needed {
        return Err(DecodeError::TruncatedPixelData {
            needed,
            available: bytes.len(),
        });
    }
    let bytes = &bytes[..needed];

    let (samples, photometric) = if layout.samples_per_pixel == 3 {
        let interleaved = match layout.planar {
            PlanarConfiguration::Interleaved => bytes.to_vec(),
            PlanarConfiguration::Planar => interleave_planes(bytes, pixel_count),
        };
        let rgb = if layout.photometric == PhotometricInterpretation::YbrFull {
            ycbcr_to_rgb(&interleaved)
        } else {
            interleaved
        };
        (FrameSamples::Rgb(rgb), PhotometricInterpretation::Rgb)
    } else if layout.bits_allocated == 8 {
        (read_8bit(bytes, layout), layout.photometric.clone())
    } else {
        (read_16bit(bytes, layout), layout.photometric.clone())
    };

    Ok(DecodedFrame {
        width: layout.width,
        height: layout.height,
        samples_per_pixel: if layout.samples_per_pixel == 3 { 3 } else { 1 },
        photometric,
        samples,
    })
}

fn read_8bit(bytes: &[u8], layout: &SampleLayout) -> FrameSamples {
    let stored = layout.bits_stored.clamp(1, 8);
    let mask = stored_mask(stored);
    if layout.signed {
        FrameSamples::I16(bytes.iter().map(|&b| sign_extend(u16::from(b), stored)).collect())
    } else {
        FrameSamples::U8(bytes.iter().map(|&b| b & mask as u8).collect())
    }
}

fn read_16bit(bytes: &[u8], layout: &SampleLayout) -> FrameSamples {
    let words = bytes.chunks_exact(2).map(|chunk| {
        if layout.big_endian {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_le_bytes([chunk[0], chunk[1]])
        }
    });

    let stored = layout.bits_stored.clamp(1, 16);
    if layout.signed {
        FrameSamples::I16(words.map(|w| sign_extend(w, stored)).collect())
    } else {
        let mask = stored_mask(stored);
        FrameSamples::U16(words.map(|w| w & mask).collect())
    }
}

#[inline]
fn stored_mask(stored: u16) -> u16 {
    if stored >= 16 { u16::MAX } else { (1 << stored) - 1 }
}

/// Two's complement value held in the low `stored` bits of `raw`.
#[inline]
fn sign_extend(raw: u16, stored: u16) -> i16 {
    let mask = stored_mask(stored);
    let value = raw & mask;
    if value & (1 << (stored - 1)) != 0 {
        (value | !mask) as i16
    } else {
        value as i16
    }
}

/// R1 R2 .. G1 G2 .. B1 B2 .. to R1 G1 B1 R2 G2 B2 ..
fn interleave_planes(bytes: &[u8], pixel_count: usize) -> Vec<u8> {
    let (red, rest) = bytes.split_at(pixel_count);
    let (green, blue) = rest.split_at(pixel_count);
    red.iter()
        .zip(green)
        .zip(blue)
        .flat_map(|((&r, &g), &b)| [r, g, b])
        .collect()
}

/// Full-range ITU-R BT.601 YCbCr to RGB.
fn ycbcr_to_rgb(bytes: &[u8]) -> Vec<u8> {
    bytes
        .chunks_exact(3)
        .flat_map(|ycbcr| {
            let y = f32::from(ycbcr[0]);
            let cb = f32::from(ycbcr[1]) - 128.0;
            let cr = f32::from(ycbcr[2]) - 128.0;

            let r = cr.mul_add(1.402, y);
            let g = cr.mul_add(-0.714_136, cb.mul_add(-0.344_136, y));
            let b = cb.mul_add(1.772, y);

            [
                r.round().clamp(0.0, 255.0) as u8,
                g.round().clamp(0.0, 255.0) as u8,
                b.round().clamp(0.0, 255.0) as u8,
            ]
        })
        .collect()
}
