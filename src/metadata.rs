//! Slice metadata: geometry, encoding and radiometric fields of one slice.

use crate::error::DecodeError;
use crate::parser::{self, Extent};
use dicom::core::Tag;
use dicom::object::DefaultDicomObject;
use dicom_dictionary_std::{tags, uids};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";
const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";
const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
const JPEG_EXTENDED: &str = "1.2.840.10008.1.2.4.51";
const JPEG_LOSSLESS: &str = "1.2.840.10008.1.2.4.57";
const JPEG_LOSSLESS_SV1: &str = "1.2.840.10008.1.2.4.70";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhotometricInterpretation {
    Monochrome1,
    Monochrome2,
    Rgb,
    YbrFull,
    YbrFull422,
    Palette,
    Unknown(String),
}

impl FromStr for PhotometricInterpretation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "MONOCHROME1" => Self::Monochrome1,
            "MONOCHROME2" => Self::Monochrome2,
            "RGB" => Self::Rgb,
            "YBR_FULL" => Self::YbrFull,
            "YBR_FULL_422" => Self::YbrFull422,
            "PALETTE COLOR" => Self::Palette,
            other => Self::Unknown(other.to_string()),
        })
    }
}

impl PhotometricInterpretation {
    #[inline(always)]
    #[must_use]
    pub fn is_grayscale(&self) -> bool {
        matches!(self, Self::Monochrome1 | Self::Monochrome2)
    }

    /// MONOCHROME1 displays its minimum as white.
    #[inline(always)]
    #[must_use]
    pub fn should_invert(&self) -> bool {
        matches!(self, Self::Monochrome1)
    }
}

impl fmt::Display for PhotometricInterpretation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Monochrome1 => write!(f, "MONOCHROME1"),
            Self::Monochrome2 => write!(f, "MONOCHROME2"),
            Self::Rgb => write!(f, "RGB"),
            Self::YbrFull => write!(f, "YBR_FULL"),
            Self::YbrFull422 => write!(f, "YBR_FULL_422"),
            Self::Palette => write!(f, "PALETTE COLOR"),
            Self::Unknown(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PixelRepresentation {
    #[default]
    Unsigned,
    Signed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PlanarConfiguration {
    /// R1 G1 B1 R2 G2 B2 ...
    #[default]
    Interleaved,
    /// R1 R2 ... G1 G2 ... B1 B2 ...
    Planar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Jpeg,
    RleLossless,
    /// Any other encapsulated syntax; decodable when the registry has a codec.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelEncoding {
    /// Native samples, deflated datasets included once inflated.
    Native,
    Encapsulated(Compression),
}

/// DICOM transfer syntax as far as pixel decoding is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSyntax {
    pub uid: String,
    pub encoding: PixelEncoding,
    pub big_endian: bool,
}

impl TransferSyntax {
    #[must_use]
    #[allow(deprecated)] // Explicit VR Big Endian is retired but still in use
    pub fn from_uid(uid: &str) -> Self {
        let uid = uid.trim_end_matches(['\0', ' ']);
        let (encoding, big_endian) = match uid {
            uids::IMPLICIT_VR_LITTLE_ENDIAN | uids::EXPLICIT_VR_LITTLE_ENDIAN => {
                (PixelEncoding::Native, false)
            }
            uids::EXPLICIT_VR_BIG_ENDIAN => (PixelEncoding::Native, true),
            DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN => (PixelEncoding::Native, false),
            RLE_LOSSLESS => (PixelEncoding::Encapsulated(Compression::RleLossless), false),
            JPEG_BASELINE | JPEG_EXTENDED | JPEG_LOSSLESS | JPEG_LOSSLESS_SV1 => {
                (PixelEncoding::Encapsulated(Compression::Jpeg), false)
            }
            _ => (PixelEncoding::Encapsulated(Compression::Other), false),
        };
        Self {
            uid: uid.to_string(),
            encoding,
            big_endian,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        matches!(self.encoding, PixelEncoding::Encapsulated(_))
    }
}

impl Default for TransferSyntax {
    fn default() -> Self {
        Self::from_uid(uids::IMPLICIT_VR_LITTLE_ENDIAN)
    }
}

impl fmt::Display for TransferSyntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uid)
    }
}

/// Rescale parameters for converting stored values to real units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RescaleParams {
    pub slope: f64,
    pub intercept: f64,
}

impl RescaleParams {
    #[must_use]
    pub fn new(slope: f64, intercept: f64) -> Self {
        Self { slope, intercept }
    }

    #[inline(always)]
    #[must_use]
    pub fn apply(&self, value: f64) -> f64 {
        value.mul_add(self.slope, self.intercept)
    }
}

impl Default for RescaleParams {
    fn default() -> Self {
        Self::new(1.0, 0.0)
    }
}

/// Display window given as center and width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub center: f64,
    pub width: f64,
}

impl Window {
    #[must_use]
    pub fn new(center: f64, width: f64) -> Self {
        Self { center, width }
    }

    /// Window spanning `[low, high]`.
    #[must_use]
    pub fn from_bounds(low: f64, high: f64) -> Self {
        Self {
            center: (low + high) / 2.0,
            width: high - low,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.center.is_finite() && self.width.is_finite() && self.width > 0.0
    }

    /// Returns `(low, high)`.
    #[inline]
    #[must_use]
    pub fn bounds(&self) -> (f64, f64) {
        let half = self.width / 2.0;
        (self.center - half, self.center + half)
    }
}

/// Pixel data element of a slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelData {
    /// Native samples in the byte order of the transfer syntax.
    Native(Arc<[u8]>),
    Encapsulated {
        /// Basic Offset Table entries, empty when absent.
        offset_table: Arc<[u32]>,
        fragments: Arc<[Vec<u8>]>,
    },
}

impl PixelData {
    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Native(bytes) => bytes.len(),
            Self::Encapsulated { fragments, .. } => fragments.iter().map(Vec::len).sum(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn fragment_count(&self) -> usize {
        match self {
            Self::Native(_) => 0,
            Self::Encapsulated { fragments, .. } => fragments.len(),
        }
    }
}

/// Metadata of one slice. Every field has a default; only an unreadable
/// container fails to parse.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceMetadata {
    pub rows: u16,
    pub columns: u16,
    pub samples_per_pixel: u16,
    pub bits_allocated: u16,
    pub bits_stored: u16,
    pub pixel_representation: PixelRepresentation,
    pub planar_configuration: PlanarConfiguration,
    pub photometric_interpretation: PhotometricInterpretation,
    pub transfer_syntax: TransferSyntax,
    pub rescale: RescaleParams,
    /// First window of the slice, only when finite with a positive width.
    pub window: Option<Window>,
    pub number_of_frames: u32,
    pub instance_number: Option<i64>,
    /// (row spacing, column spacing) in mm.
    pub pixel_spacing: Option<(f64, f64)>,
    pub slice_thickness: Option<f64>,
    pub image_position: Option<[f64; 3]>,
    pub pixel_data: Option<PixelData>,
}

impl Default for SliceMetadata {
    fn default() -> Self {
        Self {
            rows: 0,
            columns: 0,
            samples_per_pixel: 1,
            bits_allocated: 8,
            bits_stored: 8,
            pixel_representation: PixelRepresentation::Unsigned,
            planar_configuration: PlanarConfiguration::Interleaved,
            photometric_interpretation: PhotometricInterpretation::Monochrome2,
            transfer_syntax: TransferSyntax::default(),
            rescale: RescaleParams::default(),
            window: None,
            number_of_frames: 1,
            instance_number: None,
            pixel_spacing: None,
            slice_thickness: None,
            image_position: None,
            pixel_data: None,
        }
    }
}

impl SliceMetadata {
    #[inline]
    #[must_use]
    pub fn pixel_count(&self) -> usize {
        usize::from(self.rows) * usize::from(self.columns)
    }

    /// Size of one native frame in bytes.
    #[inline]
    #[must_use]
    pub fn bytes_per_frame(&self) -> usize {
        self.pixel_count() * usize::from(self.samples_per_pixel) * usize::from(self.bits_allocated / 8)
    }

    #[inline]
    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.pixel_representation == PixelRepresentation::Signed
    }
}

/// Parses one slice buffer, pixel data included.
///
/// # Errors
///
/// Returns [`DecodeError::MalformedContainer`] when the preamble, the `DICM`
/// magic or the file meta group cannot be read. Any other absent or invalid
/// field falls back to its default.
pub fn parse_metadata(buffer: &[u8]) -> Result<SliceMetadata, DecodeError> {
    parse(buffer, Extent::Full)
}

/// Like [`parse_metadata`] but stops before the pixel data, so
/// `pixel_data` is always `None`. Enough for frame counts and sort keys.
///
/// # Errors
///
/// Same as [`parse_metadata`].
pub fn parse_header(buffer: &[u8]) -> Result<SliceMetadata, DecodeError> {
    parse(buffer, Extent::Header)
}

fn parse(buffer: &[u8], extent: Extent) -> Result<SliceMetadata, DecodeError> {
    let slice = parser::read_slice(buffer, extent)?;
    let transfer_syntax = if slice.transfer_syntax.is_empty() {
        TransferSyntax::default()
    } else {
        TransferSyntax::from_uid(&slice.transfer_syntax)
    };
    let fields = Fields(slice.dataset.as_ref());

    let bits_allocated = fields.u16(tags::BITS_ALLOCATED).unwrap_or(8);
    let photometric_interpretation = fields
        .string(tags::PHOTOMETRIC_INTERPRETATION)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
        .unwrap_or(PhotometricInterpretation::Monochrome2);

    let window = match (
        fields.first_float(tags::WINDOW_CENTER),
        fields.first_float(tags::WINDOW_WIDTH),
    ) {
        (Some(center), Some(width)) => Some(Window::new(center, width)).filter(Window::is_valid),
        _ => None,
    };

    let pixel_spacing = match fields.floats(tags::PIXEL_SPACING).as_slice() {
        [row, column, ..] if *row > 0.0 && *column > 0.0 => Some((*row, *column)),
        _ => None,
    };
    let image_position = match fields.floats(tags::IMAGE_POSITION_PATIENT).as_slice() {
        [x, y, z, ..] => Some([*x, *y, *z]),
        _ => None,
    };
    let pixel_data = slice
        .dataset
        .as_ref()
        .and_then(|object| parser::pixel_data(object, transfer_syntax.big_endian));

    Ok(SliceMetadata {
        rows: fields.u16(tags::ROWS).unwrap_or(0),
        columns: fields.u16(tags::COLUMNS).unwrap_or(0),
        samples_per_pixel: fields.u16(tags::SAMPLES_PER_PIXEL).filter(|&s| s > 0).unwrap_or(1),
        bits_allocated,
        bits_stored: fields
            .u16(tags::BITS_STORED)
            .filter(|&b| b > 0 && b <= bits_allocated)
            .unwrap_or(bits_allocated),
        pixel_representation: match fields.u16(tags::PIXEL_REPRESENTATION) {
            Some(1) => PixelRepresentation::Signed,
            _ => PixelRepresentation::Unsigned,
        },
        planar_configuration: match fields.u16(tags::PLANAR_CONFIGURATION) {
            Some(1) => PlanarConfiguration::Planar,
            _ => PlanarConfiguration::Interleaved,
        },
        photometric_interpretation,
        rescale: RescaleParams::new(
            fields.first_float(tags::RESCALE_SLOPE).unwrap_or(1.0),
            fields.first_float(tags::RESCALE_INTERCEPT).unwrap_or(0.0),
        ),
        window,
        number_of_frames: fields
            .int(tags::NUMBER_OF_FRAMES)
            .and_then(|n| u32::try_from(n).ok())
            .filter(|&n| n >= 1)
            .unwrap_or(1),
        instance_number: fields.int(tags::INSTANCE_NUMBER),
        pixel_spacing,
        slice_thickness: fields.first_float(tags::SLICE_THICKNESS).filter(|&t| t > 0.0),
        image_position,
        pixel_data,
        transfer_syntax,
    })
}

/// Lenient typed reads; anything absent or unconvertible is `None`.
struct Fields<'a>(Option<&'a DefaultDicomObject>);

impl Fields<'_> {
    fn u16(&self, tag: Tag) -> Option<u16> {
        self.0?.get(tag)?.to_int::<u16>().ok()
    }

    fn string(&self, tag: Tag) -> Option<String> {
        let value = self.0?.get(tag)?.to_str().ok()?;
        Some(value.trim_matches(['\0', ' ']).to_string())
    }

    fn floats(&self, tag: Tag) -> Vec<f64> {
        self.0
            .and_then(|object| object.get(tag))
            .and_then(|e| e.to_multi_float64().ok())
            .map(|values| values.into_iter().filter(|v| v.is_finite()).collect())
            .unwrap_or_default()
    }

    fn first_float(&self, tag: Tag) -> Option<f64> {
        self.floats(tag).first().copied()
    }

    fn int(&self, tag: Tag) -> Option<i64> {
        let element = self.0?.get(tag)?;
        element.to_int::<i64>().ok().or_else(|| {
            element
                .to_float64()
                .ok()
                .filter(|v| v.is_finite())
                .map(|v| v as i64)
        })
    }
}
