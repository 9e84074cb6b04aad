//! Decoders for encapsulated (compressed) pixel data.
//!
//! [`FragmentCodec`] is the seam between frame selection and decompression.
//! [`RegistryCodec`] hands one frame to the `dicom-pixeldata` transfer syntax
//! registry, so every encapsulated syntax the registry can decode is covered.

use crate::error::DecodeError;
use crate::metadata::{Compression, PhotometricInterpretation, PixelEncoding, SliceMetadata, TransferSyntax};
use dicom::core::value::{PixelFragmentSequence, Value};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::{DefaultDicomObject, FileDicomObject, FileMetaTableBuilder, StandardDataDictionary};
use dicom::pixeldata::PixelDecoder;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom_dictionary_std::tags;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const SECONDARY_CAPTURE_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.7";
const FRAME_INSTANCE_UID: &str = "2.25.0";

/// Decoded bytes of one frame plus the layout they are in.
///
/// The bytes are native little endian and interleaved.
#[derive(Debug, Clone)]
pub struct CodecOutput {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub samples_per_pixel: u16,
    pub bits_allocated: u16,
    pub photometric: PhotometricInterpretation,
}

pub trait FragmentCodec: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a fragment opens a new frame. Used to group fragments when
    /// the Basic Offset Table cannot be relied upon.
    fn is_frame_start(&self, fragment: &[u8]) -> bool {
        let _ = fragment;
        true
    }

    /// Decodes the concatenated fragments of one frame.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Codec`] when the stream is corrupt and
    /// [`DecodeError::UnsupportedEncoding`] for layouts the codec rejects.
    fn decode(&self, encoded: &[u8], metadata: &SliceMetadata) -> Result<CodecOutput, DecodeError>;
}

/// Codec of an encapsulated transfer syntax, `None` for native syntaxes and
/// for syntaxes the registry cannot decode.
#[must_use]
pub fn codec_for(syntax: &TransferSyntax) -> Option<RegistryCodec> {
    let PixelEncoding::Encapsulated(compression) = syntax.encoding else {
        return None;
    };
    let registered = TransferSyntaxRegistry
        .get(&syntax.uid)
        .filter(|ts| ts.can_decode_all())?;
    Some(RegistryCodec {
        uid: syntax.uid.clone(),
        name: registered.name().to_string(),
        compression,
    })
}

/// One frame through `dicom-pixeldata`.
#[derive(Debug, Clone)]
pub struct RegistryCodec {
    uid: String,
    name: String,
    compression: Compression,
}

impl RegistryCodec {
    /// Single-frame object carrying the slice's image pixel module and the
    /// encoded frame as its only fragment.
    fn frame_object(&self, encoded: &[u8], metadata: &SliceMetadata) -> Result<DefaultDicomObject, DecodeError> {
        let meta = FileMetaTableBuilder::new()
            .transfer_syntax(self.uid.as_str())
            .media_storage_sop_class_uid(SECONDARY_CAPTURE_IMAGE_STORAGE)
            .media_storage_sop_instance_uid(FRAME_INSTANCE_UID)
            .build()
            .map_err(|e| DecodeError::Codec(format!("{}: {e}", self.name)))?;
        let mut object = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);

        let high_bit = metadata.bits_stored.saturating_sub(1);
        let pixel_representation = u16::from(metadata.is_signed());
        for (tag, value) in [
            (tags::SAMPLES_PER_PIXEL, metadata.samples_per_pixel),
            (tags::PLANAR_CONFIGURATION, 0),
            (tags::ROWS, metadata.rows),
            (tags::COLUMNS, metadata.columns),
            (tags::BITS_ALLOCATED, metadata.bits_allocated),
            (tags::BITS_STORED, metadata.bits_stored),
            (tags::HIGH_BIT, high_bit),
            (tags::PIXEL_REPRESENTATION, pixel_representation),
        ] {
            object.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
        }
        object.put(DataElement::new(
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            PrimitiveValue::from(metadata.photometric_interpretation.to_string()),
        ));
        object.put(DataElement::new(
            tags::NUMBER_OF_FRAMES,
            VR::IS,
            PrimitiveValue::from("1"),
        ));
        let fragments = PixelFragmentSequence::new(Vec::<u32>::new(), vec![encoded.to_vec()]);
        object.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            Value::PixelSequence(fragments),
        ));
        Ok(object)
    }
}

impl FragmentCodec for RegistryCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_frame_start(&self, fragment: &[u8]) -> bool {
        match self.compression {
            Compression::Jpeg => fragment.starts_with(&JPEG_SOI),
            Compression::RleLossless | Compression::Other => true,
        }
    }

    fn decode(&self, encoded: &[u8], metadata: &SliceMetadata) -> Result<CodecOutput, DecodeError> {
        let object = self.frame_object(encoded, metadata)?;
        let decoded = object
            .decode_pixel_data()
            .map_err(|e| DecodeError::Codec(format!("{}: {e}", self.name)))?;

        let samples_per_pixel = decoded.samples_per_pixel();
        // JPEG color comes out of the decoder as RGB whatever the header says
        let photometric = if self.compression == Compression::Jpeg && samples_per_pixel == 3 {
            PhotometricInterpretation::Rgb
        } else {
            decoded
                .photometric_interpretation()
                .as_str()
                .parse::<PhotometricInterpretation>()
                .unwrap_or_else(|()| metadata.photometric_interpretation.clone())
        };

        Ok(CodecOutput {
            bytes: decoded.data().to_vec(),
            width: decoded.columns(),
            height: decoded.rows(),
            samples_per_pixel,
            bits_allocated: decoded.bits_allocated(),
            photometric,
        })
    }
}
