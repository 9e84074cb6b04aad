//! Part 10 reading on top of `dicom-object`.
//!
//! The file meta group decides whether a buffer is a DICOM container at all.
//! The dataset is read in full when possible; a dataset that breaks inside
//! the pixel data is re-read up to the pixel data so its header survives.

use crate::error::DecodeError;
use crate::metadata::PixelData;
use dicom::core::value::{PrimitiveValue, Value};
use dicom::object::file::ReadPreamble;
use dicom::object::{DefaultDicomObject, FileMetaTable, OpenFileOptions};
use dicom_dictionary_std::tags;
use std::sync::Arc;

const PREAMBLE_LEN: usize = 128;

/// How much of the dataset to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Extent {
    /// Everything, pixel data included.
    Full,
    /// Stop before the pixel data element.
    Header,
}

/// A slice buffer as read by `dicom-object`.
#[derive(Debug)]
pub(crate) struct SliceObject {
    pub transfer_syntax: String,
    /// `None` when the dataset could not be read under its transfer syntax.
    pub dataset: Option<DefaultDicomObject>,
}

/// Reads the file meta group and as much of the dataset as `extent` asks for.
///
/// # Errors
///
/// [`DecodeError::MalformedContainer`] when the buffer is shorter than the
/// preamble or carries no readable `DICM` file meta group.
pub(crate) fn read_slice(buffer: &[u8], extent: Extent) -> Result<SliceObject, DecodeError> {
    let container = buffer.get(PREAMBLE_LEN..).ok_or_else(|| {
        DecodeError::MalformedContainer(format!(
            "{} bytes is shorter than the {PREAMBLE_LEN}-byte preamble",
            buffer.len()
        ))
    })?;
    let meta = FileMetaTable::from_reader(container)
        .map_err(|e| DecodeError::MalformedContainer(e.to_string()))?;
    let transfer_syntax = meta.transfer_syntax().trim_end_matches(['\0', ' ']).to_string();

    let dataset = match (open(container, extent), extent) {
        (Ok(object), _) => Some(object),
        (Err(e), Extent::Full) => {
            log::warn!("dataset unreadable ({e}), retrying without pixel data");
            open(container, Extent::Header)
                .inspect_err(|e| log::warn!("dataset header unreadable: {e}"))
                .ok()
        }
        (Err(e), Extent::Header) => {
            log::warn!("dataset header unreadable: {e}");
            None
        }
    };

    Ok(SliceObject {
        transfer_syntax,
        dataset,
    })
}

fn open(container: &[u8], extent: Extent) -> Result<DefaultDicomObject, String> {
    let options = OpenFileOptions::new().read_preamble(ReadPreamble::Never);
    let object = match extent {
        Extent::Full => options.from_reader(container),
        Extent::Header => options.read_until(tags::PIXEL_DATA).from_reader(container),
    };
    object.map_err(|e| e.to_string())
}

/// Pixel data of a dataset with native samples re-encoded in the byte order
/// of the transfer syntax.
pub(crate) fn pixel_data(object: &DefaultDicomObject, big_endian: bool) -> Option<PixelData> {
    let element = object.get(tags::PIXEL_DATA)?;
    match element.value() {
        Value::PixelSequence(sequence) => Some(PixelData::Encapsulated {
            offset_table: sequence.offset_table().into(),
            fragments: sequence.fragments().iter().cloned().collect(),
        }),
        Value::Primitive(PrimitiveValue::U16(words)) => Some(PixelData::Native(
            words
                .iter()
                .flat_map(|w| if big_endian { w.to_be_bytes() } else { w.to_le_bytes() })
                .collect(),
        )),
        Value::Primitive(PrimitiveValue::Empty) => None,
        Value::Primitive(primitive) => Some(PixelData::Native(Arc::from(primitive.to_bytes().as_ref()))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SliceBuilder;
    use assert_matches::assert_matches;

    fn rows(slice: &SliceObject) -> Option<u16> {
        slice
            .dataset
            .as_ref()?
            .get(tags::ROWS)
            .and_then(|e| e.to_int::<u16>().ok())
    }

    #[test]
    fn test_short_buffer_is_malformed() {
        assert_matches!(
            read_slice(&[0u8; 100], Extent::Full),
            Err(DecodeError::MalformedContainer(_))
        );
    }

    #[test]
    fn test_missing_magic_is_malformed() {
        let mut buf = SliceBuilder::explicit_little().us(tags::ROWS, 2).build();
        buf[PREAMBLE_LEN..PREAMBLE_LEN + 4].copy_from_slice(b"NOPE");
        assert_matches!(
            read_slice(&buf, Extent::Full),
            Err(DecodeError::MalformedContainer(_))
        );
    }

    #[test]
    fn test_reads_transfer_syntax() {
        let buf = SliceBuilder::explicit_big().us(tags::ROWS, 2).build();
        let slice = read_slice(&buf, Extent::Full).unwrap();
        assert_eq!(slice.transfer_syntax, "1.2.840.10008.1.2.2");
        assert_eq!(rows(&slice), Some(2));
    }

    #[test]
    fn test_sequences_are_read_past() {
        for builder in [SliceBuilder::explicit_little(), SliceBuilder::implicit_little()] {
            let buf = builder
                .undefined_length_sequence(tags::REFERENCED_IMAGE_SEQUENCE)
                .us(tags::ROWS, 7)
                .build();
            assert_eq!(rows(&read_slice(&buf, Extent::Full).unwrap()), Some(7));
        }
    }

    #[test]
    fn test_fragments_and_offset_table() {
        let buf = SliceBuilder::encapsulated("1.2.840.10008.1.2.5")
            .image(1, 1, 1, 8)
            .fragments(Some(vec![0, 12]), vec![vec![1, 2, 3, 4], vec![5, 6]])
            .build();
        let slice = read_slice(&buf, Extent::Full).unwrap();
        let object = slice.dataset.as_ref().unwrap();
        assert_matches!(
            pixel_data(object, false),
            Some(PixelData::Encapsulated { offset_table, fragments })
                if *offset_table == [0, 12] && fragments[1] == [5, 6]
        );
    }

    #[test]
    fn test_big_endian_words_keep_stream_order() {
        let buf = SliceBuilder::explicit_big()
            .image(1, 2, 1, 16)
            .pixels_u16(&[0x0102, 0x0304])
            .build();
        let slice = read_slice(&buf, Extent::Full).unwrap();
        let object = slice.dataset.as_ref().unwrap();
        assert_matches!(
            pixel_data(object, true),
            Some(PixelData::Native(bytes)) if *bytes == [0x01, 0x02, 0x03, 0x04]
        );
    }

    #[test]
    fn test_header_only_skips_pixel_data() {
        let buf = SliceBuilder::explicit_little()
            .image(2, 2, 1, 8)
            .native_pixels(vec![1, 2, 3, 4])
            .build();
        let slice = read_slice(&buf, Extent::Header).unwrap();
        assert_eq!(rows(&slice), Some(2));
        assert!(slice.dataset.as_ref().unwrap().get(tags::PIXEL_DATA).is_none());
    }

    #[test]
    fn test_truncated_pixel_data_keeps_header() {
        let mut buf = SliceBuilder::explicit_little()
            .image(4, 4, 1, 8)
            .native_pixels(vec![7; 16])
            .build();
        buf.truncate(buf.len() - 10);
        let slice = read_slice(&buf, Extent::Full).unwrap();
        assert_eq!(rows(&slice), Some(4));
    }
}
