//! Synthetic Part 10 slices for unit tests.

use dicom::core::Tag;
use dicom_dictionary_std::tags;

const ITEM: Tag = Tag(0xFFFE, 0xE000);
const ITEM_DELIMITATION: Tag = Tag(0xFFFE, 0xE00D);
const SEQUENCE_DELIMITATION: Tag = Tag(0xFFFE, 0xE0DD);
const SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";

/// UI value padded with NUL to even length.
fn ui(value: &str) -> Vec<u8> {
    let mut bytes = value.as_bytes().to_vec();
    if bytes.len() % 2 == 1 {
        bytes.push(0);
    }
    bytes
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Layout {
    ImplicitLittle,
    ExplicitLittle,
    ExplicitBig,
}

enum Entry {
    Value { vr: [u8; 2], bytes: Vec<u8> },
    Sequence,
}

enum Pixels {
    None,
    Native(Vec<u8>),
    Encapsulated {
        offset_table: Option<Vec<u32>>,
        fragments: Vec<Vec<u8>>,
    },
}

pub(crate) struct SliceBuilder {
    uid: String,
    layout: Layout,
    elements: Vec<(Tag, Entry)>,
    pixels: Pixels,
}

impl SliceBuilder {
    fn with(uid: &str, layout: Layout) -> Self {
        Self {
            uid: uid.to_string(),
            layout,
            elements: Vec::new(),
            pixels: Pixels::None,
        }
    }

    pub(crate) fn explicit_little() -> Self {
        Self::with("1.2.840.10008.1.2.1", Layout::ExplicitLittle)
    }

    pub(crate) fn implicit_little() -> Self {
        Self::with("1.2.840.10008.1.2", Layout::ImplicitLittle)
    }

    pub(crate) fn explicit_big() -> Self {
        Self::with("1.2.840.10008.1.2.2", Layout::ExplicitBig)
    }

    /// Encapsulated syntaxes are always explicit little endian.
    pub(crate) fn encapsulated(uid: &str) -> Self {
        Self::with(uid, Layout::ExplicitLittle)
    }

    /// A later value for the same tag replaces the earlier one.
    fn set(&mut self, tag: Tag, entry: Entry) {
        self.elements.retain(|(t, _)| *t != tag);
        self.elements.push((tag, entry));
    }

    pub(crate) fn us(mut self, tag: Tag, value: u16) -> Self {
        let bytes = match self.layout {
            Layout::ExplicitBig => value.to_be_bytes().to_vec(),
            _ => value.to_le_bytes().to_vec(),
        };
        self.set(tag, Entry::Value { vr: *b"US", bytes });
        self
    }

    pub(crate) fn string(mut self, tag: Tag, vr: &str, value: &str) -> Self {
        let mut bytes = value.as_bytes().to_vec();
        if bytes.len() % 2 == 1 {
            bytes.push(if vr == "UI" { 0 } else { b' ' });
        }
        let vr = vr.as_bytes();
        self.set(
            tag,
            Entry::Value {
                vr: [vr[0], vr[1]],
                bytes,
            },
        );
        self
    }

    pub(crate) fn undefined_length_sequence(mut self, tag: Tag) -> Self {
        self.set(tag, Entry::Sequence);
        self
    }

    /// Rows, columns, samples per pixel and bit depth in one go.
    pub(crate) fn image(self, rows: u16, columns: u16, samples_per_pixel: u16, bits: u16) -> Self {
        self.us(tags::ROWS, rows)
            .us(tags::COLUMNS, columns)
            .us(tags::SAMPLES_PER_PIXEL, samples_per_pixel)
            .us(tags::BITS_ALLOCATED, bits)
            .us(tags::BITS_STORED, bits)
    }

    pub(crate) fn photometric(self, value: &str) -> Self {
        self.string(tags::PHOTOMETRIC_INTERPRETATION, "CS", value)
    }

    pub(crate) fn frames(self, count: u32) -> Self {
        self.string(tags::NUMBER_OF_FRAMES, "IS", &count.to_string())
    }

    /// Padded to even length like any other value.
    pub(crate) fn native_pixels(mut self, mut bytes: Vec<u8>) -> Self {
        if bytes.len() % 2 == 1 {
            bytes.push(0);
        }
        self.pixels = Pixels::Native(bytes);
        self
    }

    /// 16-bit samples written in the builder's byte order.
    pub(crate) fn pixels_u16(self, values: &[u16]) -> Self {
        let big = self.layout == Layout::ExplicitBig;
        let bytes = values
            .iter()
            .flat_map(|v| if big { v.to_be_bytes() } else { v.to_le_bytes() })
            .collect();
        self.native_pixels(bytes)
    }

    pub(crate) fn fragments(mut self, offset_table: Option<Vec<u32>>, fragments: Vec<Vec<u8>>) -> Self {
        self.pixels = Pixels::Encapsulated {
            offset_table,
            fragments,
        };
        self
    }

    pub(crate) fn build(mut self) -> Vec<u8> {
        let mut out = vec![0u8; 128];
        out.extend_from_slice(b"DICM");

        // the file meta group is always explicit VR little endian
        let mut meta = Writer {
            out: Vec::new(),
            layout: Layout::ExplicitLittle,
        };
        meta.element(Tag(0x0002, 0x0001), *b"OB", &[0, 1]);
        meta.element(Tag(0x0002, 0x0002), *b"UI", &ui(SECONDARY_CAPTURE));
        meta.element(Tag(0x0002, 0x0003), *b"UI", &ui("1.2.3.4"));
        meta.element(Tag(0x0002, 0x0010), *b"UI", &ui(&self.uid));
        meta.element(Tag(0x0002, 0x0012), *b"UI", &ui("1.2.3.4.5"));
        let mut group = Writer {
            out,
            layout: Layout::ExplicitLittle,
        };
        group.element(Tag(0x0002, 0x0000), *b"UL", &(meta.out.len() as u32).to_le_bytes());
        let mut out = group.out;
        out.extend_from_slice(&meta.out);

        self.elements.sort_by_key(|(tag, _)| *tag);
        let layout = self.layout;
        let mut writer = Writer { out, layout };
        for (tag, entry) in &self.elements {
            match entry {
                Entry::Value { vr, bytes } => writer.element(*tag, *vr, bytes),
                Entry::Sequence => writer.sequence(*tag),
            }
        }

        match self.pixels {
            Pixels::None => {}
            Pixels::Native(bytes) => writer.element(tags::PIXEL_DATA, *b"OW", &bytes),
            Pixels::Encapsulated {
                offset_table,
                fragments,
            } => {
                writer.tag(tags::PIXEL_DATA);
                writer.out.extend_from_slice(b"OB\0\0");
                writer.u32(u32::MAX);
                let table: Vec<u8> = offset_table
                    .unwrap_or_default()
                    .iter()
                    .flat_map(|o| o.to_le_bytes())
                    .collect();
                writer.item(&table);
                for fragment in &fragments {
                    let mut fragment = fragment.clone();
                    if fragment.len() % 2 == 1 {
                        fragment.push(0);
                    }
                    writer.item(&fragment);
                }
                writer.tag(SEQUENCE_DELIMITATION);
                writer.u32(0);
            }
        }

        writer.out
    }
}

struct Writer {
    out: Vec<u8>,
    layout: Layout,
}

impl Writer {
    fn u16(&mut self, value: u16) {
        match self.layout {
            Layout::ExplicitBig => self.out.extend_from_slice(&value.to_be_bytes()),
            _ => self.out.extend_from_slice(&value.to_le_bytes()),
        }
    }

    fn u32(&mut self, value: u32) {
        match self.layout {
            Layout::ExplicitBig => self.out.extend_from_slice(&value.to_be_bytes()),
            _ => self.out.extend_from_slice(&value.to_le_bytes()),
        }
    }

    fn tag(&mut self, tag: Tag) {
        self.u16(tag.0);
        self.u16(tag.1);
    }

    fn element(&mut self, tag: Tag, vr: [u8; 2], value: &[u8]) {
        self.tag(tag);
        match self.layout {
            Layout::ImplicitLittle => self.u32(value.len() as u32),
            _ => {
                self.out.extend_from_slice(&vr);
                if matches!(&vr, b"OB" | b"OW" | b"SQ" | b"UN" | b"UT") {
                    self.out.extend_from_slice(&[0, 0]);
                    self.u32(value.len() as u32);
                } else {
                    self.u16(value.len() as u16);
                }
            }
        }
        self.out.extend_from_slice(value);
    }

    fn item(&mut self, value: &[u8]) {
        self.tag(ITEM);
        self.u32(value.len() as u32);
        self.out.extend_from_slice(value);
    }

    /// One defined-length item and one undefined-length item, each holding a
    /// single UI element.
    fn sequence(&mut self, tag: Tag) {
        self.tag(tag);
        if self.layout != Layout::ImplicitLittle {
            self.out.extend_from_slice(b"SQ\0\0");
        }
        self.u32(u32::MAX);

        let mut nested = Writer {
            out: Vec::new(),
            layout: self.layout,
        };
        nested.element(Tag(0x0008, 0x1150), *b"UI", b"1.2.3\0");
        let nested = nested.out;

        self.item(&nested);

        self.tag(ITEM);
        self.u32(u32::MAX);
        self.out.extend_from_slice(&nested);
        self.tag(ITEM_DELIMITATION);
        self.u32(0);

        self.tag(SEQUENCE_DELIMITATION);
        self.u32(0);
    }
}
