//! Synthetic DICOM file builder for integration tests.
#![allow(dead_code)]

use std::io::Write;

use dicom_core::Tag;
use dicom_dictionary_std::{tags, uids};
use dicom_pixelcore::encapsulation::encapsulate;
use tempfile::NamedTempFile;

/// The encoding of the main data set.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Encoding {
    ExplicitLittle,
    ImplicitLittle,
    ExplicitBig,
}

impl Encoding {
    pub fn transfer_syntax(self) -> &'static str {
        match self {
            Encoding::ExplicitLittle => uids::EXPLICIT_VR_LITTLE_ENDIAN,
            Encoding::ImplicitLittle => uids::IMPLICIT_VR_LITTLE_ENDIAN,
            Encoding::ExplicitBig => "1.2.840.10008.1.2.2",
        }
    }

    fn u16_bytes(self, v: u16) -> [u8; 2] {
        match self {
            Encoding::ExplicitBig => v.to_be_bytes(),
            _ => v.to_le_bytes(),
        }
    }

    fn u32_bytes(self, v: u32) -> [u8; 4] {
        match self {
            Encoding::ExplicitBig => v.to_be_bytes(),
            _ => v.to_le_bytes(),
        }
    }
}

/// A data set under construction.
#[derive(Debug, Clone)]
pub struct DataSet {
    pub encoding: Encoding,
    pub bytes: Vec<u8>,
}

impl DataSet {
    pub fn new(encoding: Encoding) -> Self {
        DataSet {
            encoding,
            bytes: Vec::new(),
        }
    }

    fn header(&mut self, tag: Tag, vr: &[u8; 2], len: u32) {
        let e = self.encoding;
        self.bytes.extend_from_slice(&e.u16_bytes(tag.0));
        self.bytes.extend_from_slice(&e.u16_bytes(tag.1));
        match e {
            Encoding::ImplicitLittle => self.bytes.extend_from_slice(&e.u32_bytes(len)),
            _ => {
                self.bytes.extend_from_slice(vr);
                match vr {
                    b"OB" | b"OW" | b"SQ" | b"UN" => {
                        self.bytes.extend_from_slice(&[0, 0]);
                        self.bytes.extend_from_slice(&e.u32_bytes(len));
                    }
                    _ => self.bytes.extend_from_slice(&e.u16_bytes(len as u16)),
                }
            }
        }
    }

    /// Add an element with the value given as raw bytes.
    pub fn put(&mut self, tag: Tag, vr: &[u8; 2], value: &[u8]) -> &mut Self {
        let mut value = value.to_vec();
        if value.len() % 2 == 1 {
            value.push(if vr == b"UI" || vr == b"OB" { 0 } else { b' ' });
        }
        self.header(tag, vr, value.len() as u32);
        self.bytes.extend_from_slice(&value);
        self
    }

    /// Add a US element.
    pub fn put_us(&mut self, tag: Tag, values: &[u16]) -> &mut Self {
        let e = self.encoding;
        let value: Vec<u8> = values.iter().flat_map(|&v| e.u16_bytes(v)).collect();
        self.put(tag, b"US", &value)
    }

    /// Add a text element.
    pub fn put_str(&mut self, tag: Tag, vr: &[u8; 2], value: &str) -> &mut Self {
        self.put(tag, vr, value.as_bytes())
    }

    /// Add an OW element from 16-bit words.
    pub fn put_words(&mut self, tag: Tag, words: &[u16]) -> &mut Self {
        let e = self.encoding;
        let value: Vec<u8> = words.iter().flat_map(|&v| e.u16_bytes(v)).collect();
        self.put(tag, b"OW", &value)
    }

    /// Add the image pixel module attributes.
    pub fn image(&mut self, image: &Image) -> &mut Self {
        self.put_us(tags::SAMPLES_PER_PIXEL, &[image.samples_per_pixel]);
        self.put_str(tags::PHOTOMETRIC_INTERPRETATION, b"CS", image.photometric);
        if image.samples_per_pixel > 1 {
            self.put_us(tags::PLANAR_CONFIGURATION, &[image.planar as u16]);
        }
        if image.frames > 1 {
            self.put_str(tags::NUMBER_OF_FRAMES, b"IS", &image.frames.to_string());
        }
        self.put_us(tags::ROWS, &[image.rows]);
        self.put_us(tags::COLUMNS, &[image.columns]);
        self.put_us(tags::BITS_ALLOCATED, &[image.bits_allocated]);
        self.put_us(tags::BITS_STORED, &[image.bits_stored]);
        self.put_us(tags::HIGH_BIT, &[image.high_bit]);
        self.put_us(tags::PIXEL_REPRESENTATION, &[image.signed as u16]);
        self
    }

    /// Add native pixel data given as raw value bytes.
    pub fn native_pixel_data(&mut self, vr: &[u8; 2], value: &[u8]) -> &mut Self {
        self.header(tags::PIXEL_DATA, vr, value.len() as u32);
        self.bytes.extend_from_slice(value);
        self
    }

    /// Add encapsulated pixel data.
    pub fn encapsulated_pixel_data(
        &mut self,
        frames: &[Vec<u8>],
        fragment_size: u32,
        offset_table: bool,
    ) -> &mut Self {
        self.header(tags::PIXEL_DATA, b"OB", 0xFFFF_FFFF);
        self.bytes
            .extend_from_slice(&encapsulate(frames, fragment_size, offset_table));
        self
    }
}

/// Image pixel module attributes.
#[derive(Debug, Clone)]
pub struct Image {
    pub rows: u16,
    pub columns: u16,
    pub frames: u32,
    pub samples_per_pixel: u16,
    pub photometric: &'static str,
    pub planar: bool,
    pub bits_allocated: u16,
    pub bits_stored: u16,
    pub high_bit: u16,
    pub signed: bool,
}

impl Image {
    pub fn monochrome(rows: u16, columns: u16, bits_allocated: u16) -> Self {
        Image {
            rows,
            columns,
            frames: 1,
            samples_per_pixel: 1,
            photometric: "MONOCHROME2",
            planar: false,
            bits_allocated,
            bits_stored: bits_allocated,
            high_bit: bits_allocated - 1,
            signed: false,
        }
    }

    pub fn frames(mut self, frames: u32) -> Self {
        self.frames = frames;
        self
    }
}

/// Serialize a DICOM file with preamble and file meta group.
pub fn dicom_file(transfer_syntax: &str, data_set: &DataSet) -> Vec<u8> {
    let mut meta = DataSet::new(Encoding::ExplicitLittle);
    meta.put(tags::MEDIA_STORAGE_SOP_CLASS_UID, b"UI", b"1.2.840.10008.5.1.4.1.1.7");
    meta.put(tags::TRANSFER_SYNTAX_UID, b"UI", transfer_syntax.as_bytes());

    let mut out = vec![0; 128];
    out.extend_from_slice(b"DICM");
    let mut group_length = DataSet::new(Encoding::ExplicitLittle);
    group_length.put(
        tags::FILE_META_INFORMATION_GROUP_LENGTH,
        b"UL",
        &(meta.bytes.len() as u32).to_le_bytes(),
    );
    out.extend_from_slice(&group_length.bytes);
    out.extend_from_slice(&meta.bytes);
    out.extend_from_slice(&data_set.bytes);
    out
}

/// Write the bytes to a temporary file.
pub fn temp_file(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

/// The position of the pixel data value in a file
/// whose data set ends with native pixel data of `len` bytes.
pub fn native_pixel_data_offset(file: &[u8], len: usize) -> u64 {
    (file.len() - len) as u64
}
