//! Pixel data geometry parsing.
//!
//! The [`GeometryParser`] scans a DICOM stream up to,
//! but never including, the value of the _Pixel Data_ element,
//! collecting the attributes needed to locate and decode frames
//! into a [`DicomPixelGeometry`].
//! Values of elements which are not of interest are skipped over
//! by seeking, so no pixel bytes are ever loaded during this scan.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use dicom_core::{DataElementHeader, Length, Tag, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_encoding::decode::DecodeFrom;
use dicom_encoding::transfer_syntax::{Endianness, TransferSyntaxIndex};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::attribute::{
    require_dimension, text, GetAttributeError, PhotometricInterpretation, PixelRepresentation,
    ValueReader,
};
use crate::raster::SampleType;
use crate::transform::{Rescale, VoiLutFunction};

pub(crate) const ITEM: Tag = Tag(0xFFFE, 0xE000);
pub(crate) const ITEM_DELIMITER: Tag = Tag(0xFFFE, 0xE00D);
pub(crate) const SEQUENCE_DELIMITER: Tag = Tag(0xFFFE, 0xE0DD);

const JPIP_REFERENCED_DEFLATE: &str = "1.2.840.10008.1.2.4.95";

/// Value length sentinel of encapsulated pixel data.
pub const UNDEFINED_PIXEL_DATA_LENGTH: i64 = -1;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ParseError {
    /// Could not read from the data source
    ReadSource { source: std::io::Error },

    #[snafu(display("Could not open file {}", path.display()))]
    OpenFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Could not decode element header at position {position}
    DecodeHeader {
        position: u64,
        source: dicom_encoding::decode::Error,
    },

    /// Unexpected tag {tag} inside a sequence at position {position}
    UnexpectedSequenceTag { tag: Tag, position: u64 },

    /// Data set encoded with {uid} cannot be scanned in place
    DeflatedDataSet { uid: String },

    /// No data set decoder for transfer syntax {uid}
    MissingDataSetDecoder { uid: String },

    /// Data set ended before the pixel data element
    MissingPixelData,

    /// Data set ended inside a sequence
    UnexpectedEndOfDataSet,

    /// Invalid image attribute
    InvalidAttribute { source: GetAttributeError },

    /// Byte swapped 8-bit pixel data in planar configuration is not supported
    BandedByteSwap,

    /// Value of {len} bytes at position {position} runs past the end of the stream
    ValueLength { position: u64, len: u32 },
}

pub type Result<T, E = ParseError> = std::result::Result<T, E>;

/// A lookup table as described by a LUT descriptor and LUT data pair,
/// used both for VOI LUTs and for palette color lookup tables.
#[derive(Debug, Clone, PartialEq)]
pub struct LutData {
    /// number of entries in the table
    pub entry_count: u32,
    /// the first stored value mapped by the table
    pub first_mapped: i64,
    /// number of bits of each entry
    pub bits: u16,
    /// the table entries
    pub data: Vec<u16>,
    /// the LUT explanation, if any
    pub explanation: Option<String>,
}

impl LutData {
    pub(crate) fn from_parts(
        descriptor: &[i64],
        data: &[u8],
        reader: ValueReader,
        signed: bool,
        explanation: Option<String>,
    ) -> Result<Self, GetAttributeError> {
        let [entries, first, bits] = match descriptor {
            [a, b, c, ..] => [*a, *b, *c],
            _ => {
                return Err(GetAttributeError::InvalidValue {
                    name: "LUTDescriptor",
                    value: format!("{:?}", descriptor),
                })
            }
        };
        let entry_count = if entries == 0 { 65_536 } else { entries as u32 };
        let first_mapped = if signed && first >= 0x8000 {
            first - 0x1_0000
        } else {
            first
        };
        let bits = bits.clamp(1, 16) as u16;

        let data: Vec<u16> = if bits <= 8 && data.len() < entry_count as usize * 2 {
            // one entry per byte
            data.iter().map(|&b| u16::from(b)).collect()
        } else {
            let words = reader.u16s(data);
            if bits <= 8 {
                let low_bytes_empty = words.iter().all(|w| w & 0xFF == 0);
                if low_bytes_empty {
                    words.into_iter().map(|w| w >> 8).collect()
                } else {
                    words.into_iter().map(|w| w & 0xFF).collect()
                }
            } else {
                words
            }
        };
        if data.is_empty() {
            return Err(GetAttributeError::InvalidValue {
                name: "LUTData",
                value: String::new(),
            });
        }

        Ok(LutData {
            entry_count,
            first_mapped,
            bits,
            data,
            explanation,
        })
    }

    /// Map a stored value through the table,
    /// clamping values outside of the table's input range.
    pub fn lookup(&self, value: i64) -> u16 {
        let last = self.data.len() as i64 - 1;
        let index = (value - self.first_mapped).clamp(0, last);
        self.data[index as usize]
    }

    /// The largest value an entry can hold.
    pub fn max_output(&self) -> u16 {
        ((1_u32 << self.bits) - 1) as u16
    }
}

/// The palette color lookup tables of a _PALETTE COLOR_ image.
#[derive(Debug, Clone, PartialEq)]
pub struct PaletteTables {
    pub red: LutData,
    pub green: LutData,
    pub blue: LutData,
}

/// Value of interest attributes found at one level of the data set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiAttributes {
    /// Window Center values
    pub centers: Vec<f64>,
    /// Window Width values
    pub widths: Vec<f64>,
    /// Window Center & Width Explanation values
    pub explanations: Vec<String>,
    /// the VOI LUT Function, if given
    pub function: Option<VoiLutFunction>,
    /// items of the VOI LUT Sequence
    pub luts: Vec<LutData>,
    /// modality rescale given at this level
    pub rescale: Option<Rescale>,
}

impl VoiAttributes {
    /// The first explicit window, if both center and width are present.
    pub fn first_window(&self) -> Option<(f64, f64)> {
        Some((*self.centers.first()?, *self.widths.first()?))
    }
}

/// VOI attributes for the data set and its functional groups.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowAttributes {
    /// attributes at the top level of the data set
    pub dataset: VoiAttributes,
    /// attributes in the shared functional groups
    pub shared: Option<VoiAttributes>,
    /// attributes in each item of the per-frame functional groups
    pub per_frame: Vec<Option<VoiAttributes>>,
}

impl WindowAttributes {
    /// Iterate over the VOI attribute levels applicable to the given frame,
    /// most specific first.
    pub fn levels_for_frame(&self, frame: u32) -> impl Iterator<Item = &VoiAttributes> {
        self.per_frame
            .get(frame as usize)
            .and_then(Option::as_ref)
            .into_iter()
            .chain(self.shared.as_ref())
            .chain(std::iter::once(&self.dataset))
    }
}

/// Geometry and encoding of the pixel data in a DICOM stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DicomPixelGeometry {
    /// Columns
    pub width: u32,
    /// Rows
    pub height: u32,
    /// Number of Frames, at least 1
    pub frame_count: u32,
    pub bits_allocated: u16,
    pub bits_stored: u16,
    pub high_bit: u16,
    pub samples_per_pixel: u16,
    /// whether color planes are stored separately (Planar Configuration = 1)
    pub planar_configuration: bool,
    pub photometric_interpretation: PhotometricInterpretation,
    pub pixel_representation: PixelRepresentation,
    pub transfer_syntax_uid: String,
    /// whether the data set is encoded in big endian
    pub big_endian: bool,
    /// position of the first byte of the pixel data value
    pub pixel_data_offset: u64,
    /// length of the pixel data value,
    /// [`UNDEFINED_PIXEL_DATA_LENGTH`] if encapsulated
    pub pixel_data_length: i64,
    pub pixel_data_vr: VR,
    /// whether 8-bit samples need their bytes swapped in pairs
    pub swap_byte_order: bool,
    pub rescale: Rescale,
    pub window: WindowAttributes,
    pub palette: Option<PaletteTables>,
    pub pixel_padding_value: Option<i64>,
}

impl Default for DicomPixelGeometry {
    fn default() -> Self {
        DicomPixelGeometry {
            width: 0,
            height: 0,
            frame_count: 1,
            bits_allocated: 8,
            bits_stored: 8,
            high_bit: 7,
            samples_per_pixel: 1,
            planar_configuration: false,
            photometric_interpretation: PhotometricInterpretation::Monochrome2,
            pixel_representation: PixelRepresentation::Unsigned,
            transfer_syntax_uid: uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            big_endian: false,
            pixel_data_offset: 0,
            pixel_data_length: 0,
            pixel_data_vr: VR::OW,
            swap_byte_order: false,
            rescale: Rescale::new(1., 0.),
            window: WindowAttributes::default(),
            palette: None,
            pixel_padding_value: None,
        }
    }
}

impl DicomPixelGeometry {
    /// Whether the pixel data is encapsulated,
    /// so that frame boundaries must be discovered from the fragments.
    pub fn is_encapsulated(&self) -> bool {
        self.pixel_data_length == UNDEFINED_PIXEL_DATA_LENGTH
    }

    /// The number of bytes used by each sample.
    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_allocated as usize + 7) / 8
    }

    /// The length of one frame in native encoding.
    pub fn frame_len(&self) -> u64 {
        self.width as u64
            * self.height as u64
            * self.samples_per_pixel as u64
            * self.bytes_per_sample() as u64
    }

    pub fn is_signed(&self) -> bool {
        self.pixel_representation == PixelRepresentation::Signed
    }

    /// The sample type of rasters decoded from the native encoding.
    pub fn native_sample_type(&self) -> SampleType {
        match (self.bytes_per_sample(), self.pixel_representation) {
            (1, _) => SampleType::U8,
            (2, PixelRepresentation::Unsigned) => SampleType::U16,
            (2, PixelRepresentation::Signed) => SampleType::I16,
            _ => SampleType::I32,
        }
    }
}

/// Reads the geometry of the pixel data from a DICOM stream.
#[derive(Debug, Clone)]
pub struct GeometryParser {
    fallback_transfer_syntax: String,
}

impl Default for GeometryParser {
    fn default() -> Self {
        GeometryParser {
            fallback_transfer_syntax: uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
        }
    }
}

impl GeometryParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transfer syntax assumed for streams
    /// which have no file meta group.
    pub fn fallback_transfer_syntax(mut self, uid: impl Into<String>) -> Self {
        self.fallback_transfer_syntax = uid.into();
        self
    }

    /// Parse the geometry of a DICOM file.
    pub fn parse_file(&self, path: impl AsRef<Path>) -> Result<DicomPixelGeometry> {
        let path = path.as_ref();
        let file = File::open(path).context(OpenFileSnafu { path })?;
        self.parse(&mut BufReader::new(file))
    }

    /// Parse the geometry from a stream.
    ///
    /// On success, the stream is left at the start of the pixel data value.
    pub fn parse<R>(&self, source: &mut R) -> Result<DicomPixelGeometry>
    where
        R: Read + Seek,
    {
        let stream_len = source.seek(SeekFrom::End(0)).context(ReadSourceSnafu)?;
        source.seek(SeekFrom::Start(0)).context(ReadSourceSnafu)?;

        let meta_start = detect_preamble(source)?;
        let ts_uid = match meta_start {
            Some(start) => {
                source.seek(SeekFrom::Start(start)).context(ReadSourceSnafu)?;
                read_meta_transfer_syntax(source, stream_len)?
            }
            None => {
                source.seek(SeekFrom::Start(0)).context(ReadSourceSnafu)?;
                None
            }
        };
        let ts_uid = ts_uid.unwrap_or_else(|| {
            debug!(
                "No transfer syntax in file meta group, assuming {}",
                self.fallback_transfer_syntax
            );
            self.fallback_transfer_syntax.clone()
        });

        if ts_uid == uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN
            || ts_uid == JPIP_REFERENCED_DEFLATE
        {
            return DeflatedDataSetSnafu { uid: ts_uid }.fail();
        }

        let ts = match TransferSyntaxRegistry.get(&ts_uid) {
            Some(ts) => ts,
            None => {
                warn!(
                    "Unknown transfer syntax {}, reading data set as explicit VR little endian",
                    ts_uid
                );
                TransferSyntaxRegistry
                    .get(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                    .context(MissingDataSetDecoderSnafu { uid: ts_uid.clone() })?
            }
        };
        let decoder = ts
            .decoder_for::<R>()
            .context(MissingDataSetDecoderSnafu { uid: ts_uid.clone() })?;
        let big_endian = ts.endianness() == Endianness::Big;
        debug!("Scanning data set with {} ({})", ts.name(), ts_uid);

        let mut scanner = Scanner {
            source,
            decoder,
            reader: ValueReader::new(big_endian),
            stream_len,
            captured: Captured::default(),
        };
        match scanner.walk(None, Scope::Root)? {
            Walk::PixelData => {}
            Walk::End | Walk::EndOfStream => return MissingPixelDataSnafu.fail(),
        }

        scanner.captured.into_geometry(ts_uid, big_endian, scanner.reader)
    }
}

/// Locate the start of the file meta group:
/// after the 128-byte preamble and `DICM`, right after `DICM`,
/// or nowhere for a bare data set.
fn detect_preamble<R: Read>(source: &mut R) -> Result<Option<u64>> {
    let mut head = Vec::with_capacity(132);
    source
        .by_ref()
        .take(132)
        .read_to_end(&mut head)
        .context(ReadSourceSnafu)?;
    if head.len() >= 132 && &head[128..132] == b"DICM" {
        Ok(Some(132))
    } else if head.len() >= 4 && &head[0..4] == b"DICM" {
        Ok(Some(4))
    } else {
        Ok(None)
    }
}

/// Read the file meta group, which is always explicit VR little endian,
/// returning the transfer syntax UID if present.
fn read_meta_transfer_syntax<R>(source: &mut R, stream_len: u64) -> Result<Option<String>>
where
    R: Read + Seek,
{
    let decoder = TransferSyntaxRegistry
        .get(uids::EXPLICIT_VR_LITTLE_ENDIAN)
        .and_then(|ts| ts.decoder_for::<R>())
        .context(MissingDataSetDecoderSnafu {
            uid: uids::EXPLICIT_VR_LITTLE_ENDIAN,
        })?;

    let mut ts_uid = None;
    loop {
        let position = source.stream_position().context(ReadSourceSnafu)?;
        if position + 2 > stream_len {
            break;
        }
        let mut group = [0; 2];
        source.read_exact(&mut group).context(ReadSourceSnafu)?;
        source
            .seek(SeekFrom::Start(position))
            .context(ReadSourceSnafu)?;
        if LittleEndian::read_u16(&group) != 0x0002 {
            break;
        }

        let (header, _) = decoder
            .decode_header(source)
            .context(DecodeHeaderSnafu { position })?;
        let len = header.len.get().unwrap_or(0);
        if header.tag == tags::TRANSFER_SYNTAX_UID {
            let value = read_bytes(source, len, stream_len)?;
            ts_uid = Some(text(&value));
        } else {
            source
                .seek(SeekFrom::Current(i64::from(len)))
                .context(ReadSourceSnafu)?;
        }
    }
    Ok(ts_uid)
}

/// Read a value of `len` bytes,
/// which must end within the first `stream_len` bytes of the stream.
fn read_bytes<R: Read + Seek>(source: &mut R, len: u32, stream_len: u64) -> Result<Vec<u8>> {
    let position = source.stream_position().context(ReadSourceSnafu)?;
    ensure!(
        position + u64::from(len) <= stream_len,
        ValueLengthSnafu { position, len }
    );
    let mut value = vec![0; len as usize];
    source.read_exact(&mut value).context(ReadSourceSnafu)?;
    Ok(value)
}

/// Where VOI attributes found in a nested item are collected to.
#[derive(Debug, Copy, Clone, PartialEq)]
enum Target {
    DataSet,
    Shared,
    PerFrame(usize),
}

/// What the elements being walked belong to.
#[derive(Debug, Copy, Clone, PartialEq)]
enum Scope {
    Root,
    FunctionalGroup(Target),
    FrameVoi(Target),
    PixelValueTransform(Target),
    VoiLut(Target),
    Skip,
}

impl Scope {
    /// The scope of item number `index` in a sequence
    /// whose items are walked in this scope.
    fn for_item(self, index: usize) -> Self {
        match self {
            Scope::FunctionalGroup(Target::PerFrame(_)) => {
                Scope::FunctionalGroup(Target::PerFrame(index))
            }
            other => other,
        }
    }
}

/// The scope of the items of sequence `tag` found in `scope`.
fn nested_scope(scope: Scope, tag: Tag) -> Scope {
    match (scope, tag) {
        (Scope::Root, tags::VOILUT_SEQUENCE) => Scope::VoiLut(Target::DataSet),
        (Scope::Root, tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE) => {
            Scope::FunctionalGroup(Target::Shared)
        }
        (Scope::Root, tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE) => {
            Scope::FunctionalGroup(Target::PerFrame(0))
        }
        (Scope::FunctionalGroup(t), tags::FRAME_VOILUT_SEQUENCE) => Scope::FrameVoi(t),
        (Scope::FunctionalGroup(t), tags::PIXEL_VALUE_TRANSFORMATION_SEQUENCE) => {
            Scope::PixelValueTransform(t)
        }
        (Scope::FrameVoi(t), tags::VOILUT_SEQUENCE) => Scope::VoiLut(t),
        _ => Scope::Skip,
    }
}

/// Why walking a list of elements ended.
#[derive(Debug, Copy, Clone, PartialEq)]
enum Walk {
    /// the pixel data header was read at the root level
    PixelData,
    /// the end of the item or sequence was reached
    End,
    /// no more bytes left in the stream
    EndOfStream,
}

#[derive(Debug, Default)]
struct PendingLut {
    descriptor: Option<Vec<i64>>,
    data: Option<Vec<u8>>,
    explanation: Option<String>,
}

#[derive(Debug, Default)]
struct Captured {
    rows: Option<u32>,
    columns: Option<u32>,
    frames: Option<i64>,
    bits_allocated: Option<u16>,
    bits_stored: Option<u16>,
    high_bit: Option<u16>,
    pixel_representation: Option<i64>,
    samples_per_pixel: Option<u16>,
    planar_configuration: Option<i64>,
    photometric_interpretation: Option<String>,
    rescale_slope: Option<f64>,
    rescale_intercept: Option<f64>,
    window: WindowAttributes,
    palette_descriptors: [Option<Vec<i64>>; 3],
    palette_data: [Option<Vec<u8>>; 3],
    pixel_padding_value: Option<i64>,
    pixel_data: Option<(u64, Length, VR)>,
    pending_lut: PendingLut,
}

impl Captured {
    fn signed(&self) -> bool {
        self.pixel_representation == Some(1)
    }

    fn voi_mut(&mut self, target: Target) -> &mut VoiAttributes {
        match target {
            Target::DataSet => &mut self.window.dataset,
            Target::Shared => self.window.shared.get_or_insert_with(Default::default),
            Target::PerFrame(i) => {
                if self.window.per_frame.len() <= i {
                    self.window.per_frame.resize(i + 1, None);
                }
                self.window.per_frame[i].get_or_insert_with(Default::default)
            }
        }
    }

    fn into_geometry(
        self,
        transfer_syntax_uid: String,
        big_endian: bool,
        reader: ValueReader,
    ) -> Result<DicomPixelGeometry> {
        let width = require_dimension(self.columns, "Columns").context(InvalidAttributeSnafu)?;
        let height = require_dimension(self.rows, "Rows").context(InvalidAttributeSnafu)?;
        let (pixel_data_offset, pixel_data_len, pixel_data_vr) =
            self.pixel_data.context(MissingPixelDataSnafu)?;

        let frame_count = match self.frames {
            Some(n) if n > 0 => n as u32,
            _ => 1,
        };
        let bits_allocated = self.bits_allocated.unwrap_or(8);
        let bits_stored = self.bits_stored.unwrap_or(bits_allocated);
        let high_bit = self.high_bit.unwrap_or(bits_stored.saturating_sub(1));
        let pixel_representation =
            PixelRepresentation::from_value(self.pixel_representation.unwrap_or(0))
                .context(InvalidAttributeSnafu)?;
        let samples_per_pixel = self.samples_per_pixel.unwrap_or(1);
        let planar_configuration = self.planar_configuration.unwrap_or(0) != 0;
        let photometric_interpretation = self
            .photometric_interpretation
            .as_deref()
            .map(PhotometricInterpretation::parse)
            .unwrap_or_default();

        let pixel_data_length = pixel_data_len
            .get()
            .map(i64::from)
            .unwrap_or(UNDEFINED_PIXEL_DATA_LENGTH);

        let swap_byte_order = big_endian && pixel_data_vr == VR::OW && bits_allocated <= 8;
        if swap_byte_order && planar_configuration {
            return BandedByteSwapSnafu.fail();
        }

        let signed = pixel_representation == PixelRepresentation::Signed;
        let palette = match (self.palette_descriptors, self.palette_data) {
            ([Some(rd), Some(gd), Some(bd)], [Some(r), Some(g), Some(b)]) => {
                let table = |descriptor: &[i64], data: &[u8]| {
                    LutData::from_parts(descriptor, data, reader, false, None)
                };
                Some(PaletteTables {
                    red: table(&rd[..], &r[..]).context(InvalidAttributeSnafu)?,
                    green: table(&gd[..], &g[..]).context(InvalidAttributeSnafu)?,
                    blue: table(&bd[..], &b[..]).context(InvalidAttributeSnafu)?,
                })
            }
            _ => None,
        };

        let pixel_padding_value = self.pixel_padding_value.map(|v| {
            if signed && bits_allocated == 16 && v >= 0x8000 {
                v - 0x1_0000
            } else {
                v
            }
        });

        let geometry = DicomPixelGeometry {
            width,
            height,
            frame_count,
            bits_allocated,
            bits_stored,
            high_bit,
            samples_per_pixel,
            planar_configuration,
            photometric_interpretation,
            pixel_representation,
            transfer_syntax_uid,
            big_endian,
            pixel_data_offset,
            pixel_data_length,
            pixel_data_vr,
            swap_byte_order,
            rescale: Rescale::new(
                self.rescale_slope.unwrap_or(1.),
                self.rescale_intercept.unwrap_or(0.),
            ),
            window: self.window,
            palette,
            pixel_padding_value,
        };
        debug!(
            "Pixel data: {}x{}x{} frames, {} bits allocated, {} at offset {} ({} bytes)",
            geometry.width,
            geometry.height,
            geometry.frame_count,
            geometry.bits_allocated,
            geometry.photometric_interpretation,
            geometry.pixel_data_offset,
            geometry.pixel_data_length,
        );
        Ok(geometry)
    }
}

struct Scanner<'s, R: Read + Seek> {
    source: &'s mut R,
    decoder: Box<dyn DecodeFrom<R>>,
    reader: ValueReader,
    stream_len: u64,
    captured: Captured,
}

impl<R> Scanner<'_, R>
where
    R: Read + Seek,
{
    fn position(&mut self) -> Result<u64> {
        self.source.stream_position().context(ReadSourceSnafu)
    }

    fn skip(&mut self, len: u32) -> Result<()> {
        self.source
            .seek(SeekFrom::Current(i64::from(len)))
            .context(ReadSourceSnafu)?;
        Ok(())
    }

    fn value(&mut self, header: &DataElementHeader) -> Result<Vec<u8>> {
        read_bytes(self.source, header.len.get().unwrap_or(0), self.stream_len)
    }

    fn int(&mut self, header: &DataElementHeader, name: &'static str) -> Result<i64> {
        let value = self.value(header)?;
        self.reader
            .int(header.vr, &value, name)
            .context(InvalidAttributeSnafu)
    }

    fn ints(&mut self, header: &DataElementHeader, name: &'static str) -> Result<Vec<i64>> {
        let value = self.value(header)?;
        self.reader
            .ints(header.vr, &value, name)
            .context(InvalidAttributeSnafu)
    }

    fn floats(&mut self, header: &DataElementHeader, name: &'static str) -> Result<Vec<f64>> {
        let value = self.value(header)?;
        self.reader
            .floats(header.vr, &value, name)
            .context(InvalidAttributeSnafu)
    }

    fn text(&mut self, header: &DataElementHeader) -> Result<String> {
        Ok(text(&self.value(header)?))
    }

    /// Walk the elements of a data set or item
    /// until `end`, an item delimiter, or the pixel data element.
    fn walk(&mut self, end: Option<u64>, scope: Scope) -> Result<Walk> {
        loop {
            let position = self.position()?;
            match end {
                Some(end) if position >= end => return Ok(Walk::End),
                None if position >= self.stream_len => return Ok(Walk::EndOfStream),
                _ => {}
            }

            let (header, _) = self
                .decoder
                .decode_header(self.source)
                .context(DecodeHeaderSnafu { position })?;

            if header.tag == ITEM_DELIMITER || header.tag == SEQUENCE_DELIMITER {
                return Ok(Walk::End);
            }

            if scope == Scope::Root && header.tag == tags::PIXEL_DATA {
                let offset = self.position()?;
                self.captured.pixel_data = Some((offset, header.len, header.vr));
                return Ok(Walk::PixelData);
            }

            self.element(header, scope)?;
        }
    }

    /// Handle one element header in the given scope,
    /// leaving the source at the start of the next element.
    fn element(&mut self, header: DataElementHeader, scope: Scope) -> Result<()> {
        let tag = header.tag;

        if header.len.is_undefined() {
            // sequences and nested encapsulated data,
            // whose items are delimited rather than counted
            return self.sequence(None, nested_scope(scope, tag));
        }

        let len = header.len.get().unwrap_or(0);
        if header.vr == VR::SQ {
            let item_scope = nested_scope(scope, tag);
            if item_scope == Scope::Skip {
                return self.skip(len);
            }
            let start = self.position()?;
            return self.sequence(Some(start + u64::from(len)), item_scope);
        }

        match scope {
            Scope::Root => match tag {
                tags::ROWS => self.captured.rows = Some(self.int(&header, "Rows")? as u32),
                tags::COLUMNS => {
                    self.captured.columns = Some(self.int(&header, "Columns")? as u32)
                }
                tags::NUMBER_OF_FRAMES => {
                    self.captured.frames = Some(self.int(&header, "NumberOfFrames")?)
                }
                tags::BITS_ALLOCATED => {
                    self.captured.bits_allocated = Some(self.int(&header, "BitsAllocated")? as u16)
                }
                tags::BITS_STORED => {
                    self.captured.bits_stored = Some(self.int(&header, "BitsStored")? as u16)
                }
                tags::HIGH_BIT => self.captured.high_bit = Some(self.int(&header, "HighBit")? as u16),
                tags::PIXEL_REPRESENTATION => {
                    self.captured.pixel_representation =
                        Some(self.int(&header, "PixelRepresentation")?)
                }
                tags::SAMPLES_PER_PIXEL => {
                    self.captured.samples_per_pixel =
                        Some(self.int(&header, "SamplesPerPixel")? as u16)
                }
                tags::PLANAR_CONFIGURATION => {
                    self.captured.planar_configuration =
                        Some(self.int(&header, "PlanarConfiguration")?)
                }
                tags::PHOTOMETRIC_INTERPRETATION => {
                    self.captured.photometric_interpretation = Some(self.text(&header)?)
                }
                tags::RESCALE_SLOPE => {
                    self.captured.rescale_slope =
                        self.floats(&header, "RescaleSlope")?.first().copied()
                }
                tags::RESCALE_INTERCEPT => {
                    self.captured.rescale_intercept =
                        self.floats(&header, "RescaleIntercept")?.first().copied()
                }
                tags::PIXEL_PADDING_VALUE => {
                    self.captured.pixel_padding_value =
                        Some(self.int(&header, "PixelPaddingValue")?)
                }
                tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR => {
                    self.captured.palette_descriptors[0] =
                        Some(self.ints(&header, "RedPaletteColorLookupTableDescriptor")?)
                }
                tags::GREEN_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR => {
                    self.captured.palette_descriptors[1] =
                        Some(self.ints(&header, "GreenPaletteColorLookupTableDescriptor")?)
                }
                tags::BLUE_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR => {
                    self.captured.palette_descriptors[2] =
                        Some(self.ints(&header, "BluePaletteColorLookupTableDescriptor")?)
                }
                tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DATA => {
                    self.captured.palette_data[0] = Some(self.value(&header)?)
                }
                tags::GREEN_PALETTE_COLOR_LOOKUP_TABLE_DATA => {
                    self.captured.palette_data[1] = Some(self.value(&header)?)
                }
                tags::BLUE_PALETTE_COLOR_LOOKUP_TABLE_DATA => {
                    self.captured.palette_data[2] = Some(self.value(&header)?)
                }
                _ => self.voi_element(&header, Target::DataSet)?,
            },
            Scope::FrameVoi(target) => self.voi_element(&header, target)?,
            Scope::PixelValueTransform(target) => match tag {
                tags::RESCALE_SLOPE | tags::RESCALE_INTERCEPT => {
                    let value = self.floats(&header, "Rescale")?.first().copied();
                    let voi = self.captured.voi_mut(target);
                    let rescale = voi.rescale.get_or_insert(Rescale::new(1., 0.));
                    if let Some(value) = value {
                        if tag == tags::RESCALE_SLOPE {
                            rescale.slope = value;
                        } else {
                            rescale.intercept = value;
                        }
                    }
                }
                _ => self.skip(len)?,
            },
            Scope::VoiLut(_) => match tag {
                tags::LUT_DESCRIPTOR => {
                    let descriptor = self.ints(&header, "LUTDescriptor")?;
                    self.captured.pending_lut.descriptor = Some(descriptor);
                }
                tags::LUT_DATA => {
                    let data = self.value(&header)?;
                    self.captured.pending_lut.data = Some(data);
                }
                tags::LUT_EXPLANATION => {
                    let explanation = self.text(&header)?;
                    self.captured.pending_lut.explanation = Some(explanation);
                }
                _ => self.skip(len)?,
            },
            Scope::FunctionalGroup(_) | Scope::Skip => self.skip(len)?,
        }
        Ok(())
    }

    /// Capture window attributes into the given target,
    /// skipping any other element.
    fn voi_element(&mut self, header: &DataElementHeader, target: Target) -> Result<()> {
        match header.tag {
            tags::WINDOW_CENTER => {
                let values = self.floats(header, "WindowCenter")?;
                self.captured.voi_mut(target).centers = values;
            }
            tags::WINDOW_WIDTH => {
                let values = self.floats(header, "WindowWidth")?;
                self.captured.voi_mut(target).widths = values;
            }
            tags::WINDOW_CENTER_WIDTH_EXPLANATION => {
                let explanations = self
                    .text(header)?
                    .split('\\')
                    .map(|s| s.trim().to_string())
                    .collect();
                self.captured.voi_mut(target).explanations = explanations;
            }
            tags::VOILUT_FUNCTION => {
                let name = self.text(header)?;
                let function = match VoiLutFunction::try_from(name.as_str()) {
                    Ok(function) => Some(function),
                    Err(_) => {
                        warn!("Unrecognized VOI LUT function `{}`, using LINEAR", name);
                        None
                    }
                };
                self.captured.voi_mut(target).function = function;
            }
            _ => self.skip(header.len.get().unwrap_or(0))?,
        }
        Ok(())
    }

    /// Walk the items of a sequence, or of nested encapsulated data,
    /// until `end` or the sequence delimiter.
    fn sequence(&mut self, end: Option<u64>, scope: Scope) -> Result<()> {
        let mut index = 0;
        loop {
            let position = self.position()?;
            match end {
                Some(end) if position >= end => return Ok(()),
                None if position >= self.stream_len => {
                    return UnexpectedEndOfDataSetSnafu.fail()
                }
                _ => {}
            }

            let (header, _) = self
                .decoder
                .decode_header(self.source)
                .context(DecodeHeaderSnafu { position })?;
            match header.tag {
                SEQUENCE_DELIMITER => return Ok(()),
                ITEM => {
                    let item_scope = scope.for_item(index);
                    index += 1;
                    match header.len.get() {
                        Some(len) if item_scope == Scope::Skip => self.skip(len)?,
                        Some(len) => {
                            let item_end = self.position()? + u64::from(len);
                            self.item(Some(item_end), item_scope)?;
                        }
                        None => self.item(None, item_scope)?,
                    }
                }
                tag => return UnexpectedSequenceTagSnafu { tag, position }.fail(),
            }
        }
    }

    fn item(&mut self, end: Option<u64>, scope: Scope) -> Result<()> {
        if let Scope::VoiLut(_) = scope {
            self.captured.pending_lut = PendingLut::default();
        }
        if let Scope::FrameVoi(target) | Scope::FunctionalGroup(target) = scope {
            // register the item even if it holds no window attributes
            if let Target::PerFrame(_) | Target::Shared = target {
                let _ = self.captured.voi_mut(target);
            }
        }

        match self.walk(end, scope)? {
            Walk::End => {}
            Walk::EndOfStream => return UnexpectedEndOfDataSetSnafu.fail(),
            // pixel data is only recognized at the root level
            Walk::PixelData => {}
        }

        if let Scope::VoiLut(target) = scope {
            let pending = std::mem::take(&mut self.captured.pending_lut);
            if let (Some(descriptor), Some(data)) = (pending.descriptor, pending.data) {
                let signed = self.captured.signed();
                let lut = LutData::from_parts(
                    &descriptor,
                    &data,
                    self.reader,
                    signed,
                    pending.explanation,
                )
                .context(InvalidAttributeSnafu)?;
                self.captured.voi_mut(target).luts.push(lut);
            } else {
                warn!("Ignoring VOI LUT item without descriptor or data");
            }
        }
        Ok(())
    }
}
