//! Frame location in native and encapsulated pixel data.
//!
//! Native frames are found by arithmetic.
//! Encapsulated frames are found by walking the fragment items
//! of the pixel data sequence the first time they are needed,
//! building up a fragment table which is reused for later lookups
//! on the same stream.

use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian};
use dicom_core::Tag;
use dicom_dictionary_std::uids;
use snafu::{ensure, ResultExt, Snafu};
use tracing::{debug, trace, warn};

use crate::geometry::{DicomPixelGeometry, ITEM, SEQUENCE_DELIMITER};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum LocateError {
    /// Frame #{index} requested, but there are only {count} frames
    FrameIndex { index: u32, count: u32 },

    /// Could not detect the first fragment of frame #{index}
    MissingFrameStart { index: u32 },

    /// Frame #{index} needs {expected} bytes, but the stream ended
    Truncated { index: u32, expected: u64 },

    /// Could not read pixel data
    ReadPixelData { source: std::io::Error },
}

pub type Result<T, E = LocateError> = std::result::Result<T, E>;

/// A fragment of encapsulated pixel data.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// position of the first byte of the fragment value
    pub position: u64,
    /// length of the fragment value
    pub length: u32,
}

impl Fragment {
    fn range(&self) -> Range<u64> {
        self.position..self.position + u64::from(self.length)
    }
}

/// The byte ranges which make up one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// the frame index
    pub index: u32,
    /// one range for native data, one per fragment for encapsulated data
    pub ranges: Vec<Range<u64>>,
}

impl FrameDescriptor {
    /// The total number of bytes in the frame.
    pub fn len(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How the first fragment of each frame is recognized.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FrameStarts {
    /// every fragment is a frame
    EveryFragment,
    /// fragments beginning with a JPEG SOI or JPEG 2000 SOC marker
    Markers,
    /// only the basic offset table tells
    OffsetTable,
}

impl FrameStarts {
    fn for_transfer_syntax(uid: &str) -> Self {
        if uid == uids::RLE_LOSSLESS {
            return FrameStarts::EveryFragment;
        }
        match jpeg_family_number(uid) {
            // JPEG, JPEG-LS, JPEG 2000, High-Throughput JPEG 2000
            Some(50..=70) | Some(80..=81) | Some(90..=93) | Some(201..=203) => {
                FrameStarts::Markers
            }
            _ => FrameStarts::OffsetTable,
        }
    }
}

/// The number in `1.2.840.10008.1.2.4.<n>`, if the UID has that form.
fn jpeg_family_number(uid: &str) -> Option<u32> {
    uid.strip_prefix("1.2.840.10008.1.2.4.")?.parse().ok()
}

const JPIP_REFERENCED: &str = "1.2.840.10008.1.2.4.94";

fn is_video(uid: &str) -> bool {
    matches!(jpeg_family_number(uid), Some(100..=108))
}

/// Fragment table of encapsulated pixel data, built lazily.
#[derive(Debug)]
struct FragmentTable {
    frame_count: u32,
    frame_starts_rule: FrameStarts,
    basic_offset_table: Option<Vec<u32>>,
    fragments: Vec<Fragment>,
    /// index of the first fragment of each frame found so far
    frame_starts: Vec<usize>,
    /// position of the next item header, once the offset table is read
    next_item: Option<u64>,
    last_item_seen: bool,
}

#[derive(Debug)]
enum Encoding {
    Native {
        frame_len: u64,
        /// declared length of the pixel data value
        value_len: u64,
    },
    Encapsulated(FragmentTable),
    /// the pixel data value refers to an external source
    Referenced { length: u64 },
}

/// Locates and reads the bytes of individual frames.
///
/// Lookups take `&mut self`, since the fragment table is built
/// while reading from the stream:
/// concurrent readers need independent locators.
#[derive(Debug)]
pub struct FrameLocator<R> {
    source: R,
    pixel_data_offset: u64,
    frame_count: u32,
    encoding: Encoding,
}

impl<R> FrameLocator<R>
where
    R: Read + Seek,
{
    /// Create a locator for the pixel data described by `geometry`,
    /// with native frames of `frame_len` bytes each.
    pub fn new(source: R, geometry: &DicomPixelGeometry, frame_len: u64) -> Self {
        let uid = geometry.transfer_syntax_uid.as_str();
        let encoding = if uid == JPIP_REFERENCED {
            Encoding::Referenced {
                length: geometry.pixel_data_length.max(0) as u64,
            }
        } else if geometry.is_encapsulated() {
            let frame_count = if is_video(uid) {
                1
            } else {
                geometry.frame_count
            };
            Encoding::Encapsulated(FragmentTable {
                frame_count,
                frame_starts_rule: FrameStarts::for_transfer_syntax(uid),
                basic_offset_table: None,
                fragments: Vec::new(),
                frame_starts: Vec::new(),
                next_item: None,
                last_item_seen: false,
            })
        } else {
            Encoding::Native {
                frame_len,
                value_len: geometry.pixel_data_length.max(0) as u64,
            }
        };

        let frame_count = match &encoding {
            Encoding::Encapsulated(table) => table.frame_count,
            _ => geometry.frame_count,
        };

        FrameLocator {
            source,
            pixel_data_offset: geometry.pixel_data_offset,
            frame_count,
            encoding,
        }
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Get access to the underlying stream.
    pub fn source_mut(&mut self) -> &mut R {
        &mut self.source
    }

    /// Discover the byte ranges of the frame at `index`.
    pub fn frame_descriptor(&mut self, index: u32) -> Result<FrameDescriptor> {
        ensure!(
            index < self.frame_count,
            FrameIndexSnafu {
                index,
                count: self.frame_count
            }
        );

        let ranges = match &mut self.encoding {
            Encoding::Native {
                frame_len,
                value_len,
            } => {
                let frame_len = *frame_len;
                // frames past the end of the value are not read from what follows it
                let end = (u64::from(index) + 1).checked_mul(frame_len);
                ensure!(
                    end.map_or(false, |end| end <= *value_len),
                    TruncatedSnafu {
                        index,
                        expected: frame_len
                    }
                );
                let start = self.pixel_data_offset + u64::from(index) * frame_len;
                vec![start..start + frame_len]
            }
            Encoding::Referenced { length } => {
                vec![self.pixel_data_offset..self.pixel_data_offset + *length]
            }
            Encoding::Encapsulated(table) => {
                table.frame_fragments(&mut self.source, self.pixel_data_offset, index)?
            }
        };
        Ok(FrameDescriptor { index, ranges })
    }

    /// Read the bytes of the frame at `index`,
    /// concatenating its fragments if encapsulated.
    pub fn read_frame_bytes(&mut self, index: u32) -> Result<Vec<u8>> {
        let descriptor = self.frame_descriptor(index)?;
        let expected = descriptor.len();
        let stream_len = self
            .source
            .seek(SeekFrom::End(0))
            .context(ReadPixelDataSnafu)?;
        ensure!(
            descriptor.ranges.iter().all(|r| r.end <= stream_len),
            TruncatedSnafu { index, expected }
        );
        debug!(
            "Reading frame #{} ({} bytes in {} ranges)",
            index,
            expected,
            descriptor.ranges.len()
        );

        let mut data = vec![0; expected as usize];
        let mut filled = 0;
        for range in descriptor.ranges {
            let len = (range.end - range.start) as usize;
            self.source
                .seek(SeekFrom::Start(range.start))
                .context(ReadPixelDataSnafu)?;
            match self.source.read_exact(&mut data[filled..filled + len]) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return TruncatedSnafu { index, expected }.fail()
                }
                Err(e) => return Err(e).context(ReadPixelDataSnafu),
            }
            filled += len;
        }
        Ok(data)
    }

    /// The number of fragments in encapsulated pixel data,
    /// walking all of them if necessary.
    /// Native pixel data has no fragments.
    pub fn number_of_fragments(&mut self) -> Result<usize> {
        match &mut self.encoding {
            Encoding::Encapsulated(table) => {
                table.walk_all(&mut self.source, self.pixel_data_offset)?;
                Ok(table.fragments.len())
            }
            _ => Ok(0),
        }
    }
}

impl FragmentTable {
    /// Read the basic offset table item, if not read yet.
    fn start<R: Read + Seek>(&mut self, source: &mut R, pixel_data_offset: u64) -> Result<u64> {
        if let Some(next) = self.next_item {
            return Ok(next);
        }

        let (tag, len) = read_item_header(source, pixel_data_offset)?;
        if tag != ITEM {
            warn!("Expected basic offset table item, found {}", tag);
        }
        let table_start = pixel_data_offset + 8;
        if len != 0 {
            if len != self.frame_count * 4 {
                warn!(
                    "Skip basic offset table with illegal length {} for image with {} frames",
                    len, self.frame_count
                );
            } else {
                let mut bytes = vec![0; len as usize];
                source.read_exact(&mut bytes).context(ReadPixelDataSnafu)?;
                let mut table = vec![0; self.frame_count as usize];
                LittleEndian::read_u32_into(&bytes, &mut table);
                self.basic_offset_table = Some(table);
            }
        }
        let next = table_start + u64::from(len);
        self.next_item = Some(next);
        Ok(next)
    }

    /// Walk to the next fragment, returning false after the last one.
    fn next_fragment<R: Read + Seek>(
        &mut self,
        source: &mut R,
        pixel_data_offset: u64,
    ) -> Result<bool> {
        if self.last_item_seen {
            return Ok(false);
        }
        let item_pos = self.start(source, pixel_data_offset)?;

        let (tag, length) = match read_item_header(source, item_pos) {
            Ok(header) => header,
            Err(LocateError::ReadPixelData { source }) => {
                warn!("I/O error reading next item: {}", source);
                self.last_item_seen = true;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        trace!("Read {} #{} at {}", tag, length, item_pos);

        if tag != ITEM {
            if tag != SEQUENCE_DELIMITER || length != 0 {
                warn!("Expected (FFFE,E0DD) #0 but read {} #{}", tag, length);
            }
            self.last_item_seen = true;
            return Ok(false);
        }

        let fragment = Fragment {
            position: item_pos + 8,
            length,
        };
        let starts_frame = if self.fragments.is_empty()
            || self.frame_starts_rule == FrameStarts::EveryFragment
        {
            true
        } else if self.frame_starts.len() < self.frame_count as usize {
            let frame = self.frame_starts.len();
            match (&self.basic_offset_table, self.frame_starts_rule) {
                (Some(table), _) => {
                    let first = self.fragments[self.frame_starts[0]].position;
                    let matches = fragment.position == first + u64::from(table[frame]);
                    if matches {
                        trace!(
                            "Fragment #{} matches entry #{} of the basic offset table",
                            self.fragments.len() + 1,
                            frame + 1
                        );
                    }
                    matches
                }
                (None, FrameStarts::Markers) => {
                    let marker = read_marker(source, fragment.position)?;
                    let found = marker[0] == 0xFF && (marker[1] == 0xD8 || marker[1] == 0x4F);
                    if found {
                        trace!("Detected SOI/SOC marker at fragment #{}", self.fragments.len() + 1);
                    }
                    found
                }
                (None, _) => false,
            }
        } else {
            false
        };

        if starts_frame {
            trace!(
                "Fragment #{} is the first of frame #{}",
                self.fragments.len() + 1,
                self.frame_starts.len() + 1
            );
            self.frame_starts.push(self.fragments.len());
        }
        self.fragments.push(fragment);
        self.next_item = Some(fragment.position + u64::from(length));
        Ok(true)
    }

    fn walk_all<R: Read + Seek>(&mut self, source: &mut R, pixel_data_offset: u64) -> Result<()> {
        while self.next_fragment(source, pixel_data_offset)? {}
        Ok(())
    }

    /// Collect the ranges of the fragments of frame `index`,
    /// walking only as far as necessary.
    fn frame_fragments<R: Read + Seek>(
        &mut self,
        source: &mut R,
        pixel_data_offset: u64,
        index: u32,
    ) -> Result<Vec<Range<u64>>> {
        let index_usize = index as usize;
        while self.frame_starts.len() <= index_usize {
            if !self.next_fragment(source, pixel_data_offset)? {
                return MissingFrameStartSnafu { index }.fail();
            }
        }

        // the frame ends where the next one begins, or with the last fragment
        if index + 1 < self.frame_count {
            while self.frame_starts.len() <= index_usize + 1 {
                if !self.next_fragment(source, pixel_data_offset)? {
                    break;
                }
            }
        } else {
            self.walk_all(source, pixel_data_offset)?;
        }

        let first = self.frame_starts[index_usize];
        let end = self
            .frame_starts
            .get(index_usize + 1)
            .copied()
            .unwrap_or(self.fragments.len());
        debug!(
            "Frame #{} spans fragments {}..{} of {}",
            index,
            first,
            end,
            self.fragments.len()
        );
        Ok(self.fragments[first..end].iter().map(Fragment::range).collect())
    }
}

/// Read an item header at `position`.
/// Encapsulated pixel data is always little endian.
fn read_item_header<R: Read + Seek>(source: &mut R, position: u64) -> Result<(Tag, u32)> {
    let mut header = [0; 8];
    source
        .seek(SeekFrom::Start(position))
        .context(ReadPixelDataSnafu)?;
    source.read_exact(&mut header).context(ReadPixelDataSnafu)?;
    let tag = Tag(
        LittleEndian::read_u16(&header[0..2]),
        LittleEndian::read_u16(&header[2..4]),
    );
    Ok((tag, LittleEndian::read_u32(&header[4..8])))
}

fn read_marker<R: Read + Seek>(source: &mut R, position: u64) -> Result<[u8; 2]> {
    let mut marker = [0; 2];
    source
        .seek(SeekFrom::Start(position))
        .context(ReadPixelDataSnafu)?;
    source.read_exact(&mut marker).context(ReadPixelDataSnafu)?;
    Ok(marker)
}
