//! Raw raster disk cache.
//!
//! A cache file holds exactly one decoded [`Raster`]:
//! a fixed 50-byte header followed by the row-major samples.
//!
//! | bytes      | content                                  |
//! |------------|------------------------------------------|
//! | `[0, 4)`   | element type code, `i32` little endian   |
//! | `[4, 8)`   | width, `i32` little endian               |
//! | `[8, 12)`  | height, `i32` little endian              |
//! | `[12, 50)` | reserved, zero                           |
//! | `[50, ..)` | samples, little endian                   |
//!
//! The element type code combines the sample depth and the channel count
//! as `depth | ((channels - 1) << 3)`,
//! with depths 0 (`u8`), 2 (`u16`), 3 (`i16`), 4 (`i32`), 5 (`f32`) and 6 (`f64`).
//! All values are little endian regardless of the platform
//! or the byte order of the source data set.
//!
//! Cache files are a best effort optimization:
//! a failure to read one should be treated as a miss,
//! followed by decoding the frame from the source again.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use tracing::{debug, trace};

use crate::geometry::DicomPixelGeometry;
use crate::raster::{Raster, RasterData, RasterError, SampleType};

/// The size of the cache file header in bytes.
pub const HEADER_LEN: usize = 50;

/// The extension of cache files.
pub const CACHE_EXTENSION: &str = "wcv";

const MAX_CHANNELS: u16 = 512;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CacheIoError {
    #[snafu(display("Could not create cache file {}", path.display()))]
    CreateFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not open cache file {}", path.display()))]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not write to cache file {}", path.display()))]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not map cache file {}", path.display()))]
    MapFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not remove cache file {}", path.display()))]
    RemoveFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Cache file {} is too short ({} bytes) to hold a header", path.display(), len))]
    TruncatedHeader { path: PathBuf, len: u64 },

    #[snafu(display("Unknown element type code {} in cache file {}", code, path.display()))]
    UnknownElementType { path: PathBuf, code: i32 },

    #[snafu(display("Invalid dimensions {}x{} in cache file {}", width, height, path.display()))]
    InvalidDimensions {
        path: PathBuf,
        width: i32,
        height: i32,
    },

    #[snafu(display(
        "Cache file {} holds {} payload bytes, expected {}",
        path.display(),
        actual,
        expected
    ))]
    PayloadLength {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// Raster with {channels} channels cannot be cached
    UnsupportedChannels { channels: u16 },

    /// Could not take row from raster
    RasterRow { source: RasterError },

    /// Cached samples do not form a valid raster
    InvalidRaster { source: RasterError },
}

pub type Result<T, E = CacheIoError> = std::result::Result<T, E>;

/// The sample type and channel count of a cached raster.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub struct ElementType {
    pub sample_type: SampleType,
    pub channels: u16,
}

impl ElementType {
    pub fn new(sample_type: SampleType, channels: u16) -> Self {
        ElementType {
            sample_type,
            channels,
        }
    }

    /// The element type of the given raster.
    pub fn of(raster: &Raster) -> Self {
        ElementType::new(raster.sample_type(), raster.channels())
    }

    /// The code stored in the cache file header.
    pub fn code(self) -> i32 {
        let depth = match self.sample_type {
            SampleType::U8 => 0,
            SampleType::U16 => 2,
            SampleType::I16 => 3,
            SampleType::I32 => 4,
            SampleType::F32 => 5,
            SampleType::F64 => 6,
        };
        depth | ((i32::from(self.channels) - 1) << 3)
    }

    /// Interpret a header code,
    /// returning `None` if it does not describe a supported element type.
    pub fn from_code(code: i32) -> Option<Self> {
        let sample_type = match code & 7 {
            0 => SampleType::U8,
            2 => SampleType::U16,
            3 => SampleType::I16,
            4 => SampleType::I32,
            5 => SampleType::F32,
            6 => SampleType::F64,
            _ => return None,
        };
        let channels = (code >> 3) + 1;
        if channels < 1 || channels > i32::from(MAX_CHANNELS) {
            return None;
        }
        Some(ElementType::new(sample_type, channels as u16))
    }

    /// The size of one pixel in bytes.
    pub fn pixel_size(self) -> usize {
        self.sample_type.size() * self.channels as usize
    }
}

/// The decoded contents of a cache file header.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub struct CacheHeader {
    pub element_type: ElementType,
    pub width: u32,
    pub height: u32,
}

impl CacheHeader {
    /// Encode the header.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0; HEADER_LEN];
        LittleEndian::write_i32(&mut out[0..4], self.element_type.code());
        LittleEndian::write_i32(&mut out[4..8], self.width as i32);
        LittleEndian::write_i32(&mut out[8..12], self.height as i32);
        out
    }

    /// The number of payload bytes following the header,
    /// or `None` if it does not fit in a `u64`.
    pub fn payload_len(&self) -> Option<u64> {
        u64::from(self.width)
            .checked_mul(u64::from(self.height))?
            .checked_mul(self.element_type.pixel_size() as u64)
    }
}

/// When a decoded raster is worth caching.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CachePolicy {
    /// rasters larger than this in either dimension are cached
    pub tile_size: u32,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy { tile_size: 512 }
    }
}

impl CachePolicy {
    /// Whether the raster decoded from a data set of the given geometry
    /// should be written to the cache:
    /// it is larger than a tile,
    /// or its samples are not of the type read from native pixel data.
    pub fn should_cache(&self, geometry: &DicomPixelGeometry, raster: &Raster) -> bool {
        raster.width() > self.tile_size
            || raster.height() > self.tile_size
            || raster.sample_type() != geometry.native_sample_type()
    }
}

/// A raw raster cache file.
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub struct RawCache {
    path: PathBuf,
}

impl RawCache {
    /// A cache file at the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        RawCache { path: path.into() }
    }

    /// The cache file of a source in the given cache directory,
    /// named after the MD5 digest of the source URI.
    pub fn for_source(cache_root: impl AsRef<Path>, uri: &str) -> Self {
        let name = format!("{:x}.{}", md5::compute(uri.as_bytes()), CACHE_EXTENSION);
        RawCache::new(cache_root.as_ref().join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the cache file exists.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Write the whole raster, replacing any previous content.
    pub fn write(&self, raster: &Raster) -> Result<()> {
        let header = header_for(raster)?;
        let mut out = BufWriter::new(self.create()?);
        out.write_all(&header.to_bytes())
            .context(WriteFileSnafu { path: &self.path })?;
        for row in 0..raster.height() {
            let bytes = raster.row_le_bytes(row).context(RasterRowSnafu)?;
            out.write_all(&bytes)
                .context(WriteFileSnafu { path: &self.path })?;
        }
        out.flush().context(WriteFileSnafu { path: &self.path })?;
        debug!(
            "Wrote {}x{} raster to cache file {}",
            raster.width(),
            raster.height(),
            self.path.display()
        );
        Ok(())
    }

    /// Create the file with only its header,
    /// so that rows can be appended with [`write_row`](Self::write_row).
    pub fn write_header(&self, element_type: ElementType, width: u32, height: u32) -> Result<()> {
        ensure!(
            (1..=MAX_CHANNELS).contains(&element_type.channels),
            UnsupportedChannelsSnafu {
                channels: element_type.channels
            }
        );
        let header = CacheHeader {
            element_type,
            width,
            height,
        };
        let mut file = self.create()?;
        file.write_all(&header.to_bytes())
            .context(WriteFileSnafu { path: &self.path })?;
        Ok(())
    }

    /// Append one row of the raster at the end of the file.
    ///
    /// The row is not checked against the header:
    /// rows must be appended in order
    /// and match the element type and width given to
    /// [`write_header`](Self::write_header).
    pub fn write_row(&self, raster: &Raster, row: u32) -> Result<()> {
        let bytes = raster.row_le_bytes(row).context(RasterRowSnafu)?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .context(OpenFileSnafu { path: &self.path })?;
        file.write_all(&bytes)
            .context(WriteFileSnafu { path: &self.path })?;
        trace!("Appended row {} to cache file {}", row, self.path.display());
        Ok(())
    }

    /// Read only the header of the cache file.
    pub fn read_header(&self) -> Result<CacheHeader> {
        let file = File::open(&self.path).context(OpenFileSnafu { path: &self.path })?;
        // SAFETY: the mapping is read only and dropped before returning;
        // cache files are not expected to be modified while being read
        let map = unsafe { Mmap::map(&file) }.context(MapFileSnafu { path: &self.path })?;
        self.parse_header(&map)
    }

    /// Read the cached raster.
    pub fn read(&self) -> Result<Raster> {
        let file = File::open(&self.path).context(OpenFileSnafu { path: &self.path })?;
        // SAFETY: the mapping is read only and dropped before returning;
        // cache files are not expected to be modified while being read
        let map = unsafe { Mmap::map(&file) }.context(MapFileSnafu { path: &self.path })?;
        let header = self.parse_header(&map)?;

        let expected = header
            .payload_len()
            .context(InvalidDimensionsSnafu {
                path: &self.path,
                width: header.width as i32,
                height: header.height as i32,
            })?;
        let actual = (map.len() - HEADER_LEN) as u64;
        ensure!(
            actual == expected,
            PayloadLengthSnafu {
                path: &self.path,
                expected,
                actual,
            }
        );

        let data = RasterData::from_le_bytes(header.element_type.sample_type, &map[HEADER_LEN..]);
        Raster::new(
            header.width,
            header.height,
            header.element_type.channels,
            data,
        )
        .context(InvalidRasterSnafu)
    }

    /// Remove the cache file, if it exists.
    pub fn discard(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Discarded cache file {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(RemoveFileSnafu { path: &self.path }),
        }
    }

    fn create(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context(CreateFileSnafu { path: &self.path })?;
            }
        }
        File::create(&self.path).context(CreateFileSnafu { path: &self.path })
    }

    fn parse_header(&self, bytes: &[u8]) -> Result<CacheHeader> {
        ensure!(
            bytes.len() >= HEADER_LEN,
            TruncatedHeaderSnafu {
                path: &self.path,
                len: bytes.len() as u64,
            }
        );
        let code = LittleEndian::read_i32(&bytes[0..4]);
        let width = LittleEndian::read_i32(&bytes[4..8]);
        let height = LittleEndian::read_i32(&bytes[8..12]);

        let element_type = ElementType::from_code(code).context(UnknownElementTypeSnafu {
            path: &self.path,
            code,
        })?;
        ensure!(
            width >= 0 && height >= 0,
            InvalidDimensionsSnafu {
                path: &self.path,
                width,
                height,
            }
        );
        let header = CacheHeader {
            element_type,
            width: width as u32,
            height: height as u32,
        };
        ensure!(
            header.payload_len().is_some(),
            InvalidDimensionsSnafu {
                path: &self.path,
                width,
                height,
            }
        );
        Ok(header)
    }
}

fn header_for(raster: &Raster) -> Result<CacheHeader> {
    let element_type = ElementType::of(raster);
    ensure!(
        (1..=MAX_CHANNELS).contains(&element_type.channels),
        UnsupportedChannelsSnafu {
            channels: element_type.channels
        }
    );
    Ok(CacheHeader {
        element_type,
        width: raster.width(),
        height: raster.height(),
    })
}
