//! Frame decoding.
//!
//! A [`PixelSource`] is one open DICOM stream
//! together with its parsed geometry and frame locator.
//! A [`DecoderContext`] holds everything else needed to decode frames:
//! the codec registry, the palette color model factory
//! and the optional raw cache settings.
//! Contexts hold no per-stream state,
//! so one context may serve any number of sources.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::cache::{CachePolicy, RawCache};
use crate::codec::{CodecError, CodecRegistry, ColorModelFactory, PaletteColorModelFactory};
use crate::geometry::{DicomPixelGeometry, GeometryParser, ParseError};
use crate::layout::{LayoutError, PixelLayout};
use crate::locator::{FrameDescriptor, FrameLocator, LocateError};
use crate::raster::{Raster, RasterData, RasterError};
use crate::rectify::rectify_signed;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not open file {}", path.display()))]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid or incomplete pixel data geometry
    Format { source: ParseError },

    /// No codec registered for transfer syntax {uid}
    UnsupportedTransferSyntax { uid: String },

    /// Frame #{index} requested, but there are only {count} frames
    FrameIndex { index: u32, count: u32 },

    /// Frame #{index} needs {expected} bytes, but the stream ended
    TruncatedStream { index: u32, expected: u64 },

    /// Could not decode frame #{index}
    Codec { index: u32, source: CodecError },

    /// Subsampled pixel data requires 3 bands, got {bands}
    InvalidBandCount { bands: u16 },

    /// Unsupported pixel layout
    Layout { source: LayoutError },

    /// Could not read pixel data
    Io { source: std::io::Error },

    /// Could not locate frame in pixel data
    Locate { source: LocateError },

    /// Unsupported Bits Allocated {bits_allocated}
    UnsupportedBitsAllocated { bits_allocated: u16 },

    /// Decoded samples do not form a valid raster
    InvalidRaster { source: RasterError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<LocateError> for Error {
    fn from(e: LocateError) -> Self {
        match e {
            LocateError::FrameIndex { index, count } => Error::FrameIndex { index, count },
            LocateError::Truncated { index, expected } => Error::TruncatedStream { index, expected },
            LocateError::ReadPixelData { source } => Error::Io { source },
            source => Error::Locate { source },
        }
    }
}

fn layout_error(e: LayoutError) -> Error {
    match e {
        LayoutError::InvalidBandCount { bands } => Error::InvalidBandCount { bands },
        source => Error::Layout { source },
    }
}

/// Per-call decoding options.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReadParams {
    /// align the sign bit of signed samples
    /// stored below the top bit of their container
    pub rectify_signed: bool,
    /// return the packed bytes of chroma subsampled frames
    /// instead of expanding them
    pub keep_packed: bool,
    /// expand _PALETTE COLOR_ frames to RGB
    pub expand_palette: bool,
}

impl Default for ReadParams {
    fn default() -> Self {
        ReadParams {
            rectify_signed: true,
            keep_packed: false,
            expand_palette: true,
        }
    }
}

/// The outcome of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameData {
    /// a decoded raster
    Raster(Raster),
    /// the packed bytes of a chroma subsampled frame,
    /// as requested with [`ReadParams::keep_packed`]
    Packed(Vec<u8>),
}

impl FrameData {
    pub fn into_raster(self) -> Option<Raster> {
        match self {
            FrameData::Raster(raster) => Some(raster),
            FrameData::Packed(_) => None,
        }
    }
}

/// An open DICOM stream ready for frame decoding.
///
/// Frame lookups mutate the underlying stream and fragment table,
/// so at most one decode may run at a time on a source.
#[derive(Debug)]
pub struct PixelSource<R> {
    geometry: DicomPixelGeometry,
    layout: PixelLayout,
    locator: FrameLocator<R>,
    uri: String,
}

impl PixelSource<BufReader<File>> {
    /// Open a DICOM file.
    ///
    /// The source URI used for cache keys is the canonical file path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).context(OpenFileSnafu { path })?;
        let uri = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf())
            .display()
            .to_string();
        Ok(PixelSource::from_reader(BufReader::new(file), &GeometryParser::default())?.with_uri(uri))
    }
}

impl<R> PixelSource<R>
where
    R: Read + Seek,
{
    /// Parse the geometry of the pixel data in the stream
    /// and prepare for frame decoding.
    pub fn from_reader(mut reader: R, parser: &GeometryParser) -> Result<Self> {
        let geometry = parser.parse(&mut reader).context(FormatSnafu)?;
        let layout = PixelLayout::for_geometry(&geometry).map_err(layout_error)?;
        let frame_len = layout.frame_len() as u64;
        let locator = FrameLocator::new(reader, &geometry, frame_len);
        Ok(PixelSource {
            geometry,
            layout,
            locator,
            uri: String::new(),
        })
    }

    /// Set the URI identifying the source in the raw cache.
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    pub fn geometry(&self) -> &DicomPixelGeometry {
        &self.geometry
    }

    pub fn layout(&self) -> &PixelLayout {
        &self.layout
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The number of frames which can be decoded.
    pub fn frame_count(&self) -> u32 {
        self.locator.frame_count()
    }

    /// Discover the byte ranges of a frame.
    pub fn frame_descriptor(&mut self, frame: u32) -> Result<FrameDescriptor> {
        Ok(self.locator.frame_descriptor(frame)?)
    }

    /// The number of fragments of encapsulated pixel data.
    pub fn number_of_fragments(&mut self) -> Result<usize> {
        Ok(self.locator.number_of_fragments()?)
    }

    /// The key of a frame in the raw cache.
    ///
    /// Read parameters which change the decoded samples
    /// are part of the key, so that rasters decoded
    /// with different parameters are cached apart.
    pub fn cache_key(&self, frame: u32, params: &ReadParams) -> String {
        let mut key = if self.frame_count() > 1 {
            format!("{}#{}", self.uri, frame)
        } else {
            self.uri.clone()
        };
        let mut options = Vec::new();
        if !params.rectify_signed {
            options.push("rectify=0");
        }
        if !params.expand_palette {
            options.push("palette=0");
        }
        if !options.is_empty() {
            key.push('?');
            key.push_str(&options.join("&"));
        }
        key
    }

    fn check_frame(&self, frame: u32) -> Result<()> {
        let count = self.frame_count();
        ensure!(frame < count, FrameIndexSnafu { index: frame, count });
        Ok(())
    }
}

/// Everything needed to decode frames, other than the frames themselves.
#[derive(Clone)]
pub struct DecoderContext {
    codecs: CodecRegistry,
    color_models: Arc<dyn ColorModelFactory>,
    cache_root: Option<PathBuf>,
    cache_policy: CachePolicy,
}

impl std::fmt::Debug for DecoderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderContext")
            .field("codecs", &self.codecs)
            .field("cache_root", &self.cache_root)
            .field("cache_policy", &self.cache_policy)
            .finish_non_exhaustive()
    }
}

impl Default for DecoderContext {
    fn default() -> Self {
        DecoderContext::builder().build()
    }
}

/// Builder for a [`DecoderContext`].
pub struct DecoderContextBuilder {
    codecs: CodecRegistry,
    color_models: Arc<dyn ColorModelFactory>,
    cache_root: Option<PathBuf>,
    cache_policy: CachePolicy,
}

impl DecoderContextBuilder {
    /// Use the given codec registry
    /// instead of the built-in codecs.
    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Use the given palette color model factory.
    pub fn color_models(mut self, factory: impl ColorModelFactory + 'static) -> Self {
        self.color_models = Arc::new(factory);
        self
    }

    /// Enable the raw cache in the given directory.
    pub fn cache_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_root = Some(path.into());
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn build(self) -> DecoderContext {
        DecoderContext {
            codecs: self.codecs,
            color_models: self.color_models,
            cache_root: self.cache_root,
            cache_policy: self.cache_policy,
        }
    }
}

impl DecoderContext {
    pub fn builder() -> DecoderContextBuilder {
        DecoderContextBuilder {
            codecs: CodecRegistry::default(),
            color_models: Arc::new(PaletteColorModelFactory),
            cache_root: None,
            cache_policy: CachePolicy::default(),
        }
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn cache_root(&self) -> Option<&Path> {
        self.cache_root.as_deref()
    }

    pub fn cache_policy(&self) -> &CachePolicy {
        &self.cache_policy
    }

    /// Decode one frame.
    ///
    /// Chroma subsampled frames are returned packed
    /// if [`ReadParams::keep_packed`] is set,
    /// every other frame is decoded into a raster.
    pub fn decode_frame<R>(
        &self,
        source: &mut PixelSource<R>,
        frame: u32,
        params: &ReadParams,
    ) -> Result<FrameData>
    where
        R: Read + Seek,
    {
        if params.keep_packed && matches!(source.layout, PixelLayout::Subsampled(_)) {
            source.check_frame(frame)?;
            let bytes = source.locator.read_frame_bytes(frame)?;
            return Ok(FrameData::Packed(bytes));
        }
        self.decode_raster(source, frame, params).map(FrameData::Raster)
    }

    /// Decode one frame into a raster.
    pub fn decode_raster<R>(
        &self,
        source: &mut PixelSource<R>,
        frame: u32,
        params: &ReadParams,
    ) -> Result<Raster>
    where
        R: Read + Seek,
    {
        source.check_frame(frame)?;
        let geometry = &source.geometry;

        let mut raster = if geometry.is_encapsulated() {
            let uid = geometry.transfer_syntax_uid.as_str();
            let codec = self
                .codecs
                .get(uid)
                .context(UnsupportedTransferSyntaxSnafu { uid })?;
            let bytes = source.locator.read_frame_bytes(frame)?;
            debug!(
                "Decoding frame #{} ({} bytes) with the codec for {}",
                frame,
                bytes.len(),
                uid
            );
            let mut raster = codec
                .decode(&bytes, geometry)
                .context(CodecSnafu { index: frame })?;
            if raster.width() != geometry.width || raster.height() != geometry.height {
                warn!(
                    "Codec output is {}x{}, but the data set declares {}x{}",
                    raster.width(),
                    raster.height(),
                    geometry.width,
                    geometry.height
                );
            }
            if geometry.swap_byte_order {
                if let RasterData::U8(samples) = raster.data_mut() {
                    swap_byte_pairs(samples);
                }
            }
            if geometry.is_signed() {
                // 16-bit codec output carries the stored two's complement bits
                if let RasterData::U16(samples) = raster.data() {
                    let samples = samples.iter().map(|&v| v as i16).collect();
                    *raster.data_mut() = RasterData::I16(samples);
                }
            }
            raster
        } else {
            let bytes = source.locator.read_frame_bytes(frame)?;
            match &source.layout {
                PixelLayout::Subsampled(layout) => layout
                    .unpack(&bytes, geometry.samples_per_pixel)
                    .map_err(layout_error)?,
                layout => {
                    let mut bytes = bytes;
                    if geometry.swap_byte_order {
                        swap_byte_pairs(&mut bytes);
                    }
                    let bytes = layout.to_interleaved(bytes).map_err(layout_error)?;
                    native_raster(geometry, &bytes)?
                }
            }
        };

        if params.rectify_signed && geometry.is_signed() {
            raster = rectify_signed(&raster, geometry.high_bit, geometry.bits_allocated);
        }

        if params.expand_palette
            && raster.channels() == 1
            && geometry.photometric_interpretation.is_palette_color()
        {
            match self.color_models.create_palette(geometry) {
                Some(palette) => {
                    raster = raster.apply_palette(&palette).context(InvalidRasterSnafu)?;
                }
                None => warn!("PALETTE COLOR image without usable palette, keeping indices"),
            }
        }
        Ok(raster)
    }

    /// Read the bytes of a frame without decoding them.
    ///
    /// Encapsulated frames are returned as the concatenation of their fragments.
    pub fn decode_frame_bytes<R>(&self, source: &mut PixelSource<R>, frame: u32) -> Result<Vec<u8>>
    where
        R: Read + Seek,
    {
        source.check_frame(frame)?;
        Ok(source.locator.read_frame_bytes(frame)?)
    }

    /// The raw cache file of a frame decoded with the given parameters,
    /// if the cache is enabled.
    pub fn cache_for<R>(
        &self,
        source: &PixelSource<R>,
        frame: u32,
        params: &ReadParams,
    ) -> Option<RawCache>
    where
        R: Read + Seek,
    {
        let root = self.cache_root.as_ref()?;
        Some(RawCache::for_source(root, &source.cache_key(frame, params)))
    }

    /// Decode one frame into a raster, going through the raw cache.
    ///
    /// A cached raster is returned if it can be read.
    /// Otherwise the frame is decoded,
    /// an unreadable cache file is discarded,
    /// and the raster is cached if the cache policy says so.
    /// Cache failures are logged and never fail the decode.
    pub fn decode_frame_cached<R>(
        &self,
        source: &mut PixelSource<R>,
        frame: u32,
        params: &ReadParams,
    ) -> Result<Raster>
    where
        R: Read + Seek,
    {
        source.check_frame(frame)?;
        let cache = match self.cache_for(source, frame, params) {
            Some(cache) => cache,
            None => return self.decode_raster(source, frame, params),
        };

        if cache.exists() {
            match cache.read() {
                Ok(raster) => {
                    debug!("Frame #{} read from cache {}", frame, cache.path().display());
                    return Ok(raster);
                }
                Err(e) => {
                    warn!("Discarding unreadable cache file: {}", e);
                    if let Err(e) = cache.discard() {
                        warn!("{}", e);
                    }
                }
            }
        } else {
            debug!("Cache miss for frame #{}", frame);
        }

        let raster = self.decode_raster(source, frame, params)?;
        if self.cache_policy.should_cache(&source.geometry, &raster) {
            if let Err(e) = cache.write(&raster) {
                warn!("Could not cache frame #{}: {}", frame, e);
                if let Err(e) = cache.discard() {
                    warn!("{}", e);
                }
            }
        }
        Ok(raster)
    }
}

/// Swap each pair of bytes,
/// undoing the word byte order of 8-bit samples
/// in a big endian OW value.
fn swap_byte_pairs(bytes: &mut [u8]) {
    for pair in bytes.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

/// Interpret interleaved native frame bytes as typed samples.
fn native_raster(geometry: &DicomPixelGeometry, bytes: &[u8]) -> Result<Raster> {
    let samples = bytes.len() / geometry.bytes_per_sample();
    let data = match (geometry.bits_allocated, geometry.big_endian) {
        (8, _) => RasterData::U8(bytes.to_vec()),
        (16, big_endian) => {
            let mut out = vec![0_u16; samples];
            if big_endian {
                BigEndian::read_u16_into(bytes, &mut out);
            } else {
                LittleEndian::read_u16_into(bytes, &mut out);
            }
            if geometry.is_signed() {
                RasterData::I16(out.into_iter().map(|v| v as i16).collect())
            } else {
                RasterData::U16(out)
            }
        }
        (32, big_endian) => {
            let mut out = vec![0_i32; samples];
            if big_endian {
                BigEndian::read_i32_into(bytes, &mut out);
            } else {
                LittleEndian::read_i32_into(bytes, &mut out);
            }
            RasterData::I32(out)
        }
        (bits_allocated, _) => return UnsupportedBitsAllocatedSnafu { bits_allocated }.fail(),
    };
    Raster::new(
        geometry.width,
        geometry.height,
        geometry.samples_per_pixel,
        data,
    )
    .context(InvalidRasterSnafu)
}
