//! Pluggable frame codecs and palette color models.
//!
//! Entropy decoding of compressed frames is not done by this crate itself:
//! a [`CodecRegistry`] maps transfer syntax UIDs to [`FrameCodec`]s,
//! each turning the bytes of exactly one frame into a [`Raster`].
//! Codecs are stateless and invoked once per frame.
//!
//! With the `jpeg` feature (enabled by default),
//! the default registry contains a codec for
//! the JPEG baseline, extended and lossless transfer syntaxes,
//! based on the `jpeg-decoder` crate.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use snafu::Snafu;

use crate::geometry::{DicomPixelGeometry, LutData};
use crate::raster::Raster;

/// An error raised by a frame codec.
#[derive(Debug, Snafu)]
#[snafu(display("{}", message))]
pub struct CodecError {
    message: String,
    #[snafu(source(false))]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CodecError {
    /// Create a codec error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        CodecError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a codec error caused by another error.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        CodecError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The underlying error, if any.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }
}

/// A single-frame decoder for one family of compressed transfer syntaxes.
pub trait FrameCodec: Send + Sync {
    /// Decode the bytes of one frame,
    /// as the concatenation of its fragments.
    fn decode(&self, data: &[u8], geometry: &DicomPixelGeometry) -> Result<Raster, CodecError>;
}

impl<F> FrameCodec for F
where
    F: Fn(&[u8], &DicomPixelGeometry) -> Result<Raster, CodecError> + Send + Sync,
{
    fn decode(&self, data: &[u8], geometry: &DicomPixelGeometry) -> Result<Raster, CodecError> {
        self(data, geometry)
    }
}

/// A registry of frame codecs by transfer syntax UID.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn FrameCodec>>,
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut uids: Vec<_> = self.codecs.keys().collect();
        uids.sort();
        f.debug_struct("CodecRegistry").field("codecs", &uids).finish()
    }
}

impl Default for CodecRegistry {
    /// The registry of the codecs built into this crate.
    fn default() -> Self {
        #[allow(unused_mut)]
        let mut registry = CodecRegistry::empty();
        #[cfg(feature = "jpeg")]
        {
            use dicom_dictionary_std::uids;
            for uid in [
                uids::JPEG_BASELINE8_BIT,
                uids::JPEG_EXTENDED12_BIT,
                uids::JPEG_LOSSLESS,
                uids::JPEG_LOSSLESS_SV1,
            ] {
                registry.register(uid, jpeg::JpegCodec);
            }
        }
        registry
    }
}

impl CodecRegistry {
    /// Create a registry without any codecs.
    pub fn empty() -> Self {
        CodecRegistry {
            codecs: HashMap::new(),
        }
    }

    /// Register a codec for the given transfer syntax,
    /// replacing any codec registered for it before.
    pub fn register(&mut self, uid: impl Into<String>, codec: impl FrameCodec + 'static) {
        self.codecs.insert(uid.into(), Arc::new(codec));
    }

    /// Remove the codec of the given transfer syntax.
    pub fn unregister(&mut self, uid: &str) -> bool {
        self.codecs.remove(uid).is_some()
    }

    pub fn get(&self, uid: &str) -> Option<&dyn FrameCodec> {
        self.codecs.get(uid).map(|codec| &**codec)
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.codecs.contains_key(uid)
    }
}

/// Color lookup tables of a _PALETTE COLOR_ image.
#[derive(Debug, Clone, PartialEq)]
pub struct Palette {
    red: LutData,
    green: LutData,
    blue: LutData,
}

impl Palette {
    pub fn new(red: LutData, green: LutData, blue: LutData) -> Self {
        Palette { red, green, blue }
    }

    /// Whether all tables have 8-bit entries.
    pub fn is_8bit(&self) -> bool {
        self.red.bits <= 8 && self.green.bits <= 8 && self.blue.bits <= 8
    }

    /// Map a palette index to its red, green and blue values.
    pub fn lookup(&self, index: i64) -> [u16; 3] {
        [
            self.red.lookup(index),
            self.green.lookup(index),
            self.blue.lookup(index),
        ]
    }
}

/// Creates the color model of indexed color images.
pub trait ColorModelFactory: Send + Sync {
    /// Create the palette of the image,
    /// or `None` if it has no usable palette.
    fn create_palette(&self, geometry: &DicomPixelGeometry) -> Option<Palette>;
}

/// Builds palettes from the palette color lookup tables of the data set.
#[derive(Debug, Default, Copy, Clone)]
pub struct PaletteColorModelFactory;

impl ColorModelFactory for PaletteColorModelFactory {
    fn create_palette(&self, geometry: &DicomPixelGeometry) -> Option<Palette> {
        if !geometry.photometric_interpretation.is_palette_color() {
            return None;
        }
        let tables = geometry.palette.as_ref()?;
        Some(Palette::new(
            tables.red.clone(),
            tables.green.clone(),
            tables.blue.clone(),
        ))
    }
}

#[cfg(feature = "jpeg")]
pub mod jpeg {
    //! JPEG codec based on `jpeg-decoder`.
    use jpeg_decoder::{Decoder, PixelFormat};

    use super::{CodecError, FrameCodec};
    use crate::geometry::DicomPixelGeometry;
    use crate::raster::{Raster, RasterData};

    /// Decodes JPEG baseline, extended and lossless frames.
    #[derive(Debug, Default, Copy, Clone)]
    pub struct JpegCodec;

    impl FrameCodec for JpegCodec {
        fn decode(
            &self,
            data: &[u8],
            _geometry: &DicomPixelGeometry,
        ) -> Result<Raster, CodecError> {
            let mut decoder = Decoder::new(data);
            let pixels = decoder
                .decode()
                .map_err(|e| CodecError::with_source("JPEG decoding failure", e))?;
            let info = decoder
                .info()
                .ok_or_else(|| CodecError::new("JPEG decoder produced no image information"))?;
            let (width, height) = (u32::from(info.width), u32::from(info.height));

            let (channels, data) = match info.pixel_format {
                PixelFormat::L8 => (1, RasterData::U8(pixels)),
                PixelFormat::L16 => (
                    1,
                    RasterData::U16(
                        pixels
                            .chunks_exact(2)
                            .map(|c| u16::from_be_bytes([c[0], c[1]]))
                            .collect(),
                    ),
                ),
                PixelFormat::RGB24 => (3, RasterData::U8(pixels)),
                PixelFormat::CMYK32 => {
                    return Err(CodecError::new("CMYK JPEG images are not supported"))
                }
            };
            Raster::new(width, height, channels, data)
                .map_err(|e| CodecError::with_source("Unexpected JPEG output size", e))
        }
    }
}
