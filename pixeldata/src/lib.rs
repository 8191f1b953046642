//! This crate contains a DICOM pixel data decoding engine
//! and a raw raster disk cache.
//!
//! It scans a DICOM stream up to the _Pixel Data_ element
//! to learn the geometry and encoding of the image,
//! locates individual frames in native or encapsulated pixel data,
//! decodes them into [`Raster`]s,
//! resolves display windows,
//! and persists decoded rasters to compact cache files.
//!
//! Entropy decoding of compressed transfer syntaxes is delegated
//! to the codecs registered in a [`CodecRegistry`].
//! With the `jpeg` feature (enabled by default),
//! JPEG baseline, extended and lossless frames are supported out of the box.
//!
//! # Examples
//!
//! ```no_run
//! # use std::error::Error;
//! use dicom_pixelcore::{DecoderContext, PixelSource, ReadParams};
//! use dicom_pixelcore::window::{WindowCalculator, WindowOverrides};
//!
//! # fn main() -> Result<(), Box<dyn Error>> {
//! let context = DecoderContext::builder()
//!     .cache_root("/tmp/dicom-cache")
//!     .build();
//! let mut source = PixelSource::open("dicom.dcm")?;
//!
//! let raster = context.decode_frame_cached(&mut source, 0, &ReadParams::default())?;
//! println!("{}x{} {:?}", raster.width(), raster.height(), raster.sample_type());
//!
//! let mut windows = WindowCalculator::new();
//! let window = windows.compute_window(
//!     source.geometry(),
//!     0,
//!     Some(&raster),
//!     &WindowOverrides::default(),
//! )?;
//! println!("center {} width {}", window.center, window.width);
//! #   Ok(())
//! # }
//! ```
//!
//! Cached rasters can be read back without the source:
//!
//! ```no_run
//! # use std::error::Error;
//! use dicom_pixelcore::cache::RawCache;
//!
//! # fn main() -> Result<(), Box<dyn Error>> {
//! let raster = RawCache::new("/tmp/dicom-cache/frame.wcv").read()?;
//! #   Ok(())
//! # }
//! ```

pub mod attribute;
pub mod cache;
pub mod codec;
pub mod decode;
pub mod encapsulation;
pub mod geometry;
pub mod layout;
pub mod locator;
pub mod lut;
pub mod raster;
pub mod rectify;
pub mod transform;
pub mod window;

pub use cache::{CacheIoError, CachePolicy, ElementType, RawCache};
pub use codec::{CodecError, CodecRegistry, ColorModelFactory, FrameCodec, Palette};
pub use decode::{DecoderContext, Error, FrameData, PixelSource, ReadParams, Result};
pub use geometry::{DicomPixelGeometry, GeometryParser};
pub use layout::{PixelLayout, SubsampledLayout};
pub use locator::{FrameDescriptor, FrameLocator};
pub use lut::Lut;
pub use raster::{Raster, RasterData, SampleType};
pub use rectify::rectify_signed;
pub use transform::{Rescale, VoiLutFunction, WindowLevel, WindowLevelTransform};
pub use window::{Window, WindowCalculator, WindowOverrides};
