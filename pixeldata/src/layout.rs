//! Pixel layouts and sample addressing.
//!
//! A [`PixelLayout`] describes how the samples of one native frame
//! are arranged in its bytes.
//! All byte offset arithmetic for the supported arrangements
//! lives in [`PixelLayout::sample_offset`]
//! and in the [`SubsampledLayout`] it dispatches to.
//!
//! ## Subsampled layout
//!
//! Images with a `YBR_*_422` or `YBR_*_420` photometric interpretation
//! share one pair of chroma samples across a block of
//! `subsample_x` by `subsample_y` pixels.
//! A chroma-bearing row is a run of blocks,
//! each holding the `subsample_x` luma samples of the block
//! followed by the blue and the red chroma samples:
//!
//! ```text
//! | Y0 Y1 Cb Cr | Y2 Y3 Cb Cr | ...
//! ```
//!
//! When `subsample_y` is 2, every other row carries luma samples only,
//! `width` bytes in total, and takes its chroma from the row above.
//! When the width is not a multiple of `subsample_x`,
//! the last block of each chroma-bearing row is padded with luma samples.

use snafu::{ensure, Snafu};

use crate::geometry::DicomPixelGeometry;
use crate::raster::{Raster, RasterData};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum LayoutError {
    /// Subsampled access requires 3 bands, got {bands}
    InvalidBandCount { bands: u16 },

    /// Band {band} does not exist
    InvalidBand { band: u16 },

    /// Unsupported subsampling factors {x}x{y}
    UnsupportedSubsampling { x: u32, y: u32 },

    /// Subsampled layout requires 8 bits allocated, got {bits_allocated}
    UnsupportedBitDepth { bits_allocated: u16 },

    /// Pixel ({x}, {y}) is outside of a {width}x{height} frame
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    /// Frame holds {actual} bytes, expected {expected}
    FrameLength { expected: usize, actual: usize },

    /// Expected a 3 channel 8-bit raster
    UnsupportedRaster,
}

pub type Result<T, E = LayoutError> = std::result::Result<T, E>;

/// Dimensions of a frame with samples stored at full resolution.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
    pub samples_per_pixel: u16,
    pub bytes_per_sample: usize,
}

impl FrameShape {
    pub fn from_geometry(geometry: &DicomPixelGeometry) -> Self {
        FrameShape {
            width: geometry.width,
            height: geometry.height,
            samples_per_pixel: geometry.samples_per_pixel,
            bytes_per_sample: geometry.bytes_per_sample(),
        }
    }

    #[inline]
    fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn frame_len(&self) -> usize {
        self.pixel_count() * self.samples_per_pixel as usize * self.bytes_per_sample
    }
}

/// The arrangement of samples in a native frame.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelLayout {
    /// samples of each pixel stored next to each other
    Interleaved(FrameShape),
    /// each color plane stored as a separate contiguous block
    Banded(FrameShape),
    /// luma and chroma packed with chroma shared across pixel blocks
    Subsampled(SubsampledLayout),
}

impl PixelLayout {
    /// Choose the layout of the native frames of an image.
    ///
    /// The subsampled layout is only chosen for native
    /// (not encapsulated) pixel data,
    /// since codecs always produce full resolution samples.
    pub fn for_geometry(geometry: &DicomPixelGeometry) -> Result<Self> {
        let shape = FrameShape::from_geometry(geometry);
        if !geometry.is_encapsulated() {
            if let Some((x, y)) = geometry.photometric_interpretation.chroma_subsampling() {
                ensure!(
                    geometry.bits_allocated == 8,
                    UnsupportedBitDepthSnafu {
                        bits_allocated: geometry.bits_allocated
                    }
                );
                return SubsampledLayout::new(geometry.width, geometry.height, x, y)
                    .map(PixelLayout::Subsampled);
            }
        }
        if geometry.planar_configuration && geometry.samples_per_pixel > 1 {
            Ok(PixelLayout::Banded(shape))
        } else {
            Ok(PixelLayout::Interleaved(shape))
        }
    }

    /// The number of bytes of one frame in this layout.
    pub fn frame_len(&self) -> usize {
        match self {
            PixelLayout::Interleaved(shape) | PixelLayout::Banded(shape) => shape.frame_len(),
            PixelLayout::Subsampled(layout) => layout.packed_frame_len(),
        }
    }

    /// The byte offset of the sample of `band` at pixel (`x`, `y`)
    /// from the start of the frame.
    pub fn sample_offset(&self, x: u32, y: u32, band: u16) -> Result<usize> {
        match self {
            PixelLayout::Interleaved(shape) => {
                check_access(shape, x, y, band)?;
                let pixel = y as usize * shape.width as usize + x as usize;
                let sample = pixel * shape.samples_per_pixel as usize + band as usize;
                Ok(sample * shape.bytes_per_sample)
            }
            PixelLayout::Banded(shape) => {
                check_access(shape, x, y, band)?;
                let pixel = y as usize * shape.width as usize + x as usize;
                let sample = band as usize * shape.pixel_count() + pixel;
                Ok(sample * shape.bytes_per_sample)
            }
            PixelLayout::Subsampled(layout) => layout.sample_index(x, y, band),
        }
    }

    /// Rearrange the bytes of a banded frame so that
    /// the samples of each pixel are next to each other.
    /// Frames in other layouts are returned unchanged.
    pub fn to_interleaved(&self, frame: Vec<u8>) -> Result<Vec<u8>> {
        let shape = match self {
            PixelLayout::Banded(shape) => shape,
            _ => return Ok(frame),
        };
        ensure!(
            frame.len() >= shape.frame_len(),
            FrameLengthSnafu {
                expected: shape.frame_len(),
                actual: frame.len()
            }
        );

        let bps = shape.bytes_per_sample;
        let spp = shape.samples_per_pixel as usize;
        let pixels = shape.pixel_count();
        let mut out = vec![0; shape.frame_len()];
        for band in 0..spp {
            let plane = &frame[band * pixels * bps..(band + 1) * pixels * bps];
            for (pixel, sample) in plane.chunks_exact(bps).enumerate() {
                let dst = (pixel * spp + band) * bps;
                out[dst..dst + bps].copy_from_slice(sample);
            }
        }
        Ok(out)
    }
}

fn check_access(shape: &FrameShape, x: u32, y: u32, band: u16) -> Result<()> {
    ensure!(
        x < shape.width && y < shape.height,
        OutOfBoundsSnafu {
            x,
            y,
            width: shape.width,
            height: shape.height
        }
    );
    ensure!(band < shape.samples_per_pixel, InvalidBandSnafu { band });
    Ok(())
}

/// Addressing of chroma subsampled 8-bit frames.
///
/// Computed once per geometry and immutable thereafter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SubsampledLayout {
    width: u32,
    height: u32,
    subsample_x: u32,
    subsample_y: u32,
    /// number of bytes in a chroma-bearing row
    row_len: usize,
    /// number of bytes from one chroma-bearing row to the next
    chroma_row_stride: usize,
}

impl SubsampledLayout {
    /// Create the layout of a `width` by `height` frame
    /// with the given subsampling factors, each either 1 or 2.
    pub fn new(width: u32, height: u32, subsample_x: u32, subsample_y: u32) -> Result<Self> {
        ensure!(
            matches!(subsample_x, 1 | 2) && matches!(subsample_y, 1 | 2),
            UnsupportedSubsamplingSnafu {
                x: subsample_x,
                y: subsample_y
            }
        );
        let blocks = (width as usize + subsample_x as usize - 1) / subsample_x as usize;
        let row_len = blocks * (subsample_x as usize + 2);
        let chroma_row_stride = row_len + (subsample_y as usize - 1) * width as usize;
        Ok(SubsampledLayout {
            width,
            height,
            subsample_x,
            subsample_y,
            row_len,
            chroma_row_stride,
        })
    }

    pub fn subsample_x(&self) -> u32 {
        self.subsample_x
    }

    pub fn subsample_y(&self) -> u32 {
        self.subsample_y
    }

    /// The length of a chroma-bearing packed row in bytes.
    pub fn row_len(&self) -> usize {
        self.row_len
    }

    /// The distance between two consecutive chroma-bearing rows in bytes.
    pub fn chroma_row_stride(&self) -> usize {
        self.chroma_row_stride
    }

    #[inline]
    pub fn is_chroma_row(&self, y: u32) -> bool {
        y % self.subsample_y == 0
    }

    /// The byte offset of the start of row `y`.
    #[inline]
    pub fn row_offset(&self, y: u32) -> usize {
        let group = (y / self.subsample_y) as usize;
        let within = y % self.subsample_y;
        let base = group * self.chroma_row_stride;
        if within == 0 {
            base
        } else {
            base + self.row_len + (within as usize - 1) * self.width as usize
        }
    }

    /// The number of bytes of one packed frame.
    pub fn packed_frame_len(&self) -> usize {
        let h = self.height as usize;
        let sy = self.subsample_y as usize;
        let chroma_rows = (h + sy - 1) / sy;
        chroma_rows * self.row_len + (h - chroma_rows) * self.width as usize
    }

    /// The byte index in the packed frame of the sample of `band`
    /// (0 for luma, 1 for blue chroma, 2 for red chroma)
    /// at pixel (`x`, `y`).
    pub fn sample_index(&self, x: u32, y: u32, band: u16) -> Result<usize> {
        ensure!(
            x < self.width && y < self.height,
            OutOfBoundsSnafu {
                x,
                y,
                width: self.width,
                height: self.height
            }
        );
        ensure!(band < 3, InvalidBandSnafu { band });

        let sx = self.subsample_x as usize;
        let block = (x as usize / sx) * (sx + 2);
        if self.is_chroma_row(y) {
            let block_start = self.row_offset(y) + block;
            Ok(match band {
                0 => block_start + x as usize % sx,
                b => block_start + sx + b as usize - 1,
            })
        } else if band == 0 {
            Ok(self.row_offset(y) + x as usize)
        } else {
            let chroma_y = y - y % self.subsample_y;
            Ok(self.row_offset(chroma_y) + block + sx + band as usize - 1)
        }
    }

    /// Expand a packed frame into an interleaved 3-band raster.
    pub fn unpack(&self, packed: &[u8], bands: u16) -> Result<Raster> {
        ensure!(bands == 3, InvalidBandCountSnafu { bands });
        let expected = self.packed_frame_len();
        ensure!(
            packed.len() >= expected,
            FrameLengthSnafu {
                expected,
                actual: packed.len()
            }
        );

        let mut out = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height {
            for x in 0..self.width {
                for band in 0..3 {
                    out.push(packed[self.sample_index(x, y, band)?]);
                }
            }
        }
        Raster::new(self.width, self.height, 3, RasterData::U8(out))
            .map_err(|_| LayoutError::UnsupportedRaster)
    }

    /// Pack an interleaved 3-band 8-bit raster,
    /// averaging the chroma samples of each block.
    pub fn pack(&self, raster: &Raster) -> Result<Vec<u8>> {
        ensure!(
            raster.channels() == 3,
            InvalidBandCountSnafu {
                bands: raster.channels()
            }
        );
        let samples = match raster.data() {
            RasterData::U8(samples)
                if raster.width() == self.width && raster.height() == self.height =>
            {
                samples
            }
            _ => return UnsupportedRasterSnafu.fail(),
        };
        let at = |x: u32, y: u32, band: usize| {
            u32::from(samples[(y as usize * self.width as usize + x as usize) * 3 + band])
        };

        let mut packed = vec![0; self.packed_frame_len()];
        for y in 0..self.height {
            for x in 0..self.width {
                packed[self.sample_index(x, y, 0)?] = at(x, y, 0) as u8;
            }
        }

        // chroma, one pair per block
        let sx = self.subsample_x;
        let sy = self.subsample_y;
        for y0 in (0..self.height).step_by(sy as usize) {
            for x0 in (0..self.width).step_by(sx as usize) {
                let (mut cb, mut cr, mut n) = (0, 0, 0);
                for y in y0..(y0 + sy).min(self.height) {
                    for x in x0..(x0 + sx).min(self.width) {
                        cb += at(x, y, 1);
                        cr += at(x, y, 2);
                        n += 1;
                    }
                }
                packed[self.sample_index(x0, y0, 1)?] = ((cb + n / 2) / n) as u8;
                packed[self.sample_index(x0, y0, 2)?] = ((cr + n / 2) / n) as u8;
            }
        }
        Ok(packed)
    }
}
