//! Decoded pixel rasters.
//!
//! A [`Raster`] is the in-memory result of decoding one frame:
//! row-major, channel-interleaved samples of a single numeric type.
//! Every other module of this crate produces or consumes rasters,
//! including the raw cache, which persists them verbatim.

use byteorder::{ByteOrder, LittleEndian};
use snafu::{ensure, Snafu};

/// The numeric type of the samples held by a [`Raster`].
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub enum SampleType {
    /// unsigned 8-bit samples
    U8,
    /// unsigned 16-bit samples
    U16,
    /// signed 16-bit samples
    I16,
    /// signed 32-bit samples
    I32,
    /// single precision floating point samples
    F32,
    /// double precision floating point samples
    F64,
}

impl SampleType {
    /// The size of one sample in bytes.
    pub fn size(self) -> usize {
        match self {
            SampleType::U8 => 1,
            SampleType::U16 | SampleType::I16 => 2,
            SampleType::I32 | SampleType::F32 => 4,
            SampleType::F64 => 8,
        }
    }
}

/// The raster could not be created from the given parts.
#[derive(Debug, Snafu)]
pub enum RasterError {
    /// Sample buffer holds {actual} samples, expected {expected}
    SampleCount { expected: usize, actual: usize },

    /// Row {row} is out of bounds for a raster of height {height}
    RowOutOfBounds { row: u32, height: u32 },

    /// Operation requires a single channel raster, got {channels}
    NotSingleChannel { channels: u16 },
}

/// Typed sample storage of a [`Raster`].
#[derive(Debug, Clone, PartialEq)]
pub enum RasterData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl RasterData {
    /// Allocate zeroed storage of the given type.
    pub fn zeroed(sample_type: SampleType, len: usize) -> Self {
        match sample_type {
            SampleType::U8 => RasterData::U8(vec![0; len]),
            SampleType::U16 => RasterData::U16(vec![0; len]),
            SampleType::I16 => RasterData::I16(vec![0; len]),
            SampleType::I32 => RasterData::I32(vec![0; len]),
            SampleType::F32 => RasterData::F32(vec![0.; len]),
            SampleType::F64 => RasterData::F64(vec![0.; len]),
        }
    }

    /// Read samples of the given type from little endian bytes.
    /// Trailing bytes which do not form a whole sample are ignored.
    pub fn from_le_bytes(sample_type: SampleType, bytes: &[u8]) -> Self {
        let len = bytes.len() / sample_type.size();
        let bytes = &bytes[..len * sample_type.size()];
        match sample_type {
            SampleType::U8 => RasterData::U8(bytes.to_vec()),
            SampleType::U16 => {
                let mut out = vec![0; len];
                LittleEndian::read_u16_into(bytes, &mut out);
                RasterData::U16(out)
            }
            SampleType::I16 => {
                let mut out = vec![0; len];
                LittleEndian::read_i16_into(bytes, &mut out);
                RasterData::I16(out)
            }
            SampleType::I32 => {
                let mut out = vec![0; len];
                LittleEndian::read_i32_into(bytes, &mut out);
                RasterData::I32(out)
            }
            SampleType::F32 => {
                let mut out = vec![0.; len];
                LittleEndian::read_f32_into(bytes, &mut out);
                RasterData::F32(out)
            }
            SampleType::F64 => {
                let mut out = vec![0.; len];
                LittleEndian::read_f64_into(bytes, &mut out);
                RasterData::F64(out)
            }
        }
    }

    pub fn sample_type(&self) -> SampleType {
        match self {
            RasterData::U8(_) => SampleType::U8,
            RasterData::U16(_) => SampleType::U16,
            RasterData::I16(_) => SampleType::I16,
            RasterData::I32(_) => SampleType::I32,
            RasterData::F32(_) => SampleType::F32,
            RasterData::F64(_) => SampleType::F64,
        }
    }

    /// The number of samples.
    pub fn len(&self) -> usize {
        match self {
            RasterData::U8(v) => v.len(),
            RasterData::U16(v) => v.len(),
            RasterData::I16(v) => v.len(),
            RasterData::I32(v) => v.len(),
            RasterData::F32(v) => v.len(),
            RasterData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the sample at index `i` as a double precision value.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of bounds.
    #[inline]
    pub fn get_f64(&self, i: usize) -> f64 {
        match self {
            RasterData::U8(v) => f64::from(v[i]),
            RasterData::U16(v) => f64::from(v[i]),
            RasterData::I16(v) => f64::from(v[i]),
            RasterData::I32(v) => f64::from(v[i]),
            RasterData::F32(v) => f64::from(v[i]),
            RasterData::F64(v) => v[i],
        }
    }

    /// Append the little endian encoding of the samples in `range` to `out`.
    pub fn write_le_range(&self, range: std::ops::Range<usize>, out: &mut Vec<u8>) {
        let start = out.len();
        let size = self.sample_type().size();
        out.resize(start + range.len() * size, 0);
        let dst = &mut out[start..];
        match self {
            RasterData::U8(v) => dst.copy_from_slice(&v[range]),
            RasterData::U16(v) => LittleEndian::write_u16_into(&v[range], dst),
            RasterData::I16(v) => LittleEndian::write_i16_into(&v[range], dst),
            RasterData::I32(v) => LittleEndian::write_i32_into(&v[range], dst),
            RasterData::F32(v) => LittleEndian::write_f32_into(&v[range], dst),
            RasterData::F64(v) => LittleEndian::write_f64_into(&v[range], dst),
        }
    }
}

/// A decoded image frame.
///
/// Samples are stored row after row,
/// with the channels of each pixel next to each other.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    width: u32,
    height: u32,
    channels: u16,
    data: RasterData,
}

impl Raster {
    /// Create a raster, checking that the sample count
    /// matches `width * height * channels`.
    pub fn new(width: u32, height: u32, channels: u16, data: RasterData) -> Result<Self, RasterError> {
        let expected = width as usize * height as usize * channels as usize;
        ensure!(
            data.len() == expected,
            SampleCountSnafu {
                expected,
                actual: data.len(),
            }
        );
        Ok(Raster {
            width,
            height,
            channels,
            data,
        })
    }

    /// Create a zero-filled raster.
    pub fn zeroed(width: u32, height: u32, channels: u16, sample_type: SampleType) -> Self {
        let len = width as usize * height as usize * channels as usize;
        Raster {
            width,
            height,
            channels,
            data: RasterData::zeroed(sample_type, len),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// The number of samples per pixel.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_type(&self) -> SampleType {
        self.data.sample_type()
    }

    pub fn data(&self) -> &RasterData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut RasterData {
        &mut self.data
    }

    pub fn into_data(self) -> RasterData {
        self.data
    }

    /// The number of samples in one row.
    #[inline]
    pub fn row_len(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    /// Get a sample value as a double precision number.
    ///
    /// # Panics
    ///
    /// Panics if the coordinates are out of bounds.
    #[inline]
    pub fn sample_f64(&self, x: u32, y: u32, channel: u16) -> f64 {
        assert!(x < self.width && y < self.height && channel < self.channels);
        let i = y as usize * self.row_len() + x as usize * self.channels as usize + channel as usize;
        self.data.get_f64(i)
    }

    /// Encode row `row` as little endian bytes.
    pub fn row_le_bytes(&self, row: u32) -> Result<Vec<u8>, RasterError> {
        ensure!(
            row < self.height,
            RowOutOfBoundsSnafu {
                row,
                height: self.height
            }
        );
        let len = self.row_len();
        let start = row as usize * len;
        let mut out = Vec::with_capacity(len * self.sample_type().size());
        self.data.write_le_range(start..start + len, &mut out);
        Ok(out)
    }

    /// Encode all samples as little endian bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() * self.sample_type().size());
        self.data.write_le_range(0..self.data.len(), &mut out);
        out
    }

    /// Expand a single channel raster of palette indices
    /// into an RGB raster.
    pub fn apply_palette(&self, palette: &crate::codec::Palette) -> Result<Raster, RasterError> {
        ensure!(
            self.channels == 1,
            NotSingleChannelSnafu {
                channels: self.channels
            }
        );
        let len = self.data.len();
        let data = if palette.is_8bit() {
            let mut out = Vec::with_capacity(len * 3);
            for i in 0..len {
                let [r, g, b] = palette.lookup(self.data.get_f64(i) as i64);
                out.extend_from_slice(&[r as u8, g as u8, b as u8]);
            }
            RasterData::U8(out)
        } else {
            let mut out = Vec::with_capacity(len * 3);
            for i in 0..len {
                out.extend_from_slice(&palette.lookup(self.data.get_f64(i) as i64));
            }
            RasterData::U16(out)
        };
        Ok(Raster {
            width: self.width,
            height: self.height,
            channels: 3,
            data,
        })
    }

    /// Convert the raster into an array of shape `(rows, columns, channels)`.
    #[cfg(feature = "ndarray")]
    pub fn to_ndarray<T>(&self) -> Option<ndarray::Array3<T>>
    where
        T: num_traits::NumCast,
    {
        let shape = (
            self.height as usize,
            self.width as usize,
            self.channels as usize,
        );
        let values: Option<Vec<T>> = (0..self.data.len())
            .map(|i| T::from(self.data.get_f64(i)))
            .collect();
        ndarray::Array3::from_shape_vec(shape, values?).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raster_checks_sample_count() {
        let err = Raster::new(2, 2, 3, RasterData::U8(vec![0; 11])).unwrap_err();
        assert!(matches!(
            err,
            RasterError::SampleCount {
                expected: 12,
                actual: 11
            }
        ));
        assert!(Raster::new(2, 2, 3, RasterData::U8(vec![0; 12])).is_ok());
    }

    #[test]
    fn row_bytes_are_little_endian() {
        let raster = Raster::new(2, 2, 1, RasterData::U16(vec![0x0102, 0x0304, 0x0506, 0x0708])).unwrap();
        assert_eq!(raster.row_le_bytes(1).unwrap(), vec![0x06, 0x05, 0x08, 0x07]);
        assert!(raster.row_le_bytes(2).is_err());
        assert_eq!(
            raster.to_le_bytes(),
            vec![0x02, 0x01, 0x04, 0x03, 0x06, 0x05, 0x08, 0x07]
        );
    }

    #[test]
    fn sample_lookup_by_coordinates() {
        let raster = Raster::new(2, 1, 3, RasterData::I16(vec![1, 2, 3, -4, -5, -6])).unwrap();
        assert_eq!(raster.sample_f64(1, 0, 0), -4.);
        assert_eq!(raster.sample_f64(0, 0, 2), 3.);
    }
}
