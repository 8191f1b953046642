//! Display look-up tables.
//!
//! A [`Lut`] maps every possible stored sample value
//! of a given bit depth to a display value,
//! combining the modality rescale with a VOI transformation,
//! be it a window level or an explicit VOI LUT from the data set.

use snafu::{ensure, OptionExt, Snafu};

use crate::geometry::LutData;
use crate::transform::{Rescale, WindowLevelTransform};

#[derive(Debug, PartialEq, Snafu)]
#[non_exhaustive]
pub enum CreateLutError {
    /// Table entry #{index} maps to {y_value}, out of range for the output type
    OutputRange { index: usize, y_value: f64 },

    /// Tables cover 1 to 16 bits stored, got {bits_stored}
    BitDepth { bits_stored: u16 },
}

/// A look up table from stored sample values to display values.
///
/// # Example
///
/// ```
/// # use dicom_pixelcore::lut::{CreateLutError, Lut};
/// # use dicom_pixelcore::transform::{Rescale, WindowLevel, WindowLevelTransform};
/// let lut: Lut<u16> = Lut::new_rescale_and_window(
///     12,
///     false,
///     Rescale::new(1., -1024.),
///     WindowLevelTransform::linear(WindowLevel {
///         width: 400.,
///         center: 40.,
///     }),
/// )?;
///
/// assert_eq!(lut.get(0_u16), 0);
/// assert_eq!(lut.get(4095_u16), 0xFFFF);
/// # Result::<(), CreateLutError>::Ok(())
/// ```
#[derive(Debug, Clone)]
pub struct Lut<T> {
    /// one entry per stored value, `2^bits_stored` in total
    table: Vec<T>,
    /// upper half of the table holds negative stored values
    signed: bool,
}

impl<T> Lut<T>
where
    T: num_traits::NumCast + Copy,
{
    /// Build a table by evaluating `f` on every value
    /// representable with `bits_stored` bits,
    /// read as two's complement if `signed` is true.
    pub fn new_with_fn(
        bits_stored: u16,
        signed: bool,
        f: impl Fn(f64) -> f64,
    ) -> Result<Self, CreateLutError> {
        ensure!(
            (1..=16).contains(&bits_stored),
            BitDepthSnafu { bits_stored }
        );
        let size = 1_usize << bits_stored;

        let table = (0..size)
            .map(|i| {
                // two's complement for the upper half
                let x = if signed && i >= size / 2 {
                    i as f64 - size as f64
                } else {
                    i as f64
                };
                let value = f(x);
                T::from(value).context(OutputRangeSnafu {
                    index: i,
                    y_value: value,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Lut { table, signed })
    }

    /// Build a table of rescaled values.
    pub fn new_rescale(
        bits_stored: u16,
        signed: bool,
        rescale: Rescale,
    ) -> Result<Self, CreateLutError> {
        Self::new_with_fn(bits_stored, signed, |v| rescale.apply(v))
    }

    /// Build a table of rescaled values passed through a window level.
    ///
    /// Display values range from 0 to `2^n - 1`,
    /// `n` being `bits_stored` rounded up to a power of two, at most 16.
    pub fn new_rescale_and_window(
        bits_stored: u16,
        signed: bool,
        rescale: Rescale,
        voi: WindowLevelTransform,
    ) -> Result<Self, CreateLutError> {
        let y_max = output_max(bits_stored);
        Self::new_with_fn(bits_stored, signed, |v| voi.apply(rescale.apply(v), y_max))
    }

    /// Build a table of rescaled values passed through a VOI LUT.
    ///
    /// Rescaled values outside of the VOI LUT input range
    /// map to its first or last entry.
    /// Entries are scaled to the same output range as
    /// [`new_rescale_and_window`](Lut::new_rescale_and_window).
    pub fn new_rescale_and_voi_lut(
        bits_stored: u16,
        signed: bool,
        rescale: Rescale,
        voi_lut: &LutData,
    ) -> Result<Self, CreateLutError> {
        let y_max = output_max(bits_stored);
        let scale = y_max / f64::from(voi_lut.max_output().max(1));
        Self::new_with_fn(bits_stored, signed, |v| {
            let x = rescale.apply(v).round() as i64;
            (f64::from(voi_lut.lookup(x)) * scale).min(y_max)
        })
    }

    /// The number of entries in the table.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Look up a stored value.
    ///
    /// Signed values are given by their bit pattern,
    /// e.g. `-1_i16 as u16`.
    /// Bits above the bit depth of the table are masked out.
    pub fn get<I>(&self, sample_value: I) -> T
    where
        I: Into<u32>,
    {
        let mask = self.table.len() - 1;
        let index = sample_value.into() as usize & mask;
        self.table[index]
    }

    /// Apply the transformation to a sample value of a decoded raster.
    pub fn get_value(&self, value: f64) -> T {
        let bits = self.table.len().trailing_zeros();
        let index = if self.signed && value < 0. {
            (value as i64 + (1_i64 << bits)) as u32
        } else {
            value as u32
        };
        self.get(index)
    }

    /// Look up every value of an iterator.
    pub fn map_iter<'a, I: 'a>(
        &'a self,
        iter: impl IntoIterator<Item = I> + 'a,
    ) -> impl Iterator<Item = T> + 'a
    where
        I: Into<u32>,
    {
        iter.into_iter().map(move |i| self.get(i))
    }
}

fn output_max(bits_stored: u16) -> f64 {
    let bits = u32::from(bits_stored).next_power_of_two().min(16);
    ((1_u32 << bits) - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{VoiLutFunction, WindowLevel};

    #[test]
    fn lut_signed_numbers() {
        let lut: Lut<i16> = Lut::new_rescale(10, true, Rescale::new(2., -1024.)).unwrap();

        assert_eq!(lut.len(), 1024);
        assert_eq!(lut.get(0_u16), -1024);
        assert_eq!(lut.get(1_u16), -1022);
        assert_eq!(lut.get(-1_i16 as u16), -1026);
        assert_eq!(lut.get(-2_i16 as u16), -1028);
        assert_eq!(lut.get(500_u16), -24);
        assert_eq!(lut.get_value(-2.), -1028);
    }

    #[test]
    fn lut_rescale_and_window_16bit() {
        let lut: Lut<u16> = Lut::new_rescale_and_window(
            16,
            false,
            Rescale::new(1., -1024.),
            WindowLevelTransform::new(
                VoiLutFunction::Linear,
                WindowLevel {
                    width: 300.,
                    center: 50.,
                },
            ),
        )
        .unwrap();

        assert_eq!(lut.get(824_u16), 0);
        assert_eq!(lut.get(1224_u16), 65535);

        let middle = lut.get(1074_u16);
        assert!(
            (32_500..=33_000).contains(&middle),
            "window center mapped to {}",
            middle
        );
    }

    #[test]
    fn lut_out_of_range_output() {
        let err = Lut::<u8>::new_rescale(8, false, Rescale::new(2., 0.)).unwrap_err();
        assert_eq!(
            err,
            CreateLutError::OutputRange {
                index: 128,
                y_value: 256.
            }
        );
    }

    #[test]
    fn lut_bit_depth_out_of_range() {
        assert_eq!(
            Lut::<u16>::new_rescale(0, false, Rescale::default()).unwrap_err(),
            CreateLutError::BitDepth { bits_stored: 0 }
        );
        assert_eq!(
            Lut::<u16>::new_rescale(17, false, Rescale::default()).unwrap_err(),
            CreateLutError::BitDepth { bits_stored: 17 }
        );
    }

    #[test]
    fn lut_through_voi_table() {
        let voi_lut = LutData {
            entry_count: 4,
            first_mapped: 10,
            bits: 8,
            data: vec![0, 85, 170, 255],
            explanation: None,
        };
        let lut: Lut<u8> =
            Lut::new_rescale_and_voi_lut(8, false, Rescale::default(), &voi_lut).unwrap();
        assert_eq!(lut.get(0_u8), 0);
        assert_eq!(lut.get(11_u8), 85);
        assert_eq!(lut.get(12_u8), 170);
        assert_eq!(lut.get(200_u8), 255);
        assert_eq!(
            lut.map_iter([10_u8, 13]).collect::<Vec<_>>(),
            vec![0, 255]
        );
    }
}
