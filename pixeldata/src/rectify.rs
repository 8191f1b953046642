//! Sign alignment of signed samples stored below the container's top bit.
//!
//! Some encoders place an N-bit signed value in the low bits
//! of a wider sample container without extending its sign,
//! so that _High Bit_ + 1 is lower than _Bits Allocated_.
//! [`rectify_signed`] moves the value up
//! so that its sign bit becomes the sign bit of the container.

use crate::raster::{Raster, RasterData};

/// Align the sign bit of signed 16-bit samples with the container's sign bit.
///
/// Samples are shifted left by `bits_allocated - (high_bit + 1)` bits.
/// The raster is returned unchanged (as a copy)
/// when `high_bit + 1 >= bits_allocated`
/// or when it does not hold signed 16-bit samples.
///
/// The function does not record whether it was applied.
/// Applying it a second time shifts the samples again,
/// so callers must keep track of rectified rasters themselves.
///
/// # Example
///
/// ```
/// # use dicom_pixelcore::raster::{Raster, RasterData};
/// # use dicom_pixelcore::rectify::rectify_signed;
/// // 12-bit value -1 stored without sign extension
/// let raster = Raster::new(1, 1, 1, RasterData::I16(vec![0x0FFF])).unwrap();
/// let rectified = rectify_signed(&raster, 11, 16);
/// assert_eq!(rectified.data(), &RasterData::I16(vec![-16]));
/// ```
pub fn rectify_signed(raster: &Raster, high_bit: u16, bits_allocated: u16) -> Raster {
    let shift = match bits_allocated.checked_sub(high_bit.saturating_add(1)) {
        Some(shift) if shift > 0 && shift < 16 => u32::from(shift),
        _ => return raster.clone(),
    };
    match raster.data() {
        RasterData::I16(samples) => {
            let data = samples.iter().map(|v| v.wrapping_shl(shift)).collect();
            let mut out = raster.clone();
            *out.data_mut() = RasterData::I16(data);
            out
        }
        _ => raster.clone(),
    }
}
