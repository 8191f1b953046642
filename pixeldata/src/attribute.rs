//! Utility module for interpreting the values of key image attributes.
//!
//! The geometry parser hands over raw value fields
//! (already read from the stream, never pixel data)
//! and this module turns them into typed values,
//! taking the value representation and the byte order into account.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use dicom_core::VR;
use snafu::{ensure, OptionExt, Snafu};

#[derive(Debug, Snafu)]
pub enum GetAttributeError {
    #[snafu(display("Missing required attribute `{}`", name))]
    MissingRequiredField { name: &'static str },

    #[snafu(display("Could not read attribute `{}` with VR {:?}", name, vr))]
    UnexpectedVr { name: &'static str, vr: VR },

    #[snafu(display("Semantically invalid value `{}` for attribute `{}`", value, name))]
    InvalidValue { name: &'static str, value: String },
}

pub type Result<T, E = GetAttributeError> = std::result::Result<T, E>;

/// An interpreted representation of the DICOM _Pixel Representation_ attribute.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq, Default)]
pub enum PixelRepresentation {
    /// unsigned pixel data sample values
    #[default]
    Unsigned,
    /// signed pixel data sample values
    Signed,
}

impl PixelRepresentation {
    pub(crate) fn from_value(p: i64) -> Result<Self> {
        match p {
            0 => Ok(PixelRepresentation::Unsigned),
            1 => Ok(PixelRepresentation::Signed),
            _ => InvalidValueSnafu {
                name: "PixelRepresentation",
                value: p.to_string(),
            }
            .fail(),
        }
    }
}

/// An interpreted representation of the DICOM _Photometric Interpretation_ attribute.
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub enum PhotometricInterpretation {
    Monochrome1,
    Monochrome2,
    PaletteColor,
    Rgb,
    YbrFull,
    YbrFull422,
    YbrPartial422,
    YbrPartial420,
    YbrIct,
    YbrRct,
    /// Any other value, kept verbatim
    Other(String),
}

impl PhotometricInterpretation {
    /// Interpret the trimmed attribute text.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "MONOCHROME1" => PhotometricInterpretation::Monochrome1,
            "MONOCHROME2" => PhotometricInterpretation::Monochrome2,
            "PALETTE COLOR" => PhotometricInterpretation::PaletteColor,
            "RGB" => PhotometricInterpretation::Rgb,
            "YBR_FULL" => PhotometricInterpretation::YbrFull,
            "YBR_FULL_422" => PhotometricInterpretation::YbrFull422,
            "YBR_PARTIAL_422" => PhotometricInterpretation::YbrPartial422,
            "YBR_PARTIAL_420" => PhotometricInterpretation::YbrPartial420,
            "YBR_ICT" => PhotometricInterpretation::YbrIct,
            "YBR_RCT" => PhotometricInterpretation::YbrRct,
            other => PhotometricInterpretation::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PhotometricInterpretation::Monochrome1 => "MONOCHROME1",
            PhotometricInterpretation::Monochrome2 => "MONOCHROME2",
            PhotometricInterpretation::PaletteColor => "PALETTE COLOR",
            PhotometricInterpretation::Rgb => "RGB",
            PhotometricInterpretation::YbrFull => "YBR_FULL",
            PhotometricInterpretation::YbrFull422 => "YBR_FULL_422",
            PhotometricInterpretation::YbrPartial422 => "YBR_PARTIAL_422",
            PhotometricInterpretation::YbrPartial420 => "YBR_PARTIAL_420",
            PhotometricInterpretation::YbrIct => "YBR_ICT",
            PhotometricInterpretation::YbrRct => "YBR_RCT",
            PhotometricInterpretation::Other(s) => s,
        }
    }

    pub fn is_monochrome(&self) -> bool {
        matches!(
            self,
            PhotometricInterpretation::Monochrome1 | PhotometricInterpretation::Monochrome2
        )
    }

    pub fn is_palette_color(&self) -> bool {
        matches!(self, PhotometricInterpretation::PaletteColor)
    }

    /// The chroma subsampling factors `(x, y)` implied by the name,
    /// if the interpretation is a subsampled one.
    pub fn chroma_subsampling(&self) -> Option<(u32, u32)> {
        let name = self.as_str();
        if name.ends_with("422") {
            Some((2, 1))
        } else if name.ends_with("420") {
            Some((2, 2))
        } else {
            None
        }
    }
}

impl Default for PhotometricInterpretation {
    fn default() -> Self {
        PhotometricInterpretation::Monochrome2
    }
}

impl std::fmt::Display for PhotometricInterpretation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reads typed values out of raw value fields
/// in the byte order of the data set.
#[derive(Debug, Copy, Clone)]
pub(crate) struct ValueReader {
    big_endian: bool,
}

impl ValueReader {
    pub fn new(big_endian: bool) -> Self {
        ValueReader { big_endian }
    }

    pub fn u16s(&self, bytes: &[u8]) -> Vec<u16> {
        let mut out = vec![0; bytes.len() / 2];
        let bytes = &bytes[..out.len() * 2];
        if self.big_endian {
            BigEndian::read_u16_into(bytes, &mut out);
        } else {
            LittleEndian::read_u16_into(bytes, &mut out);
        }
        out
    }

    fn u32s(&self, bytes: &[u8]) -> Vec<u32> {
        let mut out = vec![0; bytes.len() / 4];
        let bytes = &bytes[..out.len() * 4];
        if self.big_endian {
            BigEndian::read_u32_into(bytes, &mut out);
        } else {
            LittleEndian::read_u32_into(bytes, &mut out);
        }
        out
    }

    /// Read all integer values of a binary or textual integer attribute.
    pub fn ints(&self, vr: VR, bytes: &[u8], name: &'static str) -> Result<Vec<i64>> {
        match vr {
            // implicit VR data sets may report the VR of LUT descriptors
            // and pixel padding values as unknown or ambiguous
            VR::US | VR::OW | VR::UN | VR::OB => {
                Ok(self.u16s(bytes).into_iter().map(i64::from).collect())
            }
            VR::SS => Ok(self
                .u16s(bytes)
                .into_iter()
                .map(|v| i64::from(v as i16))
                .collect()),
            VR::UL => Ok(self.u32s(bytes).into_iter().map(i64::from).collect()),
            VR::SL => Ok(self
                .u32s(bytes)
                .into_iter()
                .map(|v| i64::from(v as i32))
                .collect()),
            VR::IS => text_values(bytes)
                .map(|s| {
                    s.parse::<i64>().ok().context(InvalidValueSnafu {
                        name,
                        value: s.to_string(),
                    })
                })
                .collect(),
            _ => UnexpectedVrSnafu { name, vr }.fail(),
        }
    }

    /// Read the first integer value of an attribute.
    pub fn int(&self, vr: VR, bytes: &[u8], name: &'static str) -> Result<i64> {
        self.ints(vr, bytes, name)?
            .first()
            .copied()
            .context(MissingRequiredFieldSnafu { name })
    }

    /// Read all numeric values of a decimal or floating point attribute.
    pub fn floats(&self, vr: VR, bytes: &[u8], name: &'static str) -> Result<Vec<f64>> {
        match vr {
            VR::DS | VR::IS => text_values(bytes)
                .map(|s| {
                    s.parse::<f64>().ok().context(InvalidValueSnafu {
                        name,
                        value: s.to_string(),
                    })
                })
                .collect(),
            VR::FD => Ok(bytes
                .chunks_exact(8)
                .map(|c| {
                    if self.big_endian {
                        BigEndian::read_f64(c)
                    } else {
                        LittleEndian::read_f64(c)
                    }
                })
                .collect()),
            VR::FL => Ok(bytes
                .chunks_exact(4)
                .map(|c| {
                    f64::from(if self.big_endian {
                        BigEndian::read_f32(c)
                    } else {
                        LittleEndian::read_f32(c)
                    })
                })
                .collect()),
            _ => UnexpectedVrSnafu { name, vr }.fail(),
        }
    }
}

/// Decode a textual value field, removing the padding.
pub(crate) fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

/// Split a textual value field into its trimmed, non-empty values.
fn text_values(bytes: &[u8]) -> impl Iterator<Item = &str> {
    std::str::from_utf8(bytes)
        .unwrap_or("")
        .split('\\')
        .map(|s| s.trim_matches(|c: char| c == ' ' || c == '\0'))
        .filter(|s| !s.is_empty())
}

/// Check that a required dimension is present and not zero.
pub(crate) fn require_dimension(value: Option<u32>, name: &'static str) -> Result<u32> {
    let value = value.context(MissingRequiredFieldSnafu { name })?;
    ensure!(
        value > 0,
        InvalidValueSnafu {
            name,
            value: value.to_string(),
        }
    );
    Ok(value)
}
