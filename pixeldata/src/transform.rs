//! Pixel sample value transformation functions:
//! the modality rescale and the window level VOI functions.

use snafu::Snafu;

/// Modality rescale: `slope * stored + intercept`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Rescale {
    /// the rescale slope
    pub slope: f64,
    /// the rescale intercept
    pub intercept: f64,
}

impl Default for Rescale {
    fn default() -> Self {
        Rescale::new(1., 0.)
    }
}

impl Rescale {
    #[inline]
    pub fn new(slope: f64, intercept: f64) -> Self {
        Rescale { slope, intercept }
    }

    #[inline]
    pub fn apply(&self, value: f64) -> f64 {
        self.slope * value + self.intercept
    }

    /// Whether the function leaves every value unchanged.
    pub fn is_identity(&self) -> bool {
        self.slope == 1. && self.intercept == 0.
    }

    /// Map the range of stored values `[min, max]` to the rescaled range,
    /// keeping the output ordered when the slope is negative.
    pub fn apply_range(&self, min: f64, max: f64) -> (f64, f64) {
        let (a, b) = (self.apply(min), self.apply(max));
        if self.slope < 0. {
            (b, a)
        } else {
            (a, b)
        }
    }
}

/// The _VOI LUT Function_ applied with a window level.
#[derive(Debug, Copy, Clone, Default, Eq, Hash, PartialEq)]
pub enum VoiLutFunction {
    /// LINEAR
    #[default]
    Linear,
    /// LINEAR_EXACT
    LinearExact,
    /// SIGMOID
    Sigmoid,
}

/// Unrecognized VOI LUT function name
#[derive(Debug, Copy, Clone, PartialEq, Snafu)]
pub struct FromVoiLutFunctionError {
    _private: (),
}

impl TryFrom<&str> for VoiLutFunction {
    type Error = FromVoiLutFunctionError;

    /// Parse the function name,
    /// ignoring the padding of the attribute value.
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.trim_matches(|c: char| c == ' ' || c == '\0') {
            "LINEAR" => Ok(Self::Linear),
            "LINEAR_EXACT" => Ok(Self::LinearExact),
            "SIGMOID" => Ok(Self::Sigmoid),
            _ => Err(FromVoiLutFunctionError { _private: () }),
        }
    }
}

impl VoiLutFunction {
    /// The defined term of the function.
    pub fn as_str(self) -> &'static str {
        match self {
            VoiLutFunction::Linear => "LINEAR",
            VoiLutFunction::LinearExact => "LINEAR_EXACT",
            VoiLutFunction::Sigmoid => "SIGMOID",
        }
    }

    /// The smallest window width accepted by the function.
    fn min_width(self) -> f64 {
        match self {
            VoiLutFunction::LinearExact => 0.,
            VoiLutFunction::Linear | VoiLutFunction::Sigmoid => 1.,
        }
    }
}

impl std::fmt::Display for VoiLutFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A window center and width pair.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct WindowLevel {
    pub width: f64,
    pub center: f64,
}

impl WindowLevel {
    /// The window covering the closed range `[min, max]`.
    ///
    /// The width is never lower than 1,
    /// so that a flat image still gets a usable window.
    pub fn from_range(min: f64, max: f64) -> Self {
        WindowLevel {
            center: (min + max) / 2.,
            width: (max - min).max(1.),
        }
    }

    /// The lowest and highest values inside the window.
    pub fn bounds(&self) -> (f64, f64) {
        (
            self.center - self.width / 2.,
            self.center + self.width / 2.,
        )
    }
}

/// A window level together with the function mapping values through it.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct WindowLevelTransform {
    voi_lut_function: VoiLutFunction,
    window_level: WindowLevel,
}

impl WindowLevelTransform {
    /// Widths below the minimum of the function are raised to it:
    /// 0 for [`LinearExact`](VoiLutFunction::LinearExact), 1 otherwise.
    #[inline]
    pub fn new(voi_lut_function: VoiLutFunction, window_level: WindowLevel) -> Self {
        WindowLevelTransform {
            voi_lut_function,
            window_level: WindowLevel {
                center: window_level.center,
                width: window_level.width.max(voi_lut_function.min_width()),
            },
        }
    }

    #[inline]
    pub fn linear(window_level: WindowLevel) -> Self {
        Self::new(VoiLutFunction::Linear, window_level)
    }

    pub fn function(&self) -> VoiLutFunction {
        self.voi_lut_function
    }

    pub fn window_level(&self) -> WindowLevel {
        self.window_level
    }

    /// Map a rescaled value to the display range `[0, y_max]`.
    pub fn apply(&self, value: f64, y_max: f64) -> f64 {
        let WindowLevel { width, center } = self.window_level;
        match self.voi_lut_function {
            VoiLutFunction::Linear => window_level_linear(value, width, center, y_max),
            VoiLutFunction::LinearExact => window_level_linear_exact(value, width, center, y_max),
            VoiLutFunction::Sigmoid => window_level_sigmoid(value, width, center, y_max),
        }
    }
}

fn window_level_linear(value: f64, width: f64, center: f64, y_max: f64) -> f64 {
    debug_assert!(width >= 1.);

    // C.11.2.1.2.1
    let min = center - (width - 1.) / 2.;
    let max = center - 0.5 + (width - 1.) / 2.;

    if value <= min {
        0.
    } else if value > max || width <= 1. {
        y_max
    } else {
        ((value - (center - 0.5)) / (width - 1.) + 0.5) * y_max
    }
}

fn window_level_linear_exact(value: f64, width: f64, center: f64, y_max: f64) -> f64 {
    debug_assert!(width >= 0.);

    // C.11.2.1.3.2
    let min = center - width / 2.;
    let max = center + width / 2.;

    if value <= min {
        0.
    } else if value > max {
        y_max
    } else {
        ((value - center) / width + 0.5) * y_max
    }
}

fn window_level_sigmoid(value: f64, width: f64, center: f64, y_max: f64) -> f64 {
    debug_assert!(width >= 1.);

    // C.11.2.1.3.1
    y_max / (1. + f64::exp(-4. * (value - center) / width))
}
