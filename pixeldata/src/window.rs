//! Display window resolution.
//!
//! The [`WindowCalculator`] resolves the window of a frame
//! from the first source available, in this order:
//!
//! 1. an explicit VOI LUT applicable to the frame,
//! 2. explicit _Window Center_ and _Window Width_ values,
//! 3. the range of the decoded samples, after the modality rescale.
//!
//! Presentation state values given through [`WindowOverrides`]
//! take precedence over those of the data set at each step.

use snafu::{OptionExt, ResultExt, Snafu};
use tracing::debug;

use crate::geometry::{DicomPixelGeometry, LutData};
use crate::lut::{CreateLutError, Lut};
use crate::raster::Raster;
use crate::transform::{Rescale, VoiLutFunction, WindowLevel, WindowLevelTransform};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum WindowError {
    /// No explicit window, and no decoded raster to compute one from
    MissingRaster,

    /// Region of interest does not contain any sample to compute a window from
    EmptyRegion,

    /// Cannot build a display LUT for {bits} bits stored
    LutDepth { bits: u16 },

    /// Could not build display LUT
    CreateLut { source: CreateLutError },
}

pub type Result<T, E = WindowError> = std::result::Result<T, E>;

/// Where a window came from.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub enum WindowSource {
    /// an explicit VOI LUT
    VoiLut,
    /// explicit window center and width values
    Explicit,
    /// computed from the sample values
    Auto,
}

/// A rectangular region of interest in pixel coordinates.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A resolved display window.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub center: f64,
    pub width: f64,
    /// whether the window was computed from the sample values
    pub is_auto: bool,
    pub source: WindowSource,
    /// the VOI LUT function to use with the window
    pub function: VoiLutFunction,
    /// the VOI LUT the window was derived from, if any
    pub lut: Option<LutData>,
    /// the modality rescale in effect for the frame
    pub rescale: Rescale,
}

impl Window {
    pub fn window_level(&self) -> WindowLevel {
        WindowLevel {
            center: self.center,
            width: self.width,
        }
    }

    /// Build a display LUT for the stored values of the given geometry.
    ///
    /// Output values span `0..=2^n - 1`,
    /// `n` being the power of two following _Bits Stored_.
    pub fn to_lut<T>(&self, geometry: &DicomPixelGeometry) -> Result<Lut<T>>
    where
        T: num_traits::NumCast + Copy,
    {
        let bits = geometry.bits_stored;
        if bits == 0 || bits > 16 {
            return LutDepthSnafu { bits }.fail();
        }
        let signed = geometry.is_signed();
        match &self.lut {
            Some(lut) => Lut::new_rescale_and_voi_lut(bits, signed, self.rescale, lut),
            None => Lut::new_rescale_and_window(
                bits,
                signed,
                self.rescale,
                WindowLevelTransform::new(self.function, self.window_level()),
            ),
        }
        .context(CreateLutSnafu)
    }
}

/// Presentation state values taking precedence over the data set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowOverrides {
    pub voi_lut: Option<LutData>,
    pub center: Option<f64>,
    pub width: Option<f64>,
    pub function: Option<VoiLutFunction>,
    /// restrict automatic windowing to this region
    pub region: Option<Region>,
}

/// Resolves display windows,
/// keeping the last automatically computed one for readback.
#[derive(Debug, Clone, Default)]
pub struct WindowCalculator {
    auto: Option<Window>,
}

impl WindowCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last window computed from sample values, if any.
    ///
    /// It only changes on the next call to
    /// [`compute_window`](Self::compute_window)
    /// or [`compute_auto_window`](Self::compute_auto_window)
    /// which computes one.
    pub fn auto_window(&self) -> Option<&Window> {
        self.auto.as_ref()
    }

    /// Resolve the window of a frame.
    ///
    /// `raster` is only needed when there is no explicit window,
    /// and should be the decoded (and rectified) frame.
    pub fn compute_window(
        &mut self,
        geometry: &DicomPixelGeometry,
        frame: u32,
        raster: Option<&Raster>,
        overrides: &WindowOverrides,
    ) -> Result<Window> {
        let rescale = rescale_for_frame(geometry, frame);
        let function = overrides.function.or_else(|| {
            geometry
                .window
                .levels_for_frame(frame)
                .find_map(|level| level.function)
        });

        let voi_lut = overrides.voi_lut.as_ref().or_else(|| {
            geometry
                .window
                .levels_for_frame(frame)
                .find_map(|level| level.luts.first())
        });
        if let Some(lut) = voi_lut {
            debug!("Frame #{} windowed through VOI LUT {:?}", frame, lut.explanation);
            return Ok(Window {
                center: lut.first_mapped as f64 + f64::from(lut.entry_count) / 2.,
                width: f64::from(lut.entry_count),
                is_auto: false,
                source: WindowSource::VoiLut,
                function: function.unwrap_or_default(),
                lut: Some(lut.clone()),
                rescale,
            });
        }

        let explicit = match (overrides.center, overrides.width) {
            (Some(center), Some(width)) => Some((center, width)),
            _ => geometry
                .window
                .levels_for_frame(frame)
                .find_map(|level| level.first_window()),
        };
        if let Some((center, width)) = explicit {
            return Ok(Window {
                center,
                width,
                is_auto: false,
                source: WindowSource::Explicit,
                function: function.unwrap_or_default(),
                lut: None,
                rescale,
            });
        }

        let raster = raster.context(MissingRasterSnafu)?;
        let mut window = self.compute_auto_window(geometry, frame, raster, overrides.region)?;
        if let Some(function) = function {
            window.function = function;
            self.auto = Some(window.clone());
        }
        Ok(window)
    }

    /// Compute a window from the range of the rescaled sample values,
    /// ignoring any explicit window.
    ///
    /// Samples equal to the pixel padding value are left out.
    pub fn compute_auto_window(
        &mut self,
        geometry: &DicomPixelGeometry,
        frame: u32,
        raster: &Raster,
        region: Option<Region>,
    ) -> Result<Window> {
        let (min, max) =
            sample_range(raster, region, geometry.pixel_padding_value).context(EmptyRegionSnafu)?;
        let rescale = rescale_for_frame(geometry, frame);
        let (min, max) = rescale.apply_range(min, max);
        let level = WindowLevel::from_range(min, max);
        debug!(
            "Automatic window for frame #{}: center {}, width {}",
            frame, level.center, level.width
        );

        let window = Window {
            center: level.center,
            width: level.width,
            is_auto: true,
            source: WindowSource::Auto,
            function: VoiLutFunction::default(),
            lut: None,
            rescale,
        };
        self.auto = Some(window.clone());
        Ok(window)
    }
}

/// The modality rescale of a frame,
/// preferring the one of its functional groups.
pub fn rescale_for_frame(geometry: &DicomPixelGeometry, frame: u32) -> Rescale {
    let window = &geometry.window;
    window
        .per_frame
        .get(frame as usize)
        .and_then(Option::as_ref)
        .and_then(|level| level.rescale)
        .or_else(|| window.shared.as_ref().and_then(|level| level.rescale))
        .unwrap_or(geometry.rescale)
}

/// Minimum and maximum stored value in the region,
/// or `None` if there is no sample to look at.
fn sample_range(raster: &Raster, region: Option<Region>, padding: Option<i64>) -> Option<(f64, f64)> {
    let (x0, y0, x1, y1) = match region {
        Some(r) => (
            r.x.min(raster.width()),
            r.y.min(raster.height()),
            r.x.saturating_add(r.width).min(raster.width()),
            r.y.saturating_add(r.height).min(raster.height()),
        ),
        None => (0, 0, raster.width(), raster.height()),
    };
    let padding = padding.map(|p| p as f64);

    let mut range: Option<(f64, f64)> = None;
    for y in y0..y1 {
        for x in x0..x1 {
            for c in 0..raster.channels() {
                let v = raster.sample_f64(x, y, c);
                if Some(v) == padding {
                    continue;
                }
                range = Some(match range {
                    Some((min, max)) => (min.min(v), max.max(v)),
                    None => (v, v),
                });
            }
        }
    }
    range
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::VoiAttributes;
    use crate::raster::RasterData;

    fn mono(values: Vec<u16>, width: u32) -> Raster {
        let height = values.len() as u32 / width;
        Raster::new(width, height, 1, RasterData::U16(values)).unwrap()
    }

    fn geometry() -> DicomPixelGeometry {
        DicomPixelGeometry {
            width: 2,
            height: 2,
            bits_allocated: 16,
            bits_stored: 12,
            high_bit: 11,
            ..Default::default()
        }
    }

    #[test]
    fn auto_window_from_min_max() {
        let raster = mono(vec![100, 2000, 4000, 150], 2);
        let mut calculator = WindowCalculator::new();
        assert!(calculator.auto_window().is_none());

        let window = calculator
            .compute_window(&geometry(), 0, Some(&raster), &WindowOverrides::default())
            .unwrap();
        assert_eq!(window.center, 2050.);
        assert_eq!(window.width, 3900.);
        assert!(window.is_auto);
        assert_eq!(window.source, WindowSource::Auto);
        assert_eq!(calculator.auto_window(), Some(&window));
    }

    #[test]
    fn flat_image_gets_unit_width() {
        let raster = mono(vec![42; 4], 2);
        let mut calculator = WindowCalculator::new();
        let window = calculator
            .compute_auto_window(&geometry(), 0, &raster, None)
            .unwrap();
        assert_eq!(window.center, 42.);
        assert_eq!(window.width, 1.);
    }

    #[test]
    fn auto_window_honors_rescale_padding_and_region() {
        let mut geometry = geometry();
        geometry.rescale = Rescale::new(-1., 0.);
        geometry.pixel_padding_value = Some(0);
        let raster = mono(vec![0, 10, 30, 1000], 2);

        let mut calculator = WindowCalculator::new();
        let window = calculator
            .compute_auto_window(&geometry, 0, &raster, None)
            .unwrap();
        // rescaled range [-1000, -10]
        assert_eq!(window.center, -505.);
        assert_eq!(window.width, 990.);

        let region = Region {
            x: 0,
            y: 0,
            width: 2,
            height: 1,
        };
        let window = calculator
            .compute_auto_window(&geometry, 0, &raster, Some(region))
            .unwrap();
        assert_eq!(window.center, -10.);
        assert_eq!(window.width, 1.);

        let padding_only = Region {
            x: 0,
            y: 0,
            width: 1,
            height: 1,
        };
        assert!(matches!(
            calculator.compute_auto_window(&geometry, 0, &raster, Some(padding_only)),
            Err(WindowError::EmptyRegion)
        ));
        // the last successful computation is kept
        assert_eq!(calculator.auto_window().map(|w| w.center), Some(-10.));
    }

    #[test]
    fn explicit_window_takes_precedence_over_auto() {
        let mut geometry = geometry();
        geometry.window.dataset = VoiAttributes {
            centers: vec![40., 300.],
            widths: vec![400., 1500.],
            function: Some(VoiLutFunction::Sigmoid),
            ..Default::default()
        };
        let mut calculator = WindowCalculator::new();
        let window = calculator
            .compute_window(&geometry, 0, None, &WindowOverrides::default())
            .unwrap();
        assert_eq!((window.center, window.width), (40., 400.));
        assert_eq!(window.function, VoiLutFunction::Sigmoid);
        assert!(!window.is_auto);
        assert!(calculator.auto_window().is_none());

        let overrides = WindowOverrides {
            center: Some(10.),
            width: Some(20.),
            function: Some(VoiLutFunction::Linear),
            ..Default::default()
        };
        let window = calculator
            .compute_window(&geometry, 0, None, &overrides)
            .unwrap();
        assert_eq!((window.center, window.width), (10., 20.));
        assert_eq!(window.function, VoiLutFunction::Linear);
    }

    #[test]
    fn per_frame_window_is_most_specific() {
        let mut geometry = geometry();
        geometry.frame_count = 2;
        geometry.window.dataset.centers = vec![1.];
        geometry.window.dataset.widths = vec![2.];
        geometry.window.shared = Some(VoiAttributes {
            centers: vec![3.],
            widths: vec![4.],
            ..Default::default()
        });
        geometry.window.per_frame = vec![
            None,
            Some(VoiAttributes {
                centers: vec![5.],
                widths: vec![6.],
                rescale: Some(Rescale::new(2., 1.)),
                ..Default::default()
            }),
        ];

        let mut calculator = WindowCalculator::new();
        let overrides = WindowOverrides::default();
        let w0 = calculator.compute_window(&geometry, 0, None, &overrides).unwrap();
        assert_eq!((w0.center, w0.width), (3., 4.));
        assert_eq!(w0.rescale, Rescale::default());
        let w1 = calculator.compute_window(&geometry, 1, None, &overrides).unwrap();
        assert_eq!((w1.center, w1.width), (5., 6.));
        assert_eq!(w1.rescale, Rescale::new(2., 1.));
    }

    #[test]
    fn voi_lut_comes_first() {
        let lut = LutData {
            entry_count: 4096,
            first_mapped: -1024,
            bits: 12,
            data: vec![0; 4096],
            explanation: Some("SOFT TISSUE".into()),
        };
        let mut geometry = geometry();
        geometry.window.dataset.centers = vec![40.];
        geometry.window.dataset.widths = vec![400.];
        geometry.window.dataset.luts = vec![lut.clone()];

        let mut calculator = WindowCalculator::new();
        let window = calculator
            .compute_window(&geometry, 0, None, &WindowOverrides::default())
            .unwrap();
        assert_eq!(window.source, WindowSource::VoiLut);
        assert_eq!(window.width, 4096.);
        assert_eq!(window.center, -1024. + 2048.);
        assert_eq!(window.lut.as_ref(), Some(&lut));

        let lut: Lut<u16> = window.to_lut(&geometry).unwrap();
        assert_eq!(lut.len(), 4096);
    }

    #[test]
    fn missing_raster_without_explicit_window() {
        let mut calculator = WindowCalculator::new();
        assert!(matches!(
            calculator.compute_window(&geometry(), 0, None, &WindowOverrides::default()),
            Err(WindowError::MissingRaster)
        ));
    }

    #[test]
    fn window_lut_for_display() {
        let window = Window {
            center: 2048.,
            width: 4096.,
            is_auto: false,
            source: WindowSource::Explicit,
            function: VoiLutFunction::Linear,
            lut: None,
            rescale: Rescale::default(),
        };
        let lut: Lut<u16> = window.to_lut(&geometry()).unwrap();
        assert_eq!(lut.get(0_u16), 0);
        assert_eq!(lut.get(4095_u16), 0xFFFF);

        let mut deep = geometry();
        deep.bits_stored = 32;
        assert!(matches!(
            window.to_lut::<u16>(&deep),
            Err(WindowError::LutDepth { bits: 32 })
        ));
    }
}
