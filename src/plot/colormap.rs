//! Colour maps and value normalisation for heat maps.

use plotters::style::RGBColor;

/// Anchors sampled at eleven evenly spaced points.
const INFERNO: [(u8, u8, u8); 11] = [
    (0, 0, 4),
    (22, 11, 57),
    (66, 10, 104),
    (106, 23, 110),
    (147, 38, 103),
    (188, 55, 84),
    (221, 81, 58),
    (243, 120, 25),
    (252, 165, 10),
    (246, 215, 70),
    (252, 255, 164),
];

/// Diverging blue, white, red.
const SEISMIC: [(u8, u8, u8); 5] = [(0, 0, 76), (0, 0, 255), (255, 255, 255), (255, 0, 0), (128, 0, 0)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colormap {
    Inferno,
    Seismic,
}

impl Colormap {
    fn anchors(self) -> &'static [(u8, u8, u8)] {
        match self {
            Colormap::Inferno => &INFERNO,
            Colormap::Seismic => &SEISMIC,
        }
    }

    /// Colour at `u` in [0, 1], clamped.
    pub fn color(self, u: f64) -> RGBColor {
        let anchors = self.anchors();
        let u = if u.is_nan() { 0.0 } else { u.clamp(0.0, 1.0) };
        let pos = u * (anchors.len() - 1) as f64;
        let lo = (pos.floor() as usize).min(anchors.len() - 2);
        let f = pos - lo as f64;
        let (a, b) = (anchors[lo], anchors[lo + 1]);
        let mix = |x: u8, y: u8| (x as f64 + (y as f64 - x as f64) * f).round() as u8;
        RGBColor(mix(a.0, b.0), mix(a.1, b.1), mix(a.2, b.2))
    }
}

/// Maps data values onto [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Norm {
    Linear { lo: f64, hi: f64 },
    /// Both bounds must be positive.
    Log { lo: f64, hi: f64 },
}

impl Norm {
    pub fn unit(&self, x: f64) -> f64 {
        let u = match *self {
            Norm::Linear { lo, hi } => (x - lo) / (hi - lo),
            Norm::Log { lo, hi } => (x.log10() - lo.log10()) / (hi.log10() - lo.log10()),
        };
        u.clamp(0.0, 1.0)
    }

    /// Inverse of [`Norm::unit`].
    pub fn value(&self, u: f64) -> f64 {
        match *self {
            Norm::Linear { lo, hi } => lo + (hi - lo) * u,
            Norm::Log { lo, hi } => 10f64.powf(lo.log10() + (hi.log10() - lo.log10()) * u),
        }
    }
}
