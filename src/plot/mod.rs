//! Analysis and PNG rendering of recorded archives.
//!
//! Each submodule splits into pure functions that reduce a record to the
//! quantities shown, and `render*` functions that draw them with plotters'
//! bitmap backend.

pub mod chamber;
pub mod colormap;
pub mod converter;
pub mod modulation;
pub mod peltier;
pub mod power;
pub mod regulation;

use std::ops::Range;
use std::path::{Path, PathBuf};

use plotters::prelude::*;

use crate::error::Result;

/// Line colours, in the order series are added to a chart.
pub const SERIES: [RGBColor; 4] = [
    RGBColor(31, 119, 180),
    RGBColor(255, 127, 14),
    RGBColor(44, 160, 44),
    RGBColor(214, 39, 40),
];

/// Points drawn per line at most. Longer records are strided.
const MAX_POINTS: usize = 50_000;

pub(crate) const CAPTION_FONT: (&str, u32) = ("sans-serif", 24);
pub(crate) const LABEL_FONT: (&str, u32) = ("sans-serif", 16);

pub(crate) fn style(k: usize) -> ShapeStyle {
    SERIES[k % SERIES.len()].stroke_width(2)
}

/// Legend swatch drawn in the series' line style.
pub(crate) fn legend(line: ShapeStyle) -> impl Fn((i32, i32)) -> PathElement<(i32, i32)> {
    move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], line)
}

/// `<input stem><suffix>.png` next to `input`.
pub fn sibling(input: &Path, suffix: &str) -> PathBuf {
    let stem = input.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    input.with_file_name(format!("{}{}.png", stem, suffix))
}

/// Creates the parent directory of `path` so the backend can write to it.
pub(crate) fn prepare_output(path: &Path) -> Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => Ok(std::fs::create_dir_all(dir)?),
        _ => Ok(()),
    }
}

/// Range covering every finite value with 5 % padding. Degenerate inputs
/// get a unit wide range.
pub fn padded_range<'a>(values: impl IntoIterator<Item = &'a f64>) -> Range<f64> {
    let (lo, hi) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if lo > hi {
        return 0.0..1.0;
    }
    if lo == hi {
        return lo - 0.5..hi + 0.5;
    }
    let pad = (hi - lo) * 0.05;
    lo - pad..hi + pad
}

/// `(x, y)` pairs strided down to at most [`MAX_POINTS`], skipping non
/// finite values.
pub(crate) fn points<'a>(x: &'a [f64], y: &'a [f64]) -> impl Iterator<Item = (f64, f64)> + 'a {
    let stride = (x.len().min(y.len()) / MAX_POINTS).max(1);
    x.iter()
        .zip(y)
        .step_by(stride)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(&a, &b)| (a, b))
}
