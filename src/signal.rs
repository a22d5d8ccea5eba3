//! Numeric helpers for sweep tables and post-processing of captured
//! waveforms: spacing, differences, edge and crossing search, interpolation
//! and windowed means.

use std::ops::Range;

/// `n` evenly spaced values from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|k| if k == n - 1 { end } else { start + step * k as f64 })
                .collect()
        }
    }
}

/// `n` values from `start` to `end` inclusive with a constant ratio.
/// Both ends must have the same sign and be non-zero.
pub fn geomspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    let sign = start.signum();
    linspace(start.abs().log10(), end.abs().log10(), n)
        .into_iter()
        .map(|e| sign * 10_f64.powf(e))
        .collect()
}

/// `n` sample times at `rate` samples per second.
pub fn time_axis(n: usize, rate: f64) -> Vec<f64> {
    (0..n).map(|k| k as f64 / rate).collect()
}

pub fn diff(values: &[f64]) -> Vec<f64> {
    values.windows(2).map(|w| w[1] - w[0]).collect()
}

/// Arithmetic mean, NaN for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        f64::NAN
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub fn min_max(values: &[f64]) -> Option<(f64, f64)> {
    values
        .iter()
        .filter(|v| v.is_finite())
        .fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

/// Index of the largest value, first one on ties. NaN never wins.
pub fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (k, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((k, v)),
        })
        .map(|(k, _)| k)
}

/// First index whose value is strictly greater than `x`.
pub fn first_above(values: &[f64], x: f64) -> Option<usize> {
    values.iter().position(|&v| v > x)
}

/// Piecewise linear interpolation of (`xp`, `fp`) at `x`, holding the end
/// values outside the sampled range. `xp` must be ascending.
pub fn interp(x: &[f64], xp: &[f64], fp: &[f64]) -> Vec<f64> {
    let n = xp.len().min(fp.len());
    if n == 0 {
        return vec![f64::NAN; x.len()];
    }
    x.iter()
        .map(|&t| {
            if t <= xp[0] {
                return fp[0];
            }
            if t >= xp[n - 1] {
                return fp[n - 1];
            }
            let hi = xp[..n].partition_point(|&p| p <= t);
            let lo = hi - 1;
            let span = xp[hi] - xp[lo];
            if span == 0.0 {
                fp[lo]
            } else {
                fp[lo] + (fp[hi] - fp[lo]) * (t - xp[lo]) / span
            }
        })
        .collect()
}

/// Indices `k` where `|values[k]|` is below `threshold` and `|values[k + 1]|`
/// reaches it.
pub fn rising_crossings(values: &[f64], threshold: f64) -> Vec<usize> {
    values
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[0].abs() < threshold && w[1].abs() >= threshold)
        .map(|(k, _)| k)
        .collect()
}

/// Indices `k` where the signal goes from negative to positive between `k`
/// and `k + 1`.
pub fn rising_zero_crossings(values: &[f64]) -> Vec<usize> {
    values
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[0] < 0.0 && w[1] > 0.0)
        .map(|(k, _)| k)
        .collect()
}

/// Min-max normalises `values` and thresholds at the midpoint.
pub fn binarize(values: &[f64]) -> Vec<bool> {
    match min_max(values) {
        Some((lo, hi)) if hi > lo => values.iter().map(|v| (v - lo) / (hi - lo) > 0.5).collect(),
        _ => vec![false; values.len()],
    }
}

/// Indices `k` where the level changes between `k` and `k + 1`.
pub fn edges(levels: &[bool]) -> Vec<usize> {
    levels
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[0] != w[1])
        .map(|(k, _)| k)
        .collect()
}

pub fn rising_edges(levels: &[bool]) -> Vec<usize> {
    levels
        .windows(2)
        .enumerate()
        .filter(|(_, w)| !w[0] && w[1])
        .map(|(k, _)| k)
        .collect()
}

pub fn falling_edges(levels: &[bool]) -> Vec<usize> {
    levels
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[0] && !w[1])
        .map(|(k, _)| k)
        .collect()
}

/// Mean of `values[k]` over every `k` with `lo <= times[k] <= hi`.
pub fn mean_between(values: &[f64], times: &[f64], lo: f64, hi: f64) -> f64 {
    let (sum, n) = values
        .iter()
        .zip(times)
        .filter(|&(_, &t)| t >= lo && t <= hi)
        .fold((0.0, 0_usize), |(s, n), (v, _)| (s + v, n + 1));
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

/// `first..=last` widened by `margin` on both sides and clamped to `len`.
pub fn widen(first: usize, last: usize, margin: usize, len: usize) -> Range<usize> {
    let start = first.saturating_sub(margin).min(len);
    let end = last.saturating_add(margin).saturating_add(1).min(len);
    start..end.max(start)
}
