//! Peltier element characterisation plots.
//!
//! Continuous records are averaged over a window ending at every voltage
//! step, pulsed records over a window centred on every pulse and PWM records
//! over a window ending at every duty cycle change.

use std::ops::Range;
use std::path::{Path, PathBuf};

use log::*;
use plotters::prelude::*;

use super::{legend, padded_range, points, prepare_output, style, CAPTION_FONT, LABEL_FONT};
use crate::config::PlotConfig;
use crate::error::Result;
use crate::experiment::peltier::{PeltierTrace, PwmTrace};
use crate::signal::{diff, falling_edges, mean, mean_between, median, rising_edges};

/// Mean voltage, current and temperature per segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Segments {
    pub voltage: Vec<f64>,
    pub current: Vec<f64>,
    pub temperature: Vec<f64>,
}

impl Segments {
    fn averaged(trace: &PeltierTrace, at: &[usize], window: impl Fn(f64) -> (f64, f64)) -> Self {
        let mut seg = Segments::default();
        for &k in at {
            let (lo, hi) = window(trace.time[k]);
            seg.voltage.push(mean_between(&trace.voltage, &trace.time, lo, hi));
            seg.current.push(mean_between(&trace.current, &trace.time, lo, hi));
            seg.temperature.push(mean_between(&trace.temperature, &trace.time, lo, hi));
        }
        seg
    }

    pub fn power(&self) -> Vec<f64> {
        self.voltage.iter().zip(&self.current).map(|(v, i)| v * i).collect()
    }

    /// Voltage and resistance with the centre point, near 0 V, left out.
    pub fn resistance(&self) -> (Vec<f64>, Vec<f64>) {
        let v = without_middle(&self.voltage);
        let i = without_middle(&self.current);
        let r = v.iter().zip(&i).map(|(v, i)| v / i).collect();
        (v, r)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PwmSegments {
    pub duty: Vec<f64>,
    pub power: Vec<f64>,
    pub temperature: Vec<f64>,
}

pub fn without_middle(values: &[f64]) -> Vec<f64> {
    let mut out = values.to_vec();
    if !out.is_empty() {
        out.remove(out.len() / 2);
    }
    out
}

/// Indices `k` where `changed(values[k + 1] - values[k])` holds, plus the
/// last index.
fn changes(values: &[f64], changed: impl Fn(f64) -> bool) -> Vec<usize> {
    let mut at: Vec<usize> = diff(values)
        .into_iter()
        .enumerate()
        .filter(|&(_, d)| changed(d))
        .map(|(k, _)| k)
        .collect();
    if !values.is_empty() {
        at.push(values.len() - 1);
    }
    at
}

/// Last sample of every voltage step. A step is a rise three orders of
/// magnitude above the median sample-to-sample change.
pub fn step_ends(voltage: &[f64]) -> Vec<usize> {
    let mut d: Vec<f64> = diff(voltage).iter().map(|d| d.abs()).collect();
    d.push(0.0);
    let threshold = median(&d) * 1000.0;
    changes(voltage, |d| d > threshold)
}

pub fn step_segments(trace: &PeltierTrace, window_s: f64) -> Segments {
    Segments::averaged(trace, &step_ends(&trace.voltage), |t| (t - window_s, t))
}

/// Centre of every pulse, with the midpoint between the two halves of the
/// sweep inserted as the zero point.
pub fn pulse_centers(voltage: &[f64]) -> Vec<usize> {
    let magnitude: Vec<f64> = voltage.iter().map(|v| v.abs()).collect();
    let threshold = mean(&magnitude) * 100.0;
    let on: Vec<bool> = magnitude.iter().map(|&v| v > threshold).collect();
    let mut centers: Vec<usize> = rising_edges(&on)
        .into_iter()
        .zip(falling_edges(&on))
        .map(|(r, f)| (r + f) / 2)
        .collect();
    if centers.len() >= 2 {
        let half = centers.len() / 2;
        centers.insert(half, (centers[half - 1] + centers[half]) / 2);
    }
    centers
}

pub fn pulse_segments(trace: &PeltierTrace, window_s: f64) -> Segments {
    let half = window_s / 2.0;
    Segments::averaged(trace, &pulse_centers(&trace.voltage), |t| (t - half, t + half))
}

pub fn pwm_segments(trace: &PwmTrace, window_s: f64) -> PwmSegments {
    let mut seg = PwmSegments::default();
    for k in changes(&trace.duty, |d| d != 0.0) {
        let (lo, hi) = (trace.time[k] - window_s, trace.time[k]);
        seg.duty.push(trace.duty[k]);
        seg.power.push(mean_between(&trace.power, &trace.time, lo, hi));
        seg.temperature.push(mean_between(&trace.temperature, &trace.time, lo, hi));
    }
    seg
}

struct Series<'a> {
    label: &'a str,
    x: &'a [f64],
    y: Vec<f64>,
}

/// Primary series on the left axis, secondary series on the right one.
fn render_dual(
    path: &Path,
    size: (u32, u32),
    title: &str,
    axes: (&str, &str),
    primary: (&[Series], Range<f64>),
    secondary: (&[Series], Range<f64>),
) -> Result<()> {
    prepare_output(path)?;
    let root = BitMapBackend::new(path, size).into_drawing_area();
    root.fill(&WHITE)?;

    let x = padded_range(primary.0.iter().chain(secondary.0).flat_map(|s| s.x.iter()));
    let mut chart = ChartBuilder::on(&root)
        .caption(title, CAPTION_FONT)
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .right_y_label_area_size(60)
        .build_cartesian_2d(x.clone(), primary.1)?
        .set_secondary_coord(x, secondary.1);
    chart
        .configure_mesh()
        .x_desc("Time (s)")
        .y_desc(axes.0)
        .axis_desc_style(LABEL_FONT)
        .draw()?;
    chart
        .configure_secondary_axes()
        .y_desc(axes.1)
        .axis_desc_style(LABEL_FONT)
        .draw()?;

    for (k, s) in primary.0.iter().enumerate() {
        let line = style(k);
        chart
            .draw_series(LineSeries::new(points(s.x, &s.y), line))?
            .label(s.label)
            .legend(legend(line));
    }
    for (k, s) in secondary.0.iter().enumerate() {
        let line = style(primary.0.len() + k);
        chart
            .draw_secondary_series(LineSeries::new(points(s.x, &s.y), line))?
            .label(s.label)
            .legend(legend(line));
    }
    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperLeft)
        .background_style(WHITE.mix(0.8))
        .draw()?;

    root.present()?;
    info!("Saved {}", path.display());
    Ok(())
}

/// Curves with a marker at every point.
fn render_curves(
    path: &Path,
    size: (u32, u32),
    title: &str,
    axes: (&str, &str),
    curves: &[(&str, &[f64], &[f64])],
    y_range: Option<Range<f64>>,
) -> Result<()> {
    prepare_output(path)?;
    let root = BitMapBackend::new(path, size).into_drawing_area();
    root.fill(&WHITE)?;

    let x = padded_range(curves.iter().flat_map(|c| c.1.iter()));
    let y = y_range.unwrap_or_else(|| padded_range(curves.iter().flat_map(|c| c.2.iter())));
    let mut chart = ChartBuilder::on(&root)
        .caption(title, CAPTION_FONT)
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x, y.clone())?;
    chart
        .configure_mesh()
        .x_desc(axes.0)
        .y_desc(axes.1)
        .axis_desc_style(LABEL_FONT)
        .draw()?;

    for (k, &(label, xs, ys)) in curves.iter().enumerate() {
        let line = style(k);
        let visible: Vec<(f64, f64)> = points(xs, ys).filter(|p| y.contains(&p.1)).collect();
        chart
            .draw_series(LineSeries::new(visible.iter().copied(), line))?
            .label(label)
            .legend(legend(line));
        chart.draw_series(visible.iter().map(|&p| Circle::new(p, 3, line.filled())))?;
    }
    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperLeft)
        .background_style(WHITE.mix(0.8))
        .draw()?;

    root.present()?;
    info!("Saved {}", path.display());
    Ok(())
}

fn vi_series(trace: &PeltierTrace) -> ([Series<'_>; 2], [Series<'_>; 1]) {
    let t = trace.time.as_slice();
    (
        [
            Series { label: "Voltage", x: t, y: trace.voltage.clone() },
            Series { label: "Current", x: t, y: trace.current.clone() },
        ],
        [Series { label: "Temperature", x: t, y: trace.temperature.clone() }],
    )
}

/// Renders the six Peltier figures into `out_dir`.
pub fn render_all(
    step: &PeltierTrace,
    pulse: &PeltierTrace,
    pwm: &PwmTrace,
    cfg: &PlotConfig,
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let size = (cfg.width, cfg.height);
    let step_seg = step_segments(step, cfg.step_window_s);
    let pulse_seg = pulse_segments(pulse, cfg.pulse_window_s);
    let pwm_seg = pwm_segments(pwm, cfg.pwm_window_s);
    debug!(
        "{} steps, {} pulses, {} duty cycles",
        step_seg.voltage.len(),
        pulse_seg.voltage.len(),
        pwm_seg.duty.len()
    );

    let out = |name: &str| out_dir.join(name);
    let mut written = Vec::new();

    let path = out("continuous_time.png");
    let (primary, secondary) = vi_series(step);
    let y = padded_range(step.voltage.iter().chain(&step.current));
    render_dual(
        &path,
        size,
        "Continuous Voltage Characterization",
        ("Voltage (V) / Current (A)", "Temperature (°C)"),
        (primary.as_slice(), y),
        (secondary.as_slice(), -15.0..75.0),
    )?;
    written.push(path);

    let path = out("pulse_time.png");
    let (primary, secondary) = vi_series(pulse);
    let y = padded_range(pulse.voltage.iter().chain(&pulse.current));
    let t_mean = mean(&pulse.temperature);
    let t_range = if t_mean.is_finite() {
        t_mean.floor() - 0.75..t_mean.ceil() + 0.75
    } else {
        0.0..1.0
    };
    render_dual(
        &path,
        size,
        "Pulsed Characterization",
        ("Voltage (V) / Current (A)", "Temperature (°C)"),
        (primary.as_slice(), y),
        (secondary.as_slice(), t_range),
    )?;
    written.push(path);

    let path = out("pwm_time.png");
    let t = pwm.time.as_slice();
    let duty_percent: Vec<f64> = pwm.duty.iter().map(|d| d.abs() * 100.0).collect();
    render_dual(
        &path,
        size,
        "PWM Voltage Characterization",
        ("Power (W)", "Duty Cycle (%) / Temperature (°C)"),
        ([Series { label: "Power", x: t, y: pwm.power.clone() }].as_slice(), -1.0..13.0),
        (
            [
                Series { label: "Duty cycle (%)", x: t, y: duty_percent },
                Series { label: "Temperature", x: t, y: pwm.temperature.clone() },
            ]
            .as_slice(),
            -15.0..125.0,
        ),
    )?;
    written.push(path);

    let path = out("IV.png");
    render_curves(
        &path,
        size,
        "Voltage/Current Curves",
        ("Voltage (V)", "Current (A)"),
        &[
            ("Continuous", step_seg.voltage.as_slice(), step_seg.current.as_slice()),
            ("Pulsed", pulse_seg.voltage.as_slice(), pulse_seg.current.as_slice()),
        ],
        None,
    )?;
    written.push(path);

    let path = out("R.png");
    let (step_v, step_r) = step_seg.resistance();
    let (pulse_v, pulse_r) = pulse_seg.resistance();
    render_curves(
        &path,
        size,
        "Resistance Curves",
        ("Voltage (V)", "Resistance (Ω)"),
        &[
            ("Continuous", step_v.as_slice(), step_r.as_slice()),
            ("Pulsed", pulse_v.as_slice(), pulse_r.as_slice()),
        ],
        Some(0.0..5.0),
    )?;
    written.push(path);

    let path = out("Efficiency.png");
    let step_power = step_seg.power();
    render_curves(
        &path,
        size,
        "Efficiency",
        ("Power (W)", "Temperature (°C)"),
        &[
            ("Continuous", step_power.as_slice(), step_seg.temperature.as_slice()),
            ("PWM", pwm_seg.power.as_slice(), pwm_seg.temperature.as_slice()),
        ],
        None,
    )?;
    written.push(path);

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plot::tests::{assert_png, drawn};

    #[test]
    fn step_means_end_at_each_step() {
        let voltage = vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0];
        assert_eq!(step_ends(&voltage), vec![2, 5, 8]);

        let trace = PeltierTrace {
            current: voltage.iter().map(|v| v * 0.5).collect(),
            temperature: vec![20.0; 9],
            time: (0..9).map(|k| k as f64).collect(),
            voltage,
        };
        let seg = step_segments(&trace, 1.0);
        assert_eq!(seg.voltage, vec![0.0, 1.0, 2.0]);
        assert_eq!(seg.current, vec![0.0, 0.5, 1.0]);
        assert_eq!(seg.power(), vec![0.0, 0.5, 2.0]);
    }

    #[test]
    fn pulse_centers_with_zero_point() {
        let mut voltage = vec![0.0; 10_000];
        for (start, level) in [(10, -5.0), (5000, 2.0), (9000, 5.0)] {
            voltage[start..start + 4].fill(level);
        }
        assert_eq!(pulse_centers(&voltage), vec![11, 2506, 5001, 9001]);
        assert!(pulse_centers(&[0.0; 10]).is_empty());
    }

    #[test]
    fn pwm_changes() {
        let trace = PwmTrace {
            duty: vec![-1.0, -1.0, 0.0, 0.0, 0.0, 1.0],
            power: vec![4.0, 6.0, 0.0, 0.0, 0.0, 5.0],
            temperature: vec![10.0; 6],
            time: vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
        };
        let seg = pwm_segments(&trace, 1.0);
        assert_eq!(seg.duty, vec![-1.0, 0.0, 1.0]);
        assert_eq!(seg.power, vec![5.0, 0.0, 2.5]);
    }

    #[test]
    fn resistance_drops_centre() {
        assert_eq!(without_middle(&[1.0, 2.0, 3.0, 4.0, 5.0]), vec![1.0, 2.0, 4.0, 5.0]);
        assert_eq!(without_middle(&[1.0, 2.0, 3.0, 4.0]), vec![1.0, 2.0, 4.0]);
        let seg = Segments {
            voltage: vec![-2.0, 0.0, 2.0],
            current: vec![-1.0, 0.0, 0.5],
            temperature: vec![0.0; 3],
        };
        assert_eq!(seg.resistance(), (vec![-2.0, 2.0], vec![2.0, 4.0]));
    }

    /// One sample per second with the voltage stepping every ten samples.
    fn stepped(levels: &[f64]) -> PeltierTrace {
        let voltage: Vec<f64> = levels.iter().flat_map(|&v| [v; 10]).collect();
        let n = voltage.len();
        PeltierTrace {
            current: voltage.iter().map(|v| v * 0.5).collect(),
            temperature: voltage.iter().map(|v| 25.0 + v).collect(),
            time: (0..n).map(|k| k as f64).collect(),
            voltage,
        }
    }

    #[test]
    fn renders_six_figures() {
        let dir = tempfile::tempdir().unwrap();
        let pwm = PwmTrace {
            duty: vec![-1.0, -1.0, 0.0, 0.0, 0.5, 0.5],
            power: vec![2.0, 2.0, 0.0, 0.0, 1.0, 1.0],
            temperature: vec![20.0, 19.0, 22.0, 23.0, 30.0, 31.0],
            time: vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
        };
        let cfg = PlotConfig {
            width: 640,
            height: 480,
            ..PlotConfig::default()
        };
        let out = dir.path().join("figures");
        let written = drawn(render_all(&stepped(&[-2.0, -1.0, 1.0, 2.0]), &stepped(&[0.0, 3.0]), &pwm, &cfg, &out));
        if let Some(paths) = written {
            assert_eq!(paths.len(), 6);
            for path in &paths {
                assert!(path.starts_with(&out));
                assert_png(path);
            }
        }
    }
}
