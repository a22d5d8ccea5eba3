//! ESP32 power profile analysis.
//!
//! The SMU record is aligned to an oscilloscope capture of two GPIOs: the
//! first marks one full firmware iteration, the second toggles at every
//! phase boundary. The alignment gives the effective SMU sample rate and a
//! common time axis, from which per-phase current, charge, power and energy
//! follow.

use std::fmt;
use std::path::Path;

use log::*;
use plotters::prelude::*;

use super::{legend, padded_range, points, prepare_output, style, CAPTION_FONT, LABEL_FONT};
use crate::archive::Archive;
use crate::error::{Error, Result};
use crate::signal::{binarize, edges, falling_edges, first_above, mean, rising_edges};

pub const PHASES: [&str; 12] = [
    "Idle",
    "Computation",
    "WiFi Connect",
    "WiFi Idle",
    "WiFi Download",
    "WiFi Upload",
    "WiFi Disconnect",
    "Light-sleep Overhead",
    "Light-sleep",
    "Deep-sleep Overhead",
    "Deep-sleep",
    "Reset",
];

/// Phases averaged over a 1 s window centred in the phase, skipping the
/// wake-up transients.
const SLEEP_PHASES: [usize; 2] = [8, 10];

/// SMU supply voltage separating on from off.
const SUPPLY_THRESHOLD: f64 = 2.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSummary {
    pub name: &'static str,
    /// Seconds.
    pub duration: f64,
    pub current: f64,
    pub charge: f64,
    pub power: f64,
    pub energy: f64,
}

impl fmt::Display for PhaseSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:20} : {:6.1} ms, {:5.1} mA, {:5.1} mC, {:5.1} mW, {:6.1} mJ",
            self.name,
            self.duration * 1e3,
            self.current * 1e3,
            self.charge * 1e3,
            self.power * 1e3,
            self.energy * 1e3
        )
    }
}

/// SMU and scope records on a common time axis, zero at the first edge.
#[derive(Debug, Clone)]
pub struct PowerRecord {
    pub voltage: Vec<f64>,
    pub current: Vec<f64>,
    pub t_smu: Vec<f64>,
    /// Effective SMU sample rate.
    pub rate: f64,
    /// Binarised scope channels.
    pub ch1: Vec<f64>,
    pub ch2: Vec<f64>,
    pub t_scope: Vec<f64>,
    /// Times of the phase GPIO edges.
    pub rising: Vec<f64>,
    pub falling: Vec<f64>,
}

fn first_two(edges: &[usize], what: &str) -> Result<(usize, usize)> {
    match edges {
        [a, b, ..] => Ok((*a, *b)),
        _ => Err(Error::plot(format!("{} has fewer than two edges", what))),
    }
}

impl PowerRecord {
    pub fn align(voltage: Vec<f64>, current: Vec<f64>, ch1: &[f64], ch2: &[f64], scope_rate: f64) -> Result<Self> {
        if voltage.len() != current.len() || ch1.len() != ch2.len() {
            return Err(Error::plot(format!(
                "SMU buffers of {} and {} samples, scope channels of {} and {}",
                voltage.len(),
                current.len(),
                ch1.len(),
                ch2.len()
            )));
        }
        let ch1 = binarize(ch1);
        let ch2 = binarize(ch2);

        let (s0, s1) = first_two(&edges(&ch1), "scope channel 1")?;
        let duration = (s1 - s0) as f64 / scope_rate;
        let t_scope: Vec<f64> = (0..ch1.len()).map(|k| (k as f64 - s0 as f64) / scope_rate).collect();
        let rising = rising_edges(&ch2).into_iter().map(|k| t_scope[k]).collect();
        let falling = falling_edges(&ch2).into_iter().map(|k| t_scope[k]).collect();

        let on: Vec<bool> = voltage.iter().map(|&v| v > SUPPLY_THRESHOLD).collect();
        let (e0, e1) = first_two(&edges(&on), "SMU voltage")?;
        let rate = (e1 - e0) as f64 / duration;
        let t_smu = (0..voltage.len()).map(|k| (k as f64 - e0 as f64) / rate).collect();
        debug!("Iteration of {:.3} s, SMU rate {:.0} S/s", duration, rate);

        let level = |b: Vec<bool>| -> Vec<f64> { b.into_iter().map(|x| if x { 1.0 } else { 0.0 }).collect() };
        Ok(PowerRecord {
            voltage,
            current,
            t_smu,
            rate,
            ch1: level(ch1),
            ch2: level(ch2),
            t_scope,
            rising,
            falling,
        })
    }

    /// SMU record (`vBuffer`, `iBuffer`) and scope capture (`ch1`, `ch2`).
    pub fn from_archives(smu: &Archive, scope: &Archive, scope_rate: f64) -> Result<Self> {
        let smu = smu.columns(&["vBuffer", "iBuffer"])?;
        let scope = scope.columns(&["ch1", "ch2"])?;
        Self::align(smu[0].to_vec(), smu[1].to_vec(), scope[0], scope[1], scope_rate)
    }

    fn index_after(&self, t: f64) -> usize {
        first_above(&self.t_smu, t).unwrap_or(self.t_smu.len())
    }

    /// Phase `i` spans from the `i`th falling to the `i + 1`th rising edge
    /// of the phase GPIO.
    pub fn phases(&self) -> Result<Vec<PhaseSummary>> {
        if self.falling.len() < PHASES.len() || self.rising.len() < PHASES.len() + 1 {
            return Err(Error::plot(format!(
                "phase GPIO has {} rising and {} falling edges, {} phases need {} and {}",
                self.rising.len(),
                self.falling.len(),
                PHASES.len(),
                PHASES.len() + 1,
                PHASES.len()
            )));
        }
        let last = self.t_smu.len().saturating_sub(1);

        let summaries = PHASES
            .iter()
            .enumerate()
            .map(|(i, &name)| {
                let (mut t0, mut t1) = (self.falling[i], self.rising[i + 1]);
                let (mut k0, mut k1) = (self.index_after(t0), self.index_after(t1));

                if SLEEP_PHASES.contains(&i) {
                    let mid = (k0 + k1) as f64 / 2.0;
                    k0 = ((mid - self.rate * 0.5).max(0.0) as usize).min(last);
                    k1 = ((mid + self.rate * 0.5).max(0.0) as usize).min(last);
                    t0 = self.t_smu[k0];
                    t1 = self.t_smu[k1];
                }

                let k1 = k1.max(k0);
                let power: Vec<f64> = self.voltage[k0..k1]
                    .iter()
                    .zip(&self.current[k0..k1])
                    .map(|(v, i)| v * i)
                    .collect();
                let current = mean(&self.current[k0..k1]);
                let power = mean(&power);
                let duration = t1 - t0;
                PhaseSummary {
                    name,
                    duration,
                    current,
                    charge: current * duration,
                    power,
                    energy: power * duration,
                }
            })
            .collect();
        Ok(summaries)
    }

    /// Sample range of one firmware iteration, from the first falling to the
    /// thirteenth rising phase edge.
    pub fn iteration(&self) -> Option<std::ops::Range<usize>> {
        let t0 = *self.falling.first()?;
        let t1 = *self.rising.get(PHASES.len())?;
        let k0 = self.index_after(t0);
        Some(k0..self.index_after(t1).max(k0))
    }
}

fn normalised(values: &[f64], offset: f64, scale: f64) -> Vec<f64> {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let max = if max > 0.0 { max } else { 1.0 };
    values.iter().map(|v| v / max * scale + offset).collect()
}

/// SMU and scope traces stacked on one normalised axis.
pub fn render_raw(record: &PowerRecord, path: &Path, size: (u32, u32)) -> Result<()> {
    prepare_output(path)?;
    let root = BitMapBackend::new(path, size).into_drawing_area();
    root.fill(&WHITE)?;

    let traces = [
        ("SMU voltage", &record.t_smu, normalised(&record.voltage, 0.0, 0.9)),
        ("SMU current", &record.t_smu, normalised(&record.current, 1.0, 0.9)),
        ("Oscilloscope voltage", &record.t_scope, normalised(&record.ch1, 2.0, 0.4)),
        ("Oscilloscope GPIO", &record.t_scope, normalised(&record.ch2, 2.5, 0.4)),
    ];

    let mut chart = ChartBuilder::on(&root)
        .caption("Recorded Waveforms", CAPTION_FONT)
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(20)
        .build_cartesian_2d(padded_range(record.t_smu.iter()), 0.0..3.3)?;
    chart
        .configure_mesh()
        .disable_y_axis()
        .x_desc("Time (s)")
        .axis_desc_style(LABEL_FONT)
        .draw()?;

    for (k, (label, t, y)) in traces.iter().enumerate() {
        let line = style(k);
        chart
            .draw_series(LineSeries::new(points(t, y), line))?
            .label(*label)
            .legend(legend(line));
    }
    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .background_style(WHITE.mix(0.8))
        .draw()?;

    root.present()?;
    info!("Saved {}", path.display());
    Ok(())
}

/// Power over one iteration with a marker at the middle of every GPIO
/// pulse.
pub fn render_power(record: &PowerRecord, path: &Path, size: (u32, u32)) -> Result<()> {
    let window = record
        .iteration()
        .ok_or_else(|| Error::plot("phase GPIO does not span a full iteration"))?;
    let t = &record.t_smu[window.clone()];
    let power: Vec<f64> = record.voltage[window.clone()]
        .iter()
        .zip(&record.current[window])
        .map(|(v, i)| v * i)
        .collect();
    let markers: Vec<f64> = record
        .rising
        .iter()
        .zip(&record.falling)
        .take(PHASES.len() + 1)
        .map(|(r, f)| (r + f) / 2.0)
        .collect();

    prepare_output(path)?;
    let root = BitMapBackend::new(path, size).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Power Consumption", CAPTION_FONT)
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(padded_range(t.iter()), padded_range(power.iter().chain([&0.0])))?;
    chart
        .configure_mesh()
        .x_desc("Time (s)")
        .y_desc("Power (W)")
        .axis_desc_style(LABEL_FONT)
        .draw()?;
    chart.draw_series(LineSeries::new(points(t, &power), style(0)))?;
    chart.draw_series(
        markers
            .iter()
            .map(|&m| PathElement::new(vec![(m, 0.0), (m, 0.05)], BLACK.stroke_width(1))),
    )?;

    root.present()?;
    info!("Saved {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plot::tests::{assert_png, drawn};

    /// Scope at 1 kS/s: channel 1 high for one second from sample 101,
    /// channel 2 pulses at 200 m + 10 for 50 samples. SMU at 2 kS/s with
    /// the supply on from sample 201 to 2200.
    fn record() -> PowerRecord {
        let ch1: Vec<f64> = (0..3000).map(|k| if (101..=1100).contains(&k) { 3.3 } else { 0.0 }).collect();
        let ch2: Vec<f64> = (0..3000).map(|k| if k % 200 >= 10 && k % 200 < 60 { 1.0 } else { 0.0 }).collect();
        let voltage: Vec<f64> = (0..6000)
            .map(|k| match k {
                0..=200 => 0.0,
                201..=2200 => 3.3,
                _ => 2.0,
            })
            .collect();
        PowerRecord::align(voltage, vec![0.01; 6000], &ch1, &ch2, 1000.0).unwrap()
    }

    #[test]
    fn aligns_time_bases() {
        let r = record();
        assert!((r.rate - 2000.0).abs() < 1e-9);
        assert_eq!(r.t_smu[200], 0.0);
        assert_eq!(r.t_scope[100], 0.0);
        assert_eq!(r.rising.len(), 15);
        assert!((r.rising[1] - 0.109).abs() < 1e-12);
        assert!((r.falling[0] + 0.041).abs() < 1e-12);
    }

    #[test]
    fn phase_table() {
        let phases = record().phases().unwrap();
        assert_eq!(phases.len(), 12);
        assert_eq!(phases[0].name, "Idle");
        assert!((phases[0].duration - 0.15).abs() < 1e-9);
        assert!((phases[0].current - 0.01).abs() < 1e-12);
        assert!((phases[0].charge - 0.0015).abs() < 1e-12);
        // 82 of the 300 samples fall before the supply switches on.
        assert!((phases[0].power - 218.0 * 0.033 / 300.0).abs() < 1e-12);
        // Sleep phases use a 1 s window regardless of the edges.
        assert!((phases[8].duration - 1.0).abs() < 1e-9);
        assert_eq!(
            phases[0].to_string(),
            "Idle                 :  150.0 ms,  10.0 mA,   1.5 mC,  24.0 mW,    3.6 mJ"
        );
    }

    #[test]
    fn needs_two_edges() {
        let flat = vec![0.0; 10];
        assert!(PowerRecord::align(vec![0.0; 10], vec![0.0; 10], &flat, &flat, 1000.0).is_err());
    }

    #[test]
    fn rejects_mismatched_buffers() {
        let ch1: Vec<f64> = (0..3000).map(|k| if (101..=1100).contains(&k) { 3.3 } else { 0.0 }).collect();
        let voltage: Vec<f64> = (0..6000).map(|k| if k > 200 { 3.3 } else { 0.0 }).collect();
        assert!(PowerRecord::align(voltage.clone(), vec![0.01; 5000], &ch1, &ch1, 1000.0).is_err());
        assert!(PowerRecord::align(voltage.clone(), vec![0.01; 6000], &ch1, &ch1[..2000], 1000.0).is_err());

        let mut smu = Archive::new();
        smu.insert("vBuffer", voltage).insert("iBuffer", vec![0.01; 10]);
        let mut scope = Archive::new();
        scope.insert("ch1", ch1.clone()).insert("ch2", ch1);
        assert!(PowerRecord::from_archives(&smu, &scope, 1000.0).is_err());
    }

    #[test]
    fn iteration_window() {
        let r = record();
        // falling[0] at -0.041 s, rising[12] at 2.309 s.
        assert_eq!(r.iteration(), Some(119..4819));
    }

    #[test]
    fn renders_both_figures() {
        let dir = tempfile::tempdir().unwrap();
        let r = record();
        let raw = dir.path().join("raw.png");
        let power = dir.path().join("power.png");
        if drawn(render_raw(&r, &raw, (800, 400))).is_some() {
            assert_png(&raw);
        }
        if drawn(render_power(&r, &power, (800, 400))).is_some() {
            assert_png(&power);
        }
    }
}
