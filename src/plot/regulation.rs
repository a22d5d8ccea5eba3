//! Regulation transient plots.
//!
//! Every transient starts where the searched channel's magnitude first
//! reaches the threshold. The windows around those crossings are drawn on top
//! of each other, once as recorded (`_T`) and once with their baseline
//! removed (`_TV`).

use std::path::{Path, PathBuf};

use log::*;
use plotters::prelude::*;

use super::{padded_range, points, prepare_output, sibling, style, CAPTION_FONT, LABEL_FONT};
use crate::archive::Archive;
use crate::config::{Channel, RegulationJob};
use crate::error::Result;
use crate::signal::{first_above, mean, rising_crossings, time_axis};

/// Samples before a current-triggered crossing used as the voltage
/// baseline: `start - 200 .. start - 100`.
const PRE_TRIGGER: (usize, usize) = (200, 100);

/// A FastLog record on its calibrated time axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub time: Vec<f64>,
    pub voltage: Vec<f64>,
    pub current: Vec<f64>,
}

impl Record {
    pub fn new(voltage: Vec<f64>, current: Vec<f64>, rate: f64) -> Self {
        Record {
            time: time_axis(voltage.len(), rate),
            voltage,
            current,
        }
    }

    pub fn from_archive(archive: &Archive, rate: f64) -> Result<Self> {
        let columns = archive.columns(&["vBuffer", "iBuffer"])?;
        Ok(Self::new(columns[0].to_vec(), columns[1].to_vec(), rate))
    }

    fn channel(&self, channel: Channel) -> &[f64] {
        match channel {
            Channel::Voltage => &self.voltage,
            Channel::Current => &self.current,
        }
    }
}

/// One transient on a time axis in milliseconds relative to its crossing.
#[derive(Debug, Clone, PartialEq)]
pub struct Transient {
    pub time_ms: Vec<f64>,
    pub values: Vec<f64>,
}

/// Sample offset of a window bound `ms` away from the crossing.
fn offset(time: &[f64], ms: f64) -> isize {
    if ms == 0.0 {
        return 0;
    }
    let samples = first_above(time, ms.abs() / 1000.0).unwrap_or(0) as isize;
    if ms < 0.0 {
        -samples
    } else {
        samples
    }
}

/// Sample windows around every threshold crossing of the searched channel.
/// Windows reaching outside the record are dropped.
pub fn windows(record: &Record, job: &RegulationJob) -> Vec<std::ops::Range<usize>> {
    let start = offset(&record.time, job.start_ms);
    let end = offset(&record.time, job.end_ms);
    let len = record.time.len() as isize;
    rising_crossings(record.channel(job.search), job.threshold)
        .into_iter()
        .filter_map(|k| {
            let (lo, hi) = (k as isize + start, k as isize + end);
            if lo < 0 || hi > len || hi <= lo {
                debug!("Window {}..{} around {} is outside the record", lo, hi, k);
                return None;
            }
            Some(lo as usize..hi as usize)
        })
        .collect()
}

fn transient(record: &Record, job: &RegulationJob, window: std::ops::Range<usize>, baseline: f64) -> Transient {
    let span = window.len();
    Transient {
        time_ms: record.time[..span].iter().map(|t| t * 1000.0 + job.start_ms).collect(),
        values: record.channel(job.plot)[window].iter().map(|v| v - baseline).collect(),
    }
}

pub fn stacked(record: &Record, job: &RegulationJob) -> Vec<Transient> {
    windows(record, job)
        .into_iter()
        .map(|w| transient(record, job, w, 0.0))
        .collect()
}

/// Baseline of a window: the mean of its middle third, except for voltage
/// transients triggered on current, which use the samples just before the
/// window.
fn baseline(record: &Record, job: &RegulationJob, window: &std::ops::Range<usize>) -> f64 {
    let plotted = record.channel(job.plot);
    match (job.plot, job.search) {
        (Channel::Voltage, Channel::Current) => {
            let lo = window.start.saturating_sub(PRE_TRIGGER.0);
            let hi = window.start.saturating_sub(PRE_TRIGGER.1);
            mean(&plotted[lo..hi])
        }
        _ => {
            let third = window.len() / 3;
            mean(&plotted[window.start + third..window.end - third])
        }
    }
}

pub fn stacked_baseline(record: &Record, job: &RegulationJob) -> Vec<Transient> {
    windows(record, job)
        .into_iter()
        .filter_map(|w| {
            let base = baseline(record, job, &w);
            if base.is_finite() {
                Some(transient(record, job, w, base))
            } else {
                debug!("No baseline before sample {}", w.start);
                None
            }
        })
        .collect()
}

fn channel_desc(channel: Channel) -> &'static str {
    match channel {
        Channel::Voltage => "Voltage (V)",
        Channel::Current => "Current (A)",
    }
}

/// Voltage above current, sharing the time axis.
pub fn render_vi(record: &Record, title: &str, path: &Path, size: (u32, u32)) -> Result<()> {
    prepare_output(path)?;
    let root = BitMapBackend::new(path, size).into_drawing_area();
    root.fill(&WHITE)?;
    let root = root.titled(title, CAPTION_FONT)?;
    let (upper, lower) = root.split_vertically(root.dim_in_pixel().1 / 2);
    let t = padded_range(record.time.iter());

    for (k, (area, values, desc)) in [
        (&upper, &record.voltage, "Voltage (V)"),
        (&lower, &record.current, "Current (A)"),
    ]
    .into_iter()
    .enumerate()
    {
        let mut chart = ChartBuilder::on(area)
            .margin(10)
            .x_label_area_size(if k == 1 { 40 } else { 10 })
            .y_label_area_size(60)
            .build_cartesian_2d(t.clone(), padded_range(values.iter()))?;
        let mut mesh = chart.configure_mesh();
        mesh.y_desc(desc).axis_desc_style(LABEL_FONT);
        if k == 1 {
            mesh.x_desc("Time (s)");
        } else {
            mesh.x_labels(0);
        }
        mesh.draw()?;
        chart.draw_series(LineSeries::new(points(&record.time, values), style(0)))?;
    }

    root.present()?;
    info!("Saved {}", path.display());
    Ok(())
}

pub fn render_stack(transients: &[Transient], job: &RegulationJob, path: &Path, size: (u32, u32)) -> Result<()> {
    prepare_output(path)?;
    let root = BitMapBackend::new(path, size).into_drawing_area();
    root.fill(&WHITE)?;

    let x = padded_range(transients.iter().flat_map(|t| t.time_ms.iter()));
    let y = padded_range(transients.iter().flat_map(|t| t.values.iter()));
    let mut chart = ChartBuilder::on(&root)
        .caption(&job.title, CAPTION_FONT)
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x, y)?;
    chart
        .configure_mesh()
        .x_desc("Time (ms)")
        .y_desc(channel_desc(job.plot))
        .axis_desc_style(LABEL_FONT)
        .draw()?;
    for (k, t) in transients.iter().enumerate() {
        chart.draw_series(LineSeries::new(points(&t.time_ms, &t.values), style(k)))?;
    }

    root.present()?;
    info!("Saved {} ({} transients)", path.display(), transients.len());
    Ok(())
}

/// `<stem>_VI.png`, `<stem>_T.png` and `<stem>_TV.png` next to the job's
/// input.
pub fn render_job(job: &RegulationJob, rate: f64, size: (u32, u32)) -> Result<Vec<PathBuf>> {
    let record = Record::from_archive(&Archive::load(&job.input)?, rate)?;

    let vi = sibling(&job.input, "_VI");
    render_vi(&record, &job.title, &vi, size)?;
    let t = sibling(&job.input, "_T");
    render_stack(&stacked(&record, job), job, &t, size)?;
    let tv = sibling(&job.input, "_TV");
    render_stack(&stacked_baseline(&record, job), job, &tv, size)?;
    Ok(vec![vi, t, tv])
}
