//! Regulation transients of the NGU401 itself: voltage steps in voltage
//! priority, current pulses in current priority and the analog modulation
//! input. Each record is cut down to the interesting window before it is
//! returned.

use std::ops::Range;
use std::time::Duration;

use log::*;

use crate::archive::{Archive, NdArray};
use crate::capture::Capture;
use crate::config::{FastLogConfig, ModulationConfig, RegulationCpmConfig, RegulationLoadConfig};
use crate::error::Result;
use crate::instrument::{ArbPoint, ArbTable, Instrument, Level, Ngu401, Priority};
use crate::signal::{diff, linspace, rising_zero_crossings, widen};
use crate::util::Clock;

use super::{capture_settings, prepare_streaming, stream};

/// Buffer margin beyond the table duration, in seconds.
const MARGIN_S: f64 = 3.0;
/// Capture continues this long past the table duration before giving up.
const TIMEOUT_SLACK_S: f64 = 0.5;
/// Last CPM row, distinct from the gaps so the final edge is visible.
const END_CURRENT: f64 = 0.001;

/// Voltage and current of the kept window.
#[derive(Debug, Clone, PartialEq)]
pub struct Transient {
    pub voltage: Vec<f64>,
    pub current: Vec<f64>,
}

impl Transient {
    fn cut(captured: Capture, window: Range<usize>) -> Self {
        info!("Keeping samples {}..{} of {}", window.start, window.end, captured.len());
        Transient {
            voltage: captured.voltage[window.clone()].to_vec(),
            current: captured.current[window].to_vec(),
        }
    }

    pub fn into_archive(self) -> Archive {
        let mut archive = Archive::new();
        archive
            .insert("vBuffer", self.voltage)
            .insert("iBuffer", self.current);
        archive
    }
}

/// Idle, the voltage staircase, idle.
pub fn load_steps(cfg: &RegulationLoadConfig) -> ArbTable {
    let idle = ArbPoint::voltage(0.0, cfg.max_current, cfg.min_current, cfg.idle_s);
    let mut table = ArbTable::new();
    table.push(idle);
    for v in linspace(cfg.v_start, cfg.v_end, cfg.steps) {
        table.push(ArbPoint::voltage(v, cfg.max_current, cfg.min_current, cfg.step_s));
    }
    table.push(idle);
    table
}

/// From the first to the last sample-to-sample rise above `threshold`,
/// widened by `margin`. The whole record when there is no such rise.
pub fn edge_window(voltage: &[f64], threshold: f64, margin: usize) -> Range<usize> {
    let rises: Vec<usize> = diff(voltage)
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d > threshold)
        .map(|(k, _)| k)
        .collect();
    match (rises.first(), rises.last()) {
        (Some(&first), Some(&last)) => widen(first, last, margin, voltage.len()),
        _ => {
            warn!("No voltage step above {} V found, keeping the whole record", threshold);
            0..voltage.len()
        }
    }
}

fn stream_table<I: Instrument, C: Clock>(
    ngu: &mut Ngu401<I>,
    clock: &mut C,
    table: &ArbTable,
    trailing_chunks: u32,
    fastlog: &FastLogConfig,
) -> Result<Capture> {
    let settings = capture_settings(fastlog, table.duration(), MARGIN_S)
        .trailing_chunks(trailing_chunks)
        .timeout(Duration::from_secs_f64(table.duration() + TIMEOUT_SLACK_S));
    stream(ngu, clock, &settings)
}

pub fn load<I: Instrument, C: Clock>(
    ngu: &mut Ngu401<I>,
    clock: &mut C,
    cfg: &RegulationLoadConfig,
    fastlog: &FastLogConfig,
) -> Result<Transient> {
    prepare_streaming(ngu, fastlog)?;
    ngu.set_priority(Priority::Voltage)?;
    ngu.set_fast_transient(cfg.fast_transient)?;

    let table = load_steps(cfg);
    ngu.load_arb(&table, 1, None)?;
    let captured = stream_table(ngu, clock, &table, cfg.trailing_chunks, fastlog)?;
    let window = edge_window(&captured.voltage, cfg.edge_threshold, cfg.margin_samples);
    Ok(Transient::cut(captured, window))
}

/// A 0 A pulse would switch the output off, so it is replaced by the idle
/// level.
pub fn cpm_pulses(cfg: &RegulationCpmConfig) -> ArbTable {
    let point = |amps: f64, dwell: f64| ArbPoint::current(cfg.max_voltage, cfg.min_voltage, amps, dwell);
    let mut table = ArbTable::new();
    table.push(point(cfg.idle_current, cfg.separation_s));
    for i in linspace(cfg.i_start, cfg.i_end, cfg.pulses) {
        let i = if i == 0.0 { cfg.idle_current } else { i };
        table
            .push(point(i, cfg.pulse_s))
            .push(point(cfg.idle_current, cfg.separation_s));
    }
    table.push(point(END_CURRENT, cfg.separation_s));
    table
}

/// Samples where `|i|` exceeds half the smaller sweep end, widened by
/// `margin`.
pub fn pulse_window(current: &[f64], i_start: f64, i_end: f64, margin: usize) -> Range<usize> {
    let threshold = i_start.abs().min(i_end.abs()) / 2.0;
    let first = current.iter().position(|i| i.abs() > threshold);
    let last = current.iter().rposition(|i| i.abs() > threshold);
    match (first, last) {
        (Some(first), Some(last)) => widen(first, last, margin, current.len()),
        _ => {
            warn!("No pulse above {} A found, keeping the whole record", threshold);
            0..current.len()
        }
    }
}

pub fn cpm<I: Instrument, C: Clock>(
    ngu: &mut Ngu401<I>,
    clock: &mut C,
    cfg: &RegulationCpmConfig,
    fastlog: &FastLogConfig,
) -> Result<Transient> {
    prepare_streaming(ngu, fastlog)?;
    ngu.set_priority(Priority::Current)?;

    let table = cpm_pulses(cfg);
    ngu.load_arb(&table, 1, Some(Priority::Current))?;
    let captured = stream_table(ngu, clock, &table, cfg.trailing_chunks, fastlog)?;
    let window = pulse_window(&captured.current, cfg.i_start, cfg.i_end, cfg.margin_samples);
    Ok(Transient::cut(captured, window))
}

/// The last `cycles` full periods between rising zero crossings, widened by
/// an eighth of their length on each side.
pub fn cycle_window(voltage: &[f64], cycles: usize) -> Option<Range<usize>> {
    let crossings = rising_zero_crossings(voltage);
    if cycles == 0 || crossings.len() < cycles + 1 {
        return None;
    }
    let start = crossings[crossings.len() - 1 - cycles];
    let end = crossings[crossings.len() - 1] + 1;
    let delta = (end - start) / 8;
    let lo = start.saturating_sub(delta + 1);
    let hi = (end + delta + 1).min(voltage.len());
    Some(lo..hi)
}

pub fn modulation<I: Instrument, C: Clock>(
    ngu: &mut Ngu401<I>,
    clock: &mut C,
    cfg: &ModulationConfig,
    fastlog: &FastLogConfig,
) -> Result<NdArray> {
    prepare_streaming(ngu, fastlog)?;
    ngu.set_priority(Priority::Voltage)?;
    ngu.set_negative_current(Level::Min)?;
    ngu.set_current(Level::Max)?;
    ngu.enable_modulation(cfg.gain)?;

    let settings = capture_settings(fastlog, cfg.duration_s, MARGIN_S)
        .trailing_chunks(cfg.trailing_chunks)
        .timeout(Duration::from_secs_f64(cfg.duration_s.max(0.0) + TIMEOUT_SLACK_S));
    let captured = stream(ngu, clock, &settings)?;
    ngu.set_output(false)?;

    let window = cycle_window(&captured.voltage, cfg.cycles).unwrap_or_else(|| {
        warn!("Fewer than {} full periods recorded, keeping the whole record", cfg.cycles);
        0..captured.len()
    });
    Ok(NdArray::vector(captured.voltage[window].to_vec()))
}
