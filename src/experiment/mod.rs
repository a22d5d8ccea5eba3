//! Acquisition procedures.
//!
//! Each procedure owns its instruments for the duration of the run, drives
//! them through one experiment and returns the recorded arrays. Saving is
//! left to the caller so the procedures run unchanged against
//! [`crate::instrument::mock::MockInstrument`].

pub mod converter;
pub mod peltier;
pub mod power;
pub mod regulation;
pub mod solar;

use std::time::Duration;

use log::*;

use crate::archive::{Archive, NdArray};
use crate::capture::{capture, Capture, CaptureSettings};
use crate::config::FastLogConfig;
use crate::error::Result;
use crate::instrument::{FastLogRate, Instrument, Ngu401};
use crate::util::Clock;

pub(crate) fn capture_settings(fastlog: &FastLogConfig, expected_s: f64, margin_s: f64) -> CaptureSettings {
    CaptureSettings::sized_for(
        Duration::from_secs_f64(expected_s.max(0.0)),
        Duration::from_secs_f64(margin_s.max(0.0)),
        fastlog.sample_rate_hz,
        fastlog.headroom,
        fastlog.chunk_values,
    )
}

/// Resets the NGU401 and routes its FastLog events to the status byte.
pub fn prepare_streaming<I: Instrument>(ngu: &mut Ngu401<I>, fastlog: &FastLogConfig) -> Result<()> {
    ngu.reset()?;
    ngu.prepare_streaming(FastLogRate::at_most(fastlog.sample_rate_hz))
}

/// Starts FastLog, switches the output on and drains the stream. FastLog
/// is stopped again afterwards whatever the capture outcome.
pub fn stream<I: Instrument, C: Clock>(
    ngu: &mut Ngu401<I>,
    clock: &mut C,
    settings: &CaptureSettings,
) -> Result<Capture> {
    ngu.set_fastlog(true)?;
    let captured = ngu.set_output(true).and_then(|_| capture(ngu, clock, settings));
    match (captured, ngu.set_fastlog(false)) {
        (Ok(captured), stopped) => stopped.map(|_| captured),
        (Err(e), stopped) => {
            if let Err(stop) = stopped {
                warn!("Could not stop FastLog: {}", stop);
            }
            Err(e)
        }
    }
}

/// `vBuffer`, `iBuffer` and, when it could be measured, `rate`.
pub fn capture_archive(captured: Capture) -> Archive {
    let mut archive = Archive::new();
    if let Some(rate) = captured.rate {
        archive.insert("rate", NdArray::scalar(rate));
    } else {
        debug!("No sample rate for a capture of {} chunks", captured.chunks);
    }
    archive
        .insert("vBuffer", captured.voltage)
        .insert("iBuffer", captured.current);
    archive
}
