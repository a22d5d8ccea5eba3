//! ESP32 power profile: the NGU401 supplies the board for one firmware
//! iteration while FastLog records supply voltage and current.

use log::*;

use crate::archive::Archive;
use crate::capture::Capture;
use crate::config::{FastLogConfig, PowerConfig};
use crate::error::Result;
use crate::instrument::{ArbPoint, ArbTable, Instrument, Ngu401};
use crate::util::Clock;

use super::{capture_settings, prepare_streaming, stream};

/// Off, on, off. The output switches off when the table ends.
pub fn supply_profile(cfg: &PowerConfig) -> ArbTable {
    let mut table = ArbTable::new();
    table
        .push(ArbPoint::voltage(0.0, cfg.max_current, cfg.min_current, cfg.pre_s))
        .push(ArbPoint::voltage(cfg.voltage, cfg.max_current, cfg.min_current, cfg.on_s))
        .push(ArbPoint::voltage(0.0, cfg.max_current, cfg.min_current, cfg.post_s));
    table
}

pub fn capture_profile<I: Instrument, C: Clock>(
    ngu: &mut Ngu401<I>,
    clock: &mut C,
    cfg: &PowerConfig,
    fastlog: &FastLogConfig,
) -> Result<Capture> {
    prepare_streaming(ngu, fastlog)?;
    let table = supply_profile(cfg);
    ngu.load_arb(&table, 1, None)?;

    let settings = capture_settings(fastlog, table.duration(), 1.0).trailing_chunks(cfg.trailing_chunks);
    let captured = stream(ngu, clock, &settings)?;
    if !captured.is_complete() {
        warn!("Power profile is incomplete, saving {} samples", captured.len());
    }
    Ok(captured)
}

pub fn run<I: Instrument, C: Clock>(
    ngu: &mut Ngu401<I>,
    clock: &mut C,
    cfg: &PowerConfig,
    fastlog: &FastLogConfig,
) -> Result<Archive> {
    capture_profile(ngu, clock, cfg, fastlog).map(super::capture_archive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureOutcome;
    use crate::experiment::tests::streaming_mock;
    use crate::util::ManualClock;
    use std::time::Duration;

    fn short_profile() -> PowerConfig {
        PowerConfig {
            pre_s: 0.01,
            on_s: 0.05,
            post_s: 0.01,
            ..PowerConfig::default()
        }
    }

    #[test]
    fn profile_table() {
        let table = supply_profile(&PowerConfig::default());
        assert_eq!(table.points().len(), 3);
        assert_eq!(table.points()[1].levels, [5.0, 3.0, -3.0]);
        assert!((table.duration() - 58.0).abs() < 1e-12);
    }

    #[test]
    fn records_until_output_off() {
        // Output goes off after the sixth chunk, one trailing chunk follows.
        let mock = streaming_mock(10, 25, 6, |k| k as f32, |_| 0.1);
        let mut ngu = Ngu401::new(mock);
        let mut clock = ManualClock::new(Duration::from_millis(10));
        let archive = run(&mut ngu, &mut clock, &short_profile(), &FastLogConfig::default()).unwrap();

        let v = archive.vector("vBuffer").unwrap();
        assert_eq!(v.len(), 7 * 25);
        assert_eq!(v[174], 174.0);
        assert!(archive.vector("rate").is_ok());
        let log = &ngu.inner().log;
        assert!(log.iter().any(|c| c.starts_with("ARB:DATA 0.000000,3.000000,-3.000000,0.010000,0,5.000000")));
        assert_eq!(log.iter().filter(|c| *c == "FLOG 0").count(), 1);
    }

    #[test]
    fn lost_samples_still_return_data() {
        let mut mock = streaming_mock(3, 25, 100, |_| 5.0, |_| 0.1);
        mock.push_status(0x88);
        let mut ngu = Ngu401::new(mock);
        let mut clock = ManualClock::new(Duration::from_millis(10));
        let captured =
            capture_profile(&mut ngu, &mut clock, &short_profile(), &FastLogConfig::default()).unwrap();
        assert_eq!(captured.outcome, CaptureOutcome::DataLost);
        assert_eq!(captured.len(), 75);
    }
}
