//! Peltier element characterisation with the NGU401 as supply and the
//! serial sensor on the element's hot side.
//!
//! - continuous: slow voltage steps, polled with READ?
//! - pulse: short voltage pulses, streamed with FastLog
//! - PWM: a repeating on/off table per duty cycle, streamed and reduced to
//!   mean power per chunk

use std::time::Duration;

use log::*;

use crate::archive::Archive;
use crate::capture::{capture, poll_chunk, ChunkSource, Poll};
use crate::config::{FastLogConfig, PeltierContinuousConfig, PeltierPulseConfig, PeltierPwmConfig};
use crate::error::Result;
use crate::instrument::{ArbPoint, ArbTable, Instrument, Level, Ngu401, StatusByte};
use crate::signal::{interp, linspace, mean, time_axis};
use crate::temperature::{mean_reading, TemperatureSource};
use crate::util::{secs, Clock};

use super::{capture_settings, prepare_streaming};

/// Voltage, current and temperature against time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeltierTrace {
    pub voltage: Vec<f64>,
    pub current: Vec<f64>,
    pub temperature: Vec<f64>,
    pub time: Vec<f64>,
}

impl PeltierTrace {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn into_archive(self) -> Archive {
        let mut archive = Archive::new();
        archive
            .insert("vBuffer", self.voltage)
            .insert("iBuffer", self.current)
            .insert("tBuffer", self.temperature)
            .insert("tmBuffer", self.time);
        archive
    }

    pub fn from_archive(archive: &Archive) -> Result<Self> {
        let columns = archive.columns(&["vBuffer", "iBuffer", "tBuffer", "tmBuffer"])?;
        Ok(PeltierTrace {
            voltage: columns[0].to_vec(),
            current: columns[1].to_vec(),
            temperature: columns[2].to_vec(),
            time: columns[3].to_vec(),
        })
    }
}

/// Duty cycle, mean power and temperature per FastLog chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PwmTrace {
    pub duty: Vec<f64>,
    pub power: Vec<f64>,
    pub temperature: Vec<f64>,
    pub time: Vec<f64>,
}

impl PwmTrace {
    pub fn into_archive(self) -> Archive {
        let mut archive = Archive::new();
        archive
            .insert("dcBuffer", self.duty)
            .insert("pBuffer", self.power)
            .insert("tBuffer", self.temperature)
            .insert("tmBuffer", self.time);
        archive
    }

    pub fn from_archive(archive: &Archive) -> Result<Self> {
        let columns = archive.columns(&["dcBuffer", "pBuffer", "tBuffer", "tmBuffer"])?;
        Ok(PwmTrace {
            duty: columns[0].to_vec(),
            power: columns[1].to_vec(),
            temperature: columns[2].to_vec(),
            time: columns[3].to_vec(),
        })
    }
}

fn hold_time(index: usize, first_s: f64, rest_s: f64) -> Duration {
    Duration::from_secs_f64(if index == 0 { first_s } else { rest_s }.max(0.0))
}

pub fn continuous<I: Instrument, T: TemperatureSource, C: Clock>(
    ngu: &mut Ngu401<I>,
    temperature: &mut T,
    clock: &mut C,
    cfg: &PeltierContinuousConfig,
) -> Result<PeltierTrace> {
    ngu.reset()?;
    ngu.set_voltage(Level::Value(0.0))?;
    ngu.set_negative_current(Level::Min)?;
    ngu.set_current(Level::Max)?;
    ngu.configure_sense(cfg.nplc)?;
    ngu.set_output(true)?;
    ngu.inner_mut().wait_complete()?;

    let mut trace = PeltierTrace::default();
    let mut start = None;

    for (index, &level) in linspace(cfg.v_start, cfg.v_end, cfg.steps).iter().enumerate() {
        ngu.set_voltage(Level::Value(level))?;
        ngu.inner_mut().wait_complete()?;
        clock.sleep(secs(cfg.settle_s));

        let hold = hold_time(index, cfg.first_step_s, cfg.step_s);
        let step_start = clock.now();
        loop {
            let (v, i) = ngu.measure()?;
            let t = mean_reading(&temperature.read()?);
            let now = clock.now();
            let elapsed = now.saturating_sub(*start.get_or_insert(now)).as_secs_f64();

            info!(
                "[{:.1} s] Voltage: {:.3} V, Current: {:.3} A, Power: {:.3} W, Temperature: {:.3} °C",
                elapsed,
                v,
                i,
                v * i,
                t
            );
            trace.voltage.push(v);
            trace.current.push(i);
            trace.temperature.push(t);
            trace.time.push(elapsed);

            if now.saturating_sub(step_start) > hold {
                break;
            }
            clock.sleep(secs(cfg.poll_s));
        }
    }

    ngu.set_output(false)?;
    Ok(trace)
}

/// A gap, then one pulse and one gap per voltage step.
pub fn pulse_train(cfg: &PeltierPulseConfig) -> ArbTable {
    let gap = ArbPoint::voltage(0.0, cfg.max_current, cfg.min_current, cfg.gap_s);
    let mut table = ArbTable::new();
    table.push(gap);
    for v in linspace(cfg.min_voltage, cfg.max_voltage, cfg.steps) {
        table
            .push(ArbPoint::voltage(v, cfg.max_current, cfg.min_current, cfg.pulse_s))
            .push(gap);
    }
    table
}

/// Chunk source that samples the temperature sensor after every chunk.
struct WithTemperature<'a, S, T> {
    source: &'a mut S,
    temperature: &'a mut T,
    readings: Vec<f64>,
}

impl<S: ChunkSource, T: TemperatureSource> ChunkSource for WithTemperature<'_, S, T> {
    fn status(&mut self) -> Result<StatusByte> {
        self.source.status()
    }

    fn read_chunk(&mut self, values: usize) -> Result<Vec<f32>> {
        let chunk = self.source.read_chunk(values)?;
        self.readings.extend(self.temperature.read()?);
        Ok(chunk)
    }

    fn output_active(&mut self) -> Result<bool> {
        self.source.output_active()
    }
}

pub fn pulse<I: Instrument, T: TemperatureSource, C: Clock>(
    ngu: &mut Ngu401<I>,
    temperature: &mut T,
    clock: &mut C,
    cfg: &PeltierPulseConfig,
    fastlog: &FastLogConfig,
) -> Result<PeltierTrace> {
    prepare_streaming(ngu, fastlog)?;
    let table = pulse_train(cfg);
    ngu.load_arb(&table, 1, None)?;
    let settings = capture_settings(fastlog, table.duration(), 1.0).trailing_chunks(cfg.trailing_chunks);

    ngu.set_fastlog(true)?;
    ngu.set_output(true)?;
    // Readings from before the first pulse are stale.
    temperature.read()?;

    let mut source = WithTemperature {
        source: &mut *ngu,
        temperature,
        readings: Vec::new(),
    };
    let captured = capture(&mut source, clock, &settings)?;
    let readings = source.readings;
    ngu.set_fastlog(false)?;

    let rate = captured.rate.unwrap_or_else(|| {
        warn!("No measured sample rate, assuming {} S/s", fastlog.sample_rate_hz);
        fastlog.sample_rate_hz as f64
    });
    let time = time_axis(captured.len(), rate);
    let span = time.last().copied().unwrap_or(0.0);
    let temperature = interp(&time, &linspace(0.0, span, readings.len()), &readings);
    debug!("{} temperature readings over {:.3} s", readings.len(), span);

    Ok(PeltierTrace {
        voltage: captured.voltage,
        current: captured.current,
        temperature,
        time,
    })
}

/// One PWM period at `duty`. Negative duty drives negative voltage; empty
/// on or off phases are left out.
pub fn pwm_table(duty: f64, cfg: &PeltierPwmConfig) -> ArbTable {
    let on = cfg.period_s * duty.abs();
    let off = cfg.period_s * (1.0 - duty.abs());
    let level = if duty > 0.0 { cfg.voltage } else { -cfg.voltage };
    let mut table = ArbTable::new();
    if on != 0.0 {
        table.push(ArbPoint::voltage(level, cfg.max_current, cfg.min_current, on));
    }
    if off != 0.0 {
        table.push(ArbPoint::voltage(0.0, cfg.max_current, cfg.min_current, off));
    }
    table
}

fn chunk_power(chunk: &[f32]) -> f64 {
    let products: Vec<f64> = chunk
        .chunks_exact(2)
        .map(|pair| pair[0] as f64 * pair[1] as f64)
        .collect();
    mean(&products)
}

pub fn pwm<I: Instrument, T: TemperatureSource, C: Clock>(
    ngu: &mut Ngu401<I>,
    temperature: &mut T,
    clock: &mut C,
    cfg: &PeltierPwmConfig,
    fastlog: &FastLogConfig,
) -> Result<PwmTrace> {
    prepare_streaming(ngu, fastlog)?;

    let mut trace = PwmTrace::default();
    let mut start = None;

    for (index, &duty) in linspace(-1.0, 1.0, cfg.steps).iter().enumerate() {
        ngu.clear_events()?;
        ngu.load_arb(&pwm_table(duty, cfg), 0, None)?;
        ngu.set_fastlog(true)?;
        ngu.set_output(true)?;

        let hold = hold_time(index, cfg.first_step_s, cfg.step_s);
        let step_start = clock.now();
        loop {
            let chunk = match poll_chunk(ngu, fastlog.chunk_values)? {
                Poll::Idle => continue,
                Poll::Lost => {
                    warn!("Lost data at duty cycle {:.3}", duty);
                    break;
                }
                Poll::Chunk(chunk) => chunk,
            };
            let now = clock.now();
            let elapsed = now.saturating_sub(*start.get_or_insert(now)).as_secs_f64();
            let p = chunk_power(&chunk);
            let t = mean_reading(&temperature.read()?);

            info!(
                "[{:.1} s] Duty cycle: {:.3}, Power: {:.3} W, Temperature: {:.3} °C",
                elapsed, duty, p, t
            );
            trace.duty.push(duty);
            trace.power.push(p);
            trace.temperature.push(t);
            trace.time.push(elapsed);

            if now.saturating_sub(step_start) > hold {
                break;
            }
        }

        ngu.set_fastlog(false)?;
        ngu.set_output(false)?;
    }

    Ok(trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::tests::streaming_mock;
    use crate::instrument::mock::{MockInstrument, Reply};
    use crate::util::ManualClock;

    /// Sensor that reports `n` identical readings per call.
    struct Steady {
        value: f64,
        n: usize,
        calls: usize,
    }

    impl TemperatureSource for Steady {
        fn read(&mut self) -> Result<Vec<f64>> {
            self.calls += 1;
            Ok(vec![self.value; self.n])
        }
    }

    fn sensor(value: f64, n: usize) -> Steady {
        Steady { value, n, calls: 0 }
    }

    #[test]
    fn continuous_holds_each_step() {
        let cfg = PeltierContinuousConfig {
            v_start: -1.0,
            v_end: 1.0,
            steps: 2,
            first_step_s: 1.0,
            step_s: 0.5,
            ..PeltierContinuousConfig::default()
        };
        let mut ngu = Ngu401::new(MockInstrument::with_responder(|cmd| match cmd {
            "READ?" => Reply::text("1.5,0.5"),
            _ => Reply::text("1"),
        }));
        let mut temp = sensor(24.0, 2);
        let mut clock = ManualClock::new(Duration::ZERO);
        let trace = continuous(&mut ngu, &mut temp, &mut clock, &cfg).unwrap();

        // Readings every 0.25 s until the hold time is exceeded.
        assert_eq!(trace.len(), 6 + 4);
        assert_eq!(trace.time[0], 0.0);
        assert_eq!(trace.time[5], 1.25);
        // Second step starts after the 1 s settle time.
        assert_eq!(trace.time[6], 2.25);
        assert!(trace.temperature.iter().all(|&t| t == 24.0));
        assert!(ngu.inner().sent("SOUR:VOLT -1.000000"));
        assert_eq!(ngu.inner().log.last().unwrap(), "OUTP 0");
    }

    #[test]
    fn pulse_table_layout() {
        let cfg = PeltierPulseConfig {
            steps: 3,
            ..PeltierPulseConfig::default()
        };
        let table = pulse_train(&cfg);
        let levels: Vec<f64> = table.points().iter().map(|p| p.levels[0]).collect();
        assert_eq!(levels, vec![0.0, -5.0, 0.0, 0.0, 0.0, 5.0, 0.0]);
        assert!((table.duration() - (1.0 + 3.0 * 1.001)).abs() < 1e-12);
    }

    #[test]
    fn pulse_resamples_temperature() {
        let cfg = PeltierPulseConfig {
            steps: 1,
            gap_s: 0.01,
            ..PeltierPulseConfig::default()
        };
        let mock = streaming_mock(5, 25, 3, |_| 5.0, |_| 1.0);
        let mut ngu = Ngu401::new(mock);
        let mut temp = sensor(30.0, 1);
        let mut clock = ManualClock::new(Duration::from_millis(1));
        let trace = pulse(&mut ngu, &mut temp, &mut clock, &cfg, &FastLogConfig::default()).unwrap();

        assert_eq!(trace.len(), 4 * 25);
        assert_eq!(trace.temperature.len(), 100);
        assert!(trace.temperature.iter().all(|&t| t == 30.0));
        // One discarded read, then one per chunk.
        assert_eq!(temp.calls, 5);
        // 75 samples over 3 ms between first and last chunk.
        assert!((trace.time[1] - 1.0 / 25_000.0).abs() < 1e-12);
    }

    #[test]
    fn traces_need_matching_buffers() {
        let trace = PeltierTrace {
            voltage: vec![1.0, 2.0],
            current: vec![0.1, 0.2],
            temperature: vec![25.0, 26.0],
            time: vec![0.0, 1.0],
        };
        assert_eq!(PeltierTrace::from_archive(&trace.clone().into_archive()).unwrap(), trace);

        let mut archive = trace.into_archive();
        archive.insert("tmBuffer", vec![0.0]);
        assert!(PeltierTrace::from_archive(&archive).is_err());

        let mut archive = Archive::new();
        archive
            .insert("dcBuffer", vec![0.5; 3])
            .insert("pBuffer", vec![1.0; 3])
            .insert("tBuffer", vec![25.0; 2])
            .insert("tmBuffer", vec![0.0; 3]);
        assert!(PwmTrace::from_archive(&archive).is_err());
    }

    #[test]
    fn pwm_tables() {
        let cfg = PeltierPwmConfig::default();
        let half = pwm_table(0.5, &cfg);
        assert_eq!(half.points().len(), 2);
        assert_eq!(half.points()[0].levels[0], 5.0);
        assert!((half.duration() - 0.01).abs() < 1e-12);

        let neg = pwm_table(-1.0, &cfg);
        assert_eq!(neg.points().len(), 1);
        assert_eq!(neg.points()[0].levels[0], -5.0);

        let idle = pwm_table(0.0, &cfg);
        assert_eq!(idle.points().len(), 1);
        assert_eq!(idle.points()[0].levels[0], 0.0);
    }

    #[test]
    fn pwm_records_one_point_per_chunk() {
        let cfg = PeltierPwmConfig {
            steps: 3,
            first_step_s: 0.02,
            step_s: 0.01,
            ..PeltierPwmConfig::default()
        };
        let mut mock = streaming_mock(3, 25, usize::MAX, |_| 2.0, |_| 0.5);
        mock.push_status(0x00);
        mock.push_status(0x80);
        mock.push_status(0x80);
        mock.push_status(0x88);
        let mut ngu = Ngu401::new(mock);
        let mut temp = sensor(21.0, 3);
        let mut clock = ManualClock::new(Duration::from_millis(10));
        let trace = pwm(&mut ngu, &mut temp, &mut clock, &cfg, &FastLogConfig::default()).unwrap();

        // First step: three chunks until 20 ms have passed. Second step:
        // two chunks. Third step: lost data before any chunk.
        assert_eq!(trace.duty, vec![-1.0, -1.0, -1.0, 0.0, 0.0]);
        assert!(trace.power.iter().all(|&p| p == 1.0));
        assert_eq!(trace.temperature, vec![21.0; 5]);
        assert_eq!(ngu.inner().count("ARB:REP 0"), 3);
        assert_eq!(ngu.inner().count("OUTP 0"), 3);
    }
}
