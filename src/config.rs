//! Bench configuration.
//!
//! Every procedure reads its tunables from one TOML file. Each section and
//! field is optional and falls back to the values the bench was commissioned
//! with, so an empty file is a valid configuration:
//!
//! ```toml
//! [instruments]
//! ngu401 = "192.168.0.32:5025"
//!
//! [power]
//! on_s = 30.0
//! output = "data/power_short.npz"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub instruments: InstrumentsConfig,
    pub temperature: TemperatureConfig,
    pub fastlog: FastLogConfig,
    pub converter: ConverterConfig,
    pub power: PowerConfig,
    pub peltier_continuous: PeltierContinuousConfig,
    pub peltier_pulse: PeltierPulseConfig,
    pub peltier_pwm: PeltierPwmConfig,
    pub regulation_load: RegulationLoadConfig,
    pub regulation_cpm: RegulationCpmConfig,
    pub modulation: ModulationConfig,
    pub solar: SolarConfig,
    pub plot: PlotConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that parse but would hang or crash a procedure.
    pub fn validate(&self) -> Result<()> {
        self.instruments.timeout()?;
        self.solar.validate()
    }

    /// Loads `path` when given, otherwise the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

/// Network addresses of the instruments, as `host:port` of their raw SCPI
/// socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstrumentsConfig {
    pub ngu401: String,
    pub k2450: String,
    /// Socket read/write timeout in seconds.
    pub timeout_s: f64,
}

impl InstrumentsConfig {
    pub fn timeout(&self) -> Result<Duration> {
        match Duration::try_from_secs_f64(self.timeout_s) {
            Ok(timeout) if !timeout.is_zero() => Ok(timeout),
            _ => Err(Error::invalid(format!(
                "instruments.timeout_s must be a positive number of seconds, not {}",
                self.timeout_s
            ))),
        }
    }
}

impl Default for InstrumentsConfig {
    fn default() -> Self {
        InstrumentsConfig {
            ngu401: "192.168.0.32:5025".to_string(),
            k2450: "192.168.0.31:5025".to_string(),
            timeout_s: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemperatureConfig {
    pub port: String,
    pub baud_rate: u32,
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        TemperatureConfig {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
        }
    }
}

/// FastLog streaming parameters shared by every capture.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FastLogConfig {
    /// Floats requested per FLOG:DATA? query, two per sample.
    pub chunk_values: usize,
    pub sample_rate_hz: u32,
    /// Buffer oversizing factor over the nominal rate.
    pub headroom: f64,
}

impl Default for FastLogConfig {
    fn default() -> Self {
        FastLogConfig {
            chunk_values: 50,
            sample_rate_hz: 500_000,
            headroom: 1.02,
        }
    }
}

/// DC-DC converter efficiency map.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConverterConfig {
    /// Input voltage sweep bounds (V), linear.
    pub v_range: [f64; 2],
    /// Load current bounds (A), geometric.
    pub i_range: [f64; 2],
    pub v_steps: usize,
    pub i_steps: usize,
    /// The inner sweep stops once the output sags below this (V).
    pub v_limit: f64,
    /// The inner sweep stops once the input draws more than this (A).
    pub i_limit: f64,
    /// Input supply current limit (A).
    pub source_current_limit: f64,
    pub source_filter_count: u32,
    /// Electronic load compliance voltage and range (V).
    pub load_voltage: f64,
    pub load_voltage_range: f64,
    pub load_nplc: u32,
    pub range_settle_s: f64,
    pub measurement_delay_s: f64,
    pub output: PathBuf,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        ConverterConfig {
            v_range: [6.0, 20.0],
            i_range: [25e-6, 2.5],
            v_steps: 50,
            i_steps: 50,
            v_limit: 4.95,
            i_limit: 1.0,
            source_current_limit: 1.05,
            source_filter_count: 10,
            load_voltage: 5.1,
            load_voltage_range: 6.0,
            load_nplc: 10,
            range_settle_s: 0.2,
            measurement_delay_s: 2.0,
            output: PathBuf::from("data/converter/converter.npz"),
        }
    }
}

/// ESP32 supply profile: off, on, off.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PowerConfig {
    pub pre_s: f64,
    pub on_s: f64,
    pub post_s: f64,
    pub voltage: f64,
    pub min_current: f64,
    pub max_current: f64,
    pub trailing_chunks: u32,
    pub output: PathBuf,
}

impl Default for PowerConfig {
    fn default() -> Self {
        PowerConfig {
            pre_s: 0.5,
            on_s: 57.0,
            post_s: 0.5,
            voltage: 5.0,
            min_current: -3.0,
            max_current: 3.0,
            trailing_chunks: 1,
            output: PathBuf::from("data/esp32_power/power.npz"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeltierContinuousConfig {
    pub v_start: f64,
    pub v_end: f64,
    pub steps: usize,
    pub first_step_s: f64,
    pub step_s: f64,
    pub poll_s: f64,
    pub settle_s: f64,
    pub nplc: u32,
    pub output: PathBuf,
}

impl Default for PeltierContinuousConfig {
    fn default() -> Self {
        PeltierContinuousConfig {
            v_start: -5.0,
            v_end: 5.0,
            steps: 21,
            first_step_s: 180.0,
            step_s: 120.0,
            poll_s: 0.25,
            settle_s: 1.0,
            nplc: 1,
            output: PathBuf::from("data/peltier/continuous.npz"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeltierPulseConfig {
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub min_current: f64,
    pub max_current: f64,
    pub steps: usize,
    pub pulse_s: f64,
    pub gap_s: f64,
    pub trailing_chunks: u32,
    pub output: PathBuf,
}

impl Default for PeltierPulseConfig {
    fn default() -> Self {
        PeltierPulseConfig {
            min_voltage: -5.0,
            max_voltage: 5.0,
            min_current: -3.0,
            max_current: 3.0,
            steps: 21,
            pulse_s: 0.001,
            gap_s: 1.0,
            trailing_chunks: 1,
            output: PathBuf::from("data/peltier/pulse.npz"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeltierPwmConfig {
    pub voltage: f64,
    pub min_current: f64,
    pub max_current: f64,
    pub steps: usize,
    pub first_step_s: f64,
    pub step_s: f64,
    pub period_s: f64,
    pub output: PathBuf,
}

impl Default for PeltierPwmConfig {
    fn default() -> Self {
        PeltierPwmConfig {
            voltage: 5.0,
            min_current: -3.0,
            max_current: 3.0,
            steps: 21,
            first_step_s: 180.0,
            step_s: 120.0,
            period_s: 0.01,
            output: PathBuf::from("data/peltier/pwm.npz"),
        }
    }
}

/// Voltage priority load steps.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegulationLoadConfig {
    pub v_start: f64,
    pub v_end: f64,
    pub min_current: f64,
    pub max_current: f64,
    pub steps: usize,
    pub step_s: f64,
    /// Idle time at 0 V before and after the steps.
    pub idle_s: f64,
    pub fast_transient: bool,
    /// Sample-to-sample rise counted as a step edge (V).
    pub edge_threshold: f64,
    pub margin_samples: usize,
    pub trailing_chunks: u32,
    pub output: PathBuf,
}

impl Default for RegulationLoadConfig {
    fn default() -> Self {
        RegulationLoadConfig {
            v_start: 0.0,
            v_end: 6.0,
            min_current: -8.0,
            max_current: 8.0,
            steps: 13,
            step_s: 0.01,
            idle_s: 0.1,
            fast_transient: true,
            edge_threshold: 0.05,
            margin_samples: 5_000,
            trailing_chunks: 3,
            output: PathBuf::from("data/regulation/regulation_load.npz"),
        }
    }
}

/// Current priority pulses.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegulationCpmConfig {
    pub i_start: f64,
    pub i_end: f64,
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub pulses: usize,
    pub pulse_s: f64,
    pub separation_s: f64,
    /// Level used for gaps and in place of a 0 A pulse (A).
    pub idle_current: f64,
    pub margin_samples: usize,
    pub trailing_chunks: u32,
    pub output: PathBuf,
}

impl Default for RegulationCpmConfig {
    fn default() -> Self {
        RegulationCpmConfig {
            i_start: -8.0,
            i_end: 8.0,
            min_voltage: -6.0,
            max_voltage: 6.0,
            pulses: 33,
            pulse_s: 0.01,
            separation_s: 0.01,
            idle_current: 0.0001,
            margin_samples: 1_000,
            trailing_chunks: 3,
            output: PathBuf::from("data/regulation/regulation_cpm.npz"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModulationConfig {
    pub duration_s: f64,
    pub gain: f64,
    /// Full periods kept at the end of the record.
    pub cycles: usize,
    pub trailing_chunks: u32,
    pub output: PathBuf,
}

impl Default for ModulationConfig {
    fn default() -> Self {
        ModulationConfig {
            duration_s: 3.0,
            gain: 1.0,
            cycles: 2,
            trailing_chunks: 3,
            output: PathBuf::from("data/regulation/modulation.npy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolarConfig {
    pub step: f64,
    pub max_voltage: f64,
    pub settle_s: f64,
    /// Sink current limit while the panel drives the output (A).
    pub current_limit: f64,
    pub nplc: u32,
    pub output: PathBuf,
}

impl SolarConfig {
    /// The sweep only ends once the voltage passes `max_voltage`, so it needs
    /// a positive step.
    pub fn validate(&self) -> Result<()> {
        if !(self.step > 0.0 && self.step.is_finite()) {
            return Err(Error::invalid(format!("solar.step must be positive, not {}", self.step)));
        }
        if self.max_voltage.is_nan() {
            return Err(Error::invalid("solar.max_voltage is not a number"));
        }
        Ok(())
    }
}

impl Default for SolarConfig {
    fn default() -> Self {
        SolarConfig {
            step: 0.01,
            max_voltage: 20.0,
            settle_s: 0.2,
            current_limit: -1.0,
            nplc: 1,
            output: PathBuf::from("data/solar/solar.npz"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[serde(alias = "v")]
    Voltage,
    #[serde(alias = "i")]
    Current,
}

/// One regulation record to render.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegulationJob {
    pub input: PathBuf,
    pub title: String,
    /// Channel searched for threshold crossings.
    pub search: Channel,
    pub threshold: f64,
    /// Channel drawn in the stacked plots.
    pub plot: Channel,
    /// Window around each crossing (ms).
    pub start_ms: f64,
    pub end_ms: f64,
}

impl RegulationJob {
    fn new(
        input: &str,
        title: &str,
        search: Channel,
        threshold: f64,
        plot: Channel,
        window_ms: (f64, f64),
    ) -> Self {
        RegulationJob {
            input: PathBuf::from(input),
            title: title.to_string(),
            search,
            threshold,
            plot,
            start_ms: window_ms.0,
            end_ms: window_ms.1,
        }
    }
}

fn default_regulation_jobs() -> Vec<RegulationJob> {
    use Channel::*;
    let dir = "data/regulation";
    let mut jobs = Vec::new();
    for (name, load) in [("i_0", "Short"), ("i_0_320", "0.3 Ω")] {
        jobs.push(RegulationJob::new(
            &format!("{}/{}.npz", dir, name),
            &format!("CPM: Sweep: -8 A to +8 A, Load: {}", load),
            Current,
            0.25,
            Current,
            (-0.5, 10.5),
        ));
    }
    for (name, load, ftr) in [
        ("v_s_nl", "Open", "Off"),
        ("v_f_nl", "Open", "On"),
        ("v_s_8", "8 Ω", "Off"),
        ("v_f_8", "8 Ω", "On"),
    ] {
        jobs.push(RegulationJob::new(
            &format!("{}/{}.npz", dir, name),
            &format!("VPM: Sweep: -20 V to +20 V, Load: {}, FTR: {}", load, ftr),
            Voltage,
            0.1,
            Voltage,
            (-0.5, 10.5),
        ));
    }
    for (name, sweep, max, ftr) in [
        ("regulation_load_5_580_slow_max3", "0 V to +20 V", "~0.5 A", "Off"),
        ("regulation_load_5_580_fast_max3", "0 V to +20 V", "~0.5 A", "On"),
        ("regulation_load_6_250_slow_max3", "0 V to +20 V", "~3 A", "Off"),
        ("regulation_load_6_250_fast_max3", "0 V to +20 V", "~3 A", "On"),
        ("regulation_load_6_950_slow_max8", "0 V to +6 V", "~8 A", "Off"),
        ("regulation_load_6_950_fast_max8", "0 V to +6 V", "~8 A", "On"),
    ] {
        jobs.push(RegulationJob::new(
            &format!("{}/{}.npz", dir, name),
            &format!("Regulation: Sweep: {}, Max current: {}, FTR: {}", sweep, max, ftr),
            Current,
            0.15,
            Voltage,
            (-0.2, 1.2),
        ));
    }
    jobs
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlotConfig {
    pub width: u32,
    pub height: u32,
    /// Measured FastLog rate used for the time axis of regulation records.
    pub calibrated_rate_hz: f64,
    /// Oscilloscope sample rate of the ESP32 GPIO capture.
    pub scope_rate_hz: f64,
    pub step_window_s: f64,
    pub pulse_window_s: f64,
    pub pwm_window_s: f64,
    pub regulation: Vec<RegulationJob>,
}

impl Default for PlotConfig {
    fn default() -> Self {
        PlotConfig {
            width: 1200,
            height: 600,
            calibrated_rate_hz: 500_000.0 * 1.01348,
            scope_rate_hz: 100_000.0,
            step_window_s: 2.0,
            pulse_window_s: 0.0005,
            pwm_window_s: 2.0,
            regulation: default_regulation_jobs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.fastlog.chunk_values, 50);
        assert_eq!(config.regulation_load.trailing_chunks, 3);
        assert_eq!(config.power.trailing_chunks, 1);
        assert_eq!(config.plot.regulation.len(), 12);
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [instruments]
            ngu401 = "10.0.0.2:5025"

            [power]
            on_s = 30.0
            output = "out/power.npz"
        "#;

        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.instruments.ngu401, "10.0.0.2:5025");
        assert_eq!(config.instruments.k2450, "192.168.0.31:5025");
        assert_eq!(config.power.on_s, 30.0);
        assert_eq!(config.power.pre_s, 0.5);
        assert_eq!(config.power.output, PathBuf::from("out/power.npz"));
    }

    #[test]
    fn test_regulation_jobs() {
        let toml = r#"
            [[plot.regulation]]
            input = "a.npz"
            title = "A"
            search = "i"
            threshold = 0.25
            plot = "voltage"
            start_ms = -0.2
            end_ms = 1.2
        "#;

        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.plot.regulation.len(), 1);
        assert_eq!(config.plot.regulation[0].search, Channel::Current);
        assert_eq!(config.plot.regulation[0].plot, Channel::Voltage);
        assert_eq!(config.plot.width, 1200);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(Config::from_str("[power]\non_seconds = 3.0\n").is_err());
    }

    #[test]
    fn test_solar_step_must_be_positive() {
        assert!(Config::from_str("[solar]\nstep = 0.0\n").is_err());
        assert!(Config::from_str("[solar]\nstep = -0.01\n").is_err());
        assert!(Config::from_str("[solar]\nstep = nan\n").is_err());
        assert_eq!(Config::from_str("[solar]\nstep = 0.1\n").unwrap().solar.step, 0.1);
    }

    #[test]
    fn test_timeout() {
        assert_eq!(
            Config::default().instruments.timeout().unwrap(),
            Duration::from_secs(30)
        );
        for bad in ["-1.0", "nan", "inf", "0.0"] {
            let toml = format!("[instruments]\ntimeout_s = {}\n", bad);
            assert!(Config::from_str(&toml).is_err(), "timeout_s = {}", bad);
        }
        let config = Config::from_str("[instruments]\ntimeout_s = 2.5\n").unwrap();
        assert_eq!(config.instruments.timeout().unwrap(), Duration::from_millis(2500));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        std::fs::write(&path, "[solar]\nstep = 0.05\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.solar.step, 0.05);
        assert!(Config::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
