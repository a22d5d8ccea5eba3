//! Rohde & Schwarz NGU401 source measure unit.
//!
//! Covers what the bench procedures use: source levels and ranges, READ?
//! readings, ARB tables, the modulation input and FastLog streaming. FastLog
//! is drained through the status byte: the operation register summary (bit 7)
//! flags a waiting chunk and the questionable register summary (bit 3) flags
//! skipped samples.

use std::fmt;

use fugit::HertzU32;
use log::*;

use super::Instrument;
use crate::capture::ChunkSource;
use crate::error::Result;
use crate::instrument::StatusByte;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Level {
    Min,
    Max,
    Value(f64),
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Min => write!(f, "MIN"),
            Level::Max => write!(f, "MAX"),
            Level::Value(v) => write!(f, "{:.6}", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Voltage,
    Current,
}

impl Priority {
    fn source(self) -> &'static str {
        match self {
            Priority::Voltage => "VOLT",
            Priority::Current => "CURR",
        }
    }

    fn arb_mode(self) -> &'static str {
        match self {
            Priority::Voltage => "VPM",
            Priority::Current => "CPM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastLogRate {
    S500K,
    S250K,
    S50K,
    S10K,
    S1K,
}

impl FastLogRate {
    pub fn hz(self) -> HertzU32 {
        match self {
            FastLogRate::S500K => HertzU32::kHz(500),
            FastLogRate::S250K => HertzU32::kHz(250),
            FastLogRate::S50K => HertzU32::kHz(50),
            FastLogRate::S10K => HertzU32::kHz(10),
            FastLogRate::S1K => HertzU32::kHz(1),
        }
    }

    /// Nearest supported rate not above `hz`, falling back to the slowest.
    pub fn at_most(hz: u32) -> Self {
        [
            FastLogRate::S500K,
            FastLogRate::S250K,
            FastLogRate::S50K,
            FastLogRate::S10K,
        ]
        .into_iter()
        .find(|r| r.hz().raw() <= hz)
        .unwrap_or(FastLogRate::S1K)
    }

    fn keyword(self) -> &'static str {
        match self {
            FastLogRate::S500K => "S500K",
            FastLogRate::S250K => "S250K",
            FastLogRate::S50K => "S50K",
            FastLogRate::S10K => "S10K",
            FastLogRate::S1K => "S1K",
        }
    }
}

/// One row of an ARB table.
///
/// In voltage priority the three levels are voltage, positive and negative
/// current limit; in current priority they are positive and negative voltage
/// limit and current.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArbPoint {
    pub levels: [f64; 3],
    pub dwell_s: f64,
    pub interpolate: bool,
}

impl ArbPoint {
    pub fn voltage(volts: f64, i_max: f64, i_min: f64, dwell_s: f64) -> Self {
        ArbPoint {
            levels: [volts, i_max, i_min],
            dwell_s,
            interpolate: false,
        }
    }

    pub fn current(v_max: f64, v_min: f64, amps: f64, dwell_s: f64) -> Self {
        ArbPoint {
            levels: [v_max, v_min, amps],
            dwell_s,
            interpolate: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArbTable {
    points: Vec<ArbPoint>,
}

impl ArbTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, point: ArbPoint) -> &mut Self {
        self.points.push(point);
        self
    }

    pub fn points(&self) -> &[ArbPoint] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Total dwell time of one repetition in seconds.
    pub fn duration(&self) -> f64 {
        self.points.iter().map(|p| p.dwell_s).sum()
    }

    pub fn command(&self) -> String {
        let rows: Vec<String> = self
            .points
            .iter()
            .map(|p| {
                format!(
                    "{:.6},{:.6},{:.6},{:.6},{}",
                    p.levels[0],
                    p.levels[1],
                    p.levels[2],
                    p.dwell_s,
                    p.interpolate as u8
                )
            })
            .collect();
        format!("ARB:DATA {}", rows.join(","))
    }
}

pub struct Ngu401<I: Instrument> {
    inst: I,
}

impl<I: Instrument> Ngu401<I> {
    pub fn new(inst: I) -> Self {
        Ngu401 { inst }
    }

    pub fn inner(&self) -> &I {
        &self.inst
    }

    pub fn inner_mut(&mut self) -> &mut I {
        &mut self.inst
    }

    pub fn reset(&mut self) -> Result<()> {
        self.inst.clear()?;
        self.inst.write("*RST")?;
        self.inst.wait_complete()
    }

    pub fn set_priority(&mut self, priority: Priority) -> Result<()> {
        self.inst.write(&format!("SOUR:PRI {}", priority.source()))
    }

    pub fn set_fast_transient(&mut self, on: bool) -> Result<()> {
        self.inst.write(&format!("OUTP:FTR {}", on as u8))
    }

    pub fn set_voltage(&mut self, level: Level) -> Result<()> {
        self.inst.write(&format!("SOUR:VOLT {}", level))
    }

    pub fn set_voltage_range(&mut self, volts: f64) -> Result<()> {
        self.inst.write(&format!("SOUR:VOLT:RANG {}", Level::Value(volts)))
    }

    pub fn set_negative_voltage(&mut self, level: Level) -> Result<()> {
        self.inst.write(&format!("SOUR:VOLT:NEG {}", level))
    }

    pub fn set_current(&mut self, level: Level) -> Result<()> {
        self.inst.write(&format!("SOUR:CURR {}", level))
    }

    pub fn set_current_range(&mut self, amps: f64) -> Result<()> {
        self.inst.write(&format!("SOUR:CURR:RANG {}", Level::Value(amps)))
    }

    pub fn set_negative_current(&mut self, level: Level) -> Result<()> {
        self.inst.write(&format!("SOUR:CURR:NEG {}", level))
    }

    /// Auto ranging readback for both quantities, integrating over `nplc`
    /// power line cycles.
    pub fn configure_sense(&mut self, nplc: u32) -> Result<()> {
        self.inst.write("SENS:VOLT:RANG:AUTO 1")?;
        self.inst.write("SENS:CURR:RANG:AUTO 1")?;
        self.inst.write(&format!("SENS:NPLC {}", nplc))
    }

    pub fn set_output(&mut self, on: bool) -> Result<()> {
        self.inst.write(&format!("OUTP {}", on as u8))
    }

    pub fn output_enabled(&mut self) -> Result<bool> {
        Ok(self.inst.query_number("OUTP?")? != 0.0)
    }

    /// Triggers a reading and returns `(voltage, current)`.
    pub fn measure(&mut self) -> Result<(f64, f64)> {
        let reading = self.inst.query_pair("READ?")?;
        self.inst.wait_complete()?;
        Ok(reading)
    }

    pub fn enable_modulation(&mut self, gain: f64) -> Result<()> {
        self.inst.write("MOD 1")?;
        self.inst.write(&format!("MOD:GAIN {}", gain))
    }

    /// Uploads and arms `table`. `repetitions` of zero repeats forever;
    /// `mode` selects the ARB priority mode and clears the previous table.
    pub fn load_arb(
        &mut self,
        table: &ArbTable,
        repetitions: u32,
        mode: Option<Priority>,
    ) -> Result<()> {
        debug!("ARB table of {} points, {:.3} s", table.points().len(), table.duration());
        if let Some(mode) = mode {
            self.inst.write("ARB:CLE")?;
            self.inst.write(&format!("ARB:PRI:MODE {}", mode.arb_mode()))?;
        }
        self.inst.write(&format!("ARB:REP {}", repetitions))?;
        // Output switches off when the table ends.
        self.inst.write("ARB:BEH:END OFF")?;
        self.inst.write(&table.command())?;
        self.inst.write("ARB:TRAN 1")?;
        self.inst.write("ARB:STAT 1")
    }

    /// Routes the FastLog events of channel 1 to the status byte summary
    /// bits.
    pub fn configure_fastlog_status(&mut self) -> Result<()> {
        for (register, bit) in [
            ("STAT:OPER", 8192),
            ("STAT:OPER:INST", 2),
            ("STAT:OPER:INST:ISUM1", 4096),
            ("STAT:QUES", 8192),
            ("STAT:QUES:INST", 2),
            ("STAT:QUES:INST:ISUM1", 2048),
        ] {
            self.inst.write(&format!("{}:NTR 0", register))?;
            self.inst.write(&format!("{}:PTR {}", register, bit))?;
            self.inst.write(&format!("{}:ENABLE {}", register, bit))?;
        }
        Ok(())
    }

    pub fn clear_events(&mut self) -> Result<()> {
        self.clear_data_events()?;
        for register in ["STAT:QUES:INST:ISUM1", "STAT:QUES:INST", "STAT:QUES"] {
            self.inst.query(&format!("{}:EVEN?", register))?;
        }
        Ok(())
    }

    /// Reading the event registers re-arms the data ready summary bit.
    pub fn clear_data_events(&mut self) -> Result<()> {
        for register in ["STAT:OPER:INST:ISUM1", "STAT:OPER:INST", "STAT:OPER"] {
            self.inst.query(&format!("{}:EVEN?", register))?;
        }
        Ok(())
    }

    pub fn configure_fastlog(&mut self, rate: FastLogRate) -> Result<()> {
        self.inst.write("FLOG:TARG SCPI")?;
        self.inst.write(&format!("FLOG:SRAT {}", rate.keyword()))
    }

    pub fn set_fastlog(&mut self, on: bool) -> Result<()> {
        self.inst.write(&format!("FLOG {}", on as u8))?;
        self.inst.wait_complete()
    }

    /// Status registers, event reset and FastLog target in one go, as every
    /// streaming procedure needs them.
    pub fn prepare_streaming(&mut self, rate: FastLogRate) -> Result<()> {
        self.configure_fastlog_status()?;
        self.clear_events()?;
        self.configure_fastlog(rate)
    }
}

impl<I: Instrument> ChunkSource for Ngu401<I> {
    fn status(&mut self) -> Result<StatusByte> {
        self.inst.read_stb()
    }

    fn read_chunk(&mut self, values: usize) -> Result<Vec<f32>> {
        let data = self.inst.query_binary("FLOG:DATA?")?;
        if data.len() != values {
            trace!("FastLog chunk of {} values, expected {}", data.len(), values);
        }
        self.clear_data_events()?;
        Ok(data)
    }

    fn output_active(&mut self) -> Result<bool> {
        self.output_enabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::MockInstrument;

    #[test]
    fn arb_command_matches_instrument_format() {
        let mut table = ArbTable::new();
        table
            .push(ArbPoint::voltage(0.0, 3.0, -3.0, 0.5))
            .push(ArbPoint::voltage(5.0, 3.0, -3.0, 57.0));
        assert_eq!(
            table.command(),
            "ARB:DATA 0.000000,3.000000,-3.000000,0.500000,0,5.000000,3.000000,-3.000000,57.000000,0"
        );
        assert!((table.duration() - 57.5).abs() < 1e-12);
    }

    #[test]
    fn level_keywords() {
        assert_eq!(Level::Min.to_string(), "MIN");
        assert_eq!(Level::Max.to_string(), "MAX");
        assert_eq!(Level::Value(-25e-6).to_string(), "-0.000025");
    }

    #[test]
    fn fastlog_rate_selection() {
        assert_eq!(FastLogRate::at_most(500_000), FastLogRate::S500K);
        assert_eq!(FastLogRate::at_most(300_000), FastLogRate::S250K);
        assert_eq!(FastLogRate::at_most(10), FastLogRate::S1K);
        assert_eq!(FastLogRate::S50K.hz().raw(), 50_000);
    }

    #[test]
    fn cpm_table_clears_and_selects_mode() {
        let mut ngu = Ngu401::new(MockInstrument::new());
        let mut table = ArbTable::new();
        table.push(ArbPoint::current(6.0, -6.0, 0.0001, 0.01));
        ngu.load_arb(&table, 1, Some(Priority::Current)).unwrap();
        let log = &ngu.inner().log;
        assert_eq!(log[0], "ARB:CLE");
        assert_eq!(log[1], "ARB:PRI:MODE CPM");
        assert_eq!(log[2], "ARB:REP 1");
        assert_eq!(log.last().unwrap(), "ARB:STAT 1");
    }

    #[test]
    fn fastlog_status_routing() {
        let mut ngu = Ngu401::new(MockInstrument::new());
        ngu.prepare_streaming(FastLogRate::S500K).unwrap();
        let mock = ngu.inner();
        assert!(mock.sent("STAT:OPER:INST:ISUM1:ENABLE 4096"));
        assert!(mock.sent("STAT:QUES:INST:ISUM1:ENABLE 2048"));
        assert!(mock.sent("STAT:QUES:EVEN?"));
        assert!(mock.sent("FLOG:SRAT S500K"));
        assert_eq!(mock.count("STAT:OPER:NTR 0"), 1);
    }
}
