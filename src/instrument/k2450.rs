//! Keithley 2450 SourceMeter driven through its TSP command set.

use log::*;

use super::block::parse_number;
use super::Instrument;
use crate::error::Result;

pub struct Keithley2450<I: Instrument> {
    inst: I,
}

impl<I: Instrument> Keithley2450<I> {
    pub fn new(inst: I) -> Self {
        Keithley2450 { inst }
    }

    pub fn inner(&self) -> &I {
        &self.inst
    }

    pub fn reset(&mut self) -> Result<()> {
        self.inst.clear()?;
        self.inst.write("reset()")
    }

    /// Four wire voltage source with high capacitance mode and a repeating
    /// average filter of `filter_count` readings. Leaves the output on at 0 V.
    pub fn configure_voltage_source(&mut self, current_limit: f64, filter_count: u32) -> Result<()> {
        self.inst.write("smu.measure.sense = smu.SENSE_4WIRE")?;
        self.inst.write("smu.source.highc = smu.ON")?;
        self.inst.write(&format!("smu.measure.filter.count = {}", filter_count))?;
        self.inst.write("smu.measure.filter.enable = smu.ON")?;
        self.inst.write(&format!("smu.source.ilimit.level = {}", current_limit))?;
        self.inst.write("smu.measure.autorangelow = 1E-4")?;
        self.inst.write("smu.source.level = 0")?;
        self.set_output(true)
    }

    pub fn set_level(&mut self, volts: f64) -> Result<()> {
        self.inst.write(&format!("smu.source.level = {:.6}", volts))
    }

    pub fn set_output(&mut self, on: bool) -> Result<()> {
        let state = if on { "smu.ON" } else { "smu.OFF" };
        self.inst.write(&format!("smu.source.output = {}", state))
    }

    /// Takes one reading and returns the sourced voltage and measured current
    /// of the newest buffer entry.
    pub fn measure(&mut self) -> Result<(f64, f64)> {
        self.inst.write("smu.measure.read()")?;
        let volts = parse_number(&self.inst.query("print(defbuffer1.sourcevalues[defbuffer1.n])")?)?;
        let amps = parse_number(&self.inst.query("print(defbuffer1[defbuffer1.n])")?)?;
        trace!("K2450 reading {} V, {} A", volts, amps);
        Ok((volts, amps))
    }
}
