//! DC-DC converter efficiency map.
//!
//! The Keithley 2450 supplies the converter input, the NGU401 sinks the load
//! current in current priority. For every load current the input voltage is
//! swept from the top of its range down until the output drops out of
//! regulation or the input current exceeds its limit.

use log::*;

use crate::archive::{Archive, NdArray};
use crate::config::ConverterConfig;
use crate::error::{Error, Result};
use crate::instrument::{Instrument, Keithley2450, Level, Ngu401, Priority};
use crate::metric::metric;
use crate::signal::{geomspace, linspace};
use crate::util::{secs, Clock};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperatingPoint {
    pub v_in: f64,
    pub i_in: f64,
    pub v_out: f64,
    pub i_out: f64,
}

impl OperatingPoint {
    pub fn input_power(&self) -> f64 {
        self.v_in * self.i_in
    }

    pub fn output_power(&self) -> f64 {
        self.v_out * self.i_out
    }

    /// NaN when no input power was measured.
    pub fn efficiency(&self) -> f64 {
        let p_in = self.input_power();
        if p_in == 0.0 {
            f64::NAN
        } else {
            self.output_power() / p_in
        }
    }
}

/// Operating points over the input voltage × load current grid. Cells the
/// sweep never reached stay all zero.
#[derive(Debug, Clone, PartialEq)]
pub struct EfficiencyMap {
    pub v_table: Vec<f64>,
    pub i_table: Vec<f64>,
    data: Vec<f64>,
}

impl EfficiencyMap {
    pub fn new(v_table: Vec<f64>, i_table: Vec<f64>) -> Self {
        let data = vec![0.0; v_table.len() * i_table.len() * 4];
        EfficiencyMap {
            v_table,
            i_table,
            data,
        }
    }

    fn offset(&self, vi: usize, ii: usize) -> usize {
        (vi * self.i_table.len() + ii) * 4
    }

    pub fn set(&mut self, vi: usize, ii: usize, point: &OperatingPoint) {
        let o = self.offset(vi, ii);
        self.data[o..o + 4].copy_from_slice(&[point.v_in, point.i_in, point.v_out, point.i_out]);
    }

    pub fn point(&self, vi: usize, ii: usize) -> Option<OperatingPoint> {
        if vi >= self.v_table.len() || ii >= self.i_table.len() {
            return None;
        }
        let o = self.offset(vi, ii);
        let cell = &self.data[o..o + 4];
        if cell.iter().all(|&x| x == 0.0) {
            return None;
        }
        Some(OperatingPoint {
            v_in: cell[0],
            i_in: cell[1],
            v_out: cell[2],
            i_out: cell[3],
        })
    }

    pub fn measured(&self) -> usize {
        (0..self.v_table.len())
            .flat_map(|vi| (0..self.i_table.len()).map(move |ii| (vi, ii)))
            .filter(|&(vi, ii)| self.point(vi, ii).is_some())
            .count()
    }

    /// `data` of shape `[v, i, 4]` holding vin, iin, vout, iout, plus the
    /// two sweep tables.
    pub fn into_archive(self) -> Result<Archive> {
        let shape = vec![self.v_table.len(), self.i_table.len(), 4];
        let mut archive = Archive::new();
        archive
            .insert("data", NdArray::new(shape, self.data)?)
            .insert("vTable", self.v_table)
            .insert("iTable", self.i_table);
        Ok(archive)
    }

    pub fn from_archive(archive: &Archive) -> Result<Self> {
        let data = archive.require("data")?;
        let v_table = archive.vector("vTable")?.to_vec();
        let i_table = archive.vector("iTable")?.to_vec();
        if data.shape() != [v_table.len(), i_table.len(), 4] {
            return Err(Error::archive(format!(
                "data of shape {:?} does not match {} × {} tables",
                data.shape(),
                v_table.len(),
                i_table.len()
            )));
        }
        Ok(EfficiencyMap {
            v_table,
            i_table,
            data: data.data().to_vec(),
        })
    }
}

fn setup_load<I: Instrument>(load: &mut Ngu401<I>, cfg: &ConverterConfig, first_current: f64) -> Result<()> {
    load.reset()?;
    load.set_priority(Priority::Current)?;
    load.set_voltage_range(cfg.load_voltage_range)?;
    load.set_negative_voltage(Level::Value(0.0))?;
    load.set_voltage(Level::Value(cfg.load_voltage))?;
    load.inner_mut().wait_complete()?;
    load.set_current_range(first_current)?;
    load.set_current(Level::Value(-first_current))?;
    load.configure_sense(cfg.load_nplc)?;
    load.set_output(true)?;
    load.inner_mut().wait_complete()
}

pub fn sweep<I: Instrument, J: Instrument, C: Clock>(
    source: &mut Keithley2450<I>,
    load: &mut Ngu401<J>,
    clock: &mut C,
    cfg: &ConverterConfig,
) -> Result<EfficiencyMap> {
    let v_table = linspace(cfg.v_range[0], cfg.v_range[1], cfg.v_steps);
    let i_table = geomspace(cfg.i_range[0], cfg.i_range[1], cfg.i_steps);
    let mut map = EfficiencyMap::new(v_table.clone(), i_table.clone());

    source.reset()?;
    source.configure_voltage_source(cfg.source_current_limit, cfg.source_filter_count)?;
    setup_load(load, cfg, i_table.first().copied().unwrap_or(0.0))?;

    for (ii, &i_set) in i_table.iter().enumerate() {
        load.set_current_range(i_set)?;
        clock.sleep(secs(cfg.range_settle_s));
        load.set_current(Level::Value(-i_set))?;

        for vi in (0..v_table.len()).rev() {
            source.set_level(v_table[vi])?;
            clock.sleep(secs(cfg.measurement_delay_s));

            let (v_in, i_in) = source.measure()?;
            let (v_out, i_sink) = load.measure()?;
            let point = OperatingPoint {
                v_in,
                i_in,
                v_out,
                i_out: -i_sink,
            };

            info!(
                "Input: {}, {}, {}, Output: {}, {}, {}, Efficiency: {:.1}%",
                metric(v_in, 3, "V"),
                metric(i_in, 3, "A"),
                metric(point.input_power(), 3, "W"),
                metric(v_out, 3, "V"),
                metric(point.i_out, 3, "A"),
                metric(point.output_power(), 3, "W"),
                100.0 * point.efficiency()
            );

            if v_out < cfg.v_limit || i_in > cfg.i_limit {
                info!(
                    "Limit reached at {} in, {} load",
                    metric(v_in, 3, "V"),
                    metric(i_set, 3, "A")
                );
                break;
            }
            map.set(vi, ii, &point);
        }
    }

    load.set_output(false)?;
    source.set_output(false)?;
    Ok(map)
}
