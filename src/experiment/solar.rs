//! Solar panel I-V curve. The NGU401 sinks the panel current while its
//! voltage is stepped up from short circuit until the panel stops
//! delivering current.

use log::*;

use crate::archive::Archive;
use crate::config::SolarConfig;
use crate::error::Result;
use crate::instrument::{Instrument, Level, Ngu401};
use crate::metric::metric;
use crate::signal::argmax;
use crate::util::{secs, Clock};

/// Voltage and current as seen by the NGU401, so a delivering panel reads
/// as negative current.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolarCurve {
    pub voltage: Vec<f64>,
    pub current: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaxPowerPoint {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

impl SolarCurve {
    pub fn len(&self) -> usize {
        self.voltage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voltage.is_empty()
    }

    /// Open-circuit voltage, the last point of the sweep.
    pub fn open_circuit_voltage(&self) -> Option<f64> {
        self.voltage.last().copied()
    }

    /// Short-circuit current, the first point of the sweep.
    pub fn short_circuit_current(&self) -> Option<f64> {
        self.current.first().map(|i| -i)
    }

    pub fn max_power_point(&self) -> Option<MaxPowerPoint> {
        let power: Vec<f64> = self
            .voltage
            .iter()
            .zip(&self.current)
            .map(|(v, i)| -v * i)
            .collect();
        let k = argmax(&power)?;
        Some(MaxPowerPoint {
            voltage: self.voltage[k],
            current: -self.current[k],
            power: power[k],
        })
    }

    pub fn into_archive(self) -> Archive {
        let mut archive = Archive::new();
        archive.insert("v", self.voltage).insert("i", self.current);
        archive
    }

    pub fn from_archive(archive: &Archive) -> Result<Self> {
        let columns = archive.columns(&["v", "i"])?;
        Ok(SolarCurve {
            voltage: columns[0].to_vec(),
            current: columns[1].to_vec(),
        })
    }
}

pub fn sweep<I: Instrument, C: Clock>(ngu: &mut Ngu401<I>, clock: &mut C, cfg: &SolarConfig) -> Result<SolarCurve> {
    cfg.validate()?;
    ngu.reset()?;
    ngu.set_voltage(Level::Value(0.0))?;
    ngu.set_negative_current(Level::Value(cfg.current_limit))?;
    ngu.set_current(Level::Min)?;
    ngu.configure_sense(cfg.nplc)?;
    ngu.set_output(true)?;
    ngu.inner_mut().wait_complete()?;

    let mut curve = SolarCurve::default();
    let mut step = 0;
    loop {
        // Multiplying avoids drift from summing the step.
        let source = step as f64 * cfg.step;
        if source > cfg.max_voltage {
            break;
        }
        ngu.set_voltage(Level::Value(source))?;
        ngu.inner_mut().wait_complete()?;
        clock.sleep(secs(cfg.settle_s));

        let (v, i) = ngu.measure()?;
        debug!("{}, {}", metric(v, 3, "V"), metric(i, 3, "A"));
        curve.voltage.push(v);
        curve.current.push(i);
        if i > 0.0 {
            break;
        }
        step += 1;
    }
    ngu.set_output(false)?;

    report(&curve);
    Ok(curve)
}

fn report(curve: &SolarCurve) {
    if let (Some(voc), Some(isc)) = (curve.open_circuit_voltage(), curve.short_circuit_current()) {
        info!("Voc: {}, Isc: {}", metric(voc, 3, "V"), metric(isc, 3, "A"));
    }
    if let Some(mpp) = curve.max_power_point() {
        info!(
            "Vmax: {:.2} V, Imax: {:.1} mA, Pmax: {:.1} mW",
            mpp.voltage,
            mpp.current * 1e3,
            mpp.power * 1e3
        );
    }
}
