//! Heat maps of a converter efficiency map over load current (log) and
//! input voltage.

use std::path::{Path, PathBuf};

use log::*;
use plotters::prelude::*;

use super::colormap::{Colormap, Norm};
use super::{prepare_output, sibling, CAPTION_FONT, LABEL_FONT};
use crate::error::{Error, Result};
use crate::experiment::converter::EfficiencyMap;
use crate::metric::metric;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Efficiency,
    InputPower,
    OutputVoltage,
}

impl Quantity {
    pub const ALL: [Quantity; 3] = [Quantity::Efficiency, Quantity::InputPower, Quantity::OutputVoltage];

    pub fn label(self) -> &'static str {
        match self {
            Quantity::Efficiency => "Efficiency",
            Quantity::InputPower => "Input power (W)",
            Quantity::OutputVoltage => "Output voltage (V)",
        }
    }

    pub fn colormap(self) -> Colormap {
        match self {
            Quantity::OutputVoltage => Colormap::Seismic,
            _ => Colormap::Inferno,
        }
    }

    pub fn norm(self) -> Norm {
        match self {
            Quantity::Efficiency => Norm::Linear { lo: 0.0, hi: 1.0 },
            Quantity::InputPower => Norm::Log { lo: 0.001, hi: 15.0 },
            Quantity::OutputVoltage => Norm::Linear { lo: 4.9, hi: 5.1 },
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Quantity::Efficiency => "_Efficiency",
            Quantity::InputPower => "_Power",
            Quantity::OutputVoltage => "_Voltage",
        }
    }
}

/// Row-major `[v][i]` values of `quantity`. Unmeasured cells and cells
/// where the quantity is zero are `None`.
pub fn grid(map: &EfficiencyMap, quantity: Quantity) -> Vec<Option<f64>> {
    let mut cells = Vec::with_capacity(map.v_table.len() * map.i_table.len());
    for vi in 0..map.v_table.len() {
        for ii in 0..map.i_table.len() {
            let value = map.point(vi, ii).and_then(|p| {
                let x = match quantity {
                    Quantity::Efficiency if p.input_power() == 0.0 => return None,
                    Quantity::Efficiency => p.efficiency(),
                    Quantity::InputPower => p.input_power(),
                    Quantity::OutputVoltage => p.v_out,
                };
                (x != 0.0 && x.is_finite()).then_some(x)
            });
            cells.push(value);
        }
    }
    cells
}

/// Cell boundaries around `centers`: midpoints between neighbours, the
/// outer cells mirrored. Midpoints are geometric when `log` is set.
pub fn cell_edges(centers: &[f64], log: bool) -> Vec<f64> {
    let (fwd, inv): (fn(f64) -> f64, fn(f64) -> f64) = if log {
        (f64::ln, f64::exp)
    } else {
        (|x| x, |x| x)
    };
    let c: Vec<f64> = centers.iter().map(|&x| fwd(x)).collect();
    match c.len() {
        0 => Vec::new(),
        1 => vec![inv(c[0] - 0.5), inv(c[0] + 0.5)],
        n => {
            let mut edges = Vec::with_capacity(n + 1);
            edges.push(c[0] - (c[1] - c[0]) / 2.0);
            edges.extend(c.windows(2).map(|w| (w[0] + w[1]) / 2.0));
            edges.push(c[n - 1] + (c[n - 1] - c[n - 2]) / 2.0);
            edges.into_iter().map(inv).collect()
        }
    }
}

/// Renders one heat map with its colour bar to `path`.
pub fn render(map: &EfficiencyMap, quantity: Quantity, title: &str, path: &Path, size: (u32, u32)) -> Result<()> {
    let x_edges = cell_edges(&map.i_table, true);
    let y_edges = cell_edges(&map.v_table, false);
    let (Some(&x0), Some(&x1), Some(&y0), Some(&y1)) =
        (x_edges.first(), x_edges.last(), y_edges.first(), y_edges.last())
    else {
        return Err(Error::plot("empty efficiency map"));
    };
    if x0 <= 0.0 {
        return Err(Error::plot("load currents must be positive for a log axis"));
    }

    prepare_output(path)?;
    let root = BitMapBackend::new(path, size).into_drawing_area();
    root.fill(&WHITE)?;
    let (main, bar) = root.split_horizontally(size.0.saturating_sub(110));

    let cmap = quantity.colormap();
    let norm = quantity.norm();

    let mut chart = ChartBuilder::on(&main)
        .caption(title, CAPTION_FONT)
        .margin(10)
        .x_label_area_size(45)
        .y_label_area_size(55)
        .build_cartesian_2d((x0..x1).log_scale(), y0..y1)?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("Iout (A)")
        .y_desc("Vin (V)")
        .x_label_formatter(&|i| metric(*i, 2, ""))
        .axis_desc_style(LABEL_FONT)
        .draw()?;

    let cells = grid(map, quantity);
    let n_i = map.i_table.len();
    chart.draw_series(cells.iter().enumerate().filter_map(|(k, value)| {
        let (vi, ii) = (k / n_i, k % n_i);
        value.map(|x| {
            Rectangle::new(
                [(x_edges[ii], y_edges[vi]), (x_edges[ii + 1], y_edges[vi + 1])],
                cmap.color(norm.unit(x)).filled(),
            )
        })
    }))?;

    let mut scale = ChartBuilder::on(&bar)
        .margin_top(40)
        .margin_bottom(55)
        .margin_right(10)
        .y_label_area_size(60)
        .build_cartesian_2d(0.0..1.0, 0.0..1.0)?;
    scale
        .configure_mesh()
        .disable_mesh()
        .disable_x_axis()
        .y_desc(quantity.label())
        .y_label_formatter(&|u| format!("{:.3}", norm.value(*u)))
        .draw()?;
    const STEPS: usize = 100;
    scale.draw_series((0..STEPS).map(|k| {
        let lo = k as f64 / STEPS as f64;
        let hi = (k + 1) as f64 / STEPS as f64;
        Rectangle::new([(0.0, lo), (1.0, hi)], cmap.color((lo + hi) / 2.0).filled())
    }))?;

    root.present()?;
    info!("Saved {}", path.display());
    Ok(())
}

/// Efficiency, input power and output voltage maps next to `input`.
pub fn render_all(map: &EfficiencyMap, input: &Path, title: &str, size: (u32, u32)) -> Result<Vec<PathBuf>> {
    Quantity::ALL
        .iter()
        .map(|&q| {
            let path = sibling(input, q.suffix());
            render(map, q, title, &path, size).map(|_| path)
        })
        .collect()
}
