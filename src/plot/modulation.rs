//! Modulation input response: the recorded output voltage over time.

use std::path::{Path, PathBuf};

use log::*;
use plotters::prelude::*;

use super::{padded_range, points, prepare_output, sibling, style, CAPTION_FONT, LABEL_FONT};
use crate::archive::load_npy;
use crate::error::{Error, Result};
use crate::signal::time_axis;

/// Sample times in milliseconds at the calibrated FastLog rate.
pub fn time_ms(n: usize, rate: f64) -> Vec<f64> {
    time_axis(n, rate).into_iter().map(|t| t * 1000.0).collect()
}

pub fn render(voltage: &[f64], rate: f64, title: &str, path: &Path, size: (u32, u32)) -> Result<()> {
    let t = time_ms(voltage.len(), rate);

    prepare_output(path)?;
    let root = BitMapBackend::new(path, size).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(title, CAPTION_FONT)
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(padded_range(t.iter()), padded_range(voltage.iter()))?;
    chart
        .configure_mesh()
        .x_desc("Time (ms)")
        .y_desc("Voltage (V)")
        .axis_desc_style(LABEL_FONT)
        .draw()?;
    chart.draw_series(LineSeries::new(points(&t, voltage), style(0)))?;

    root.present()?;
    info!("Saved {}", path.display());
    Ok(())
}

/// Plots a saved modulation record to `<stem>.png` next to it.
pub fn render_file(input: &Path, rate: f64, title: &str, size: (u32, u32)) -> Result<PathBuf> {
    let array = load_npy(input)?;
    if array.shape().len() != 1 {
        return Err(Error::archive(format!(
            "{}: expected a 1-D voltage array, got shape {:?}",
            input.display(),
            array.shape()
        )));
    }
    let path = sibling(input, "");
    render(array.data(), rate, title, &path, size)?;
    Ok(path)
}
