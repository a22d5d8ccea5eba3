//! Temperature chamber controller log: set point and chamber temperature
//! against time.
//!
//! The controller prints one status line per cycle,
//! `t: <s>, T: <°C>, SP: <°C>, Out: <duty>, P: <W>, ...`, mixed with other
//! diagnostics. Only lines starting with `t` are status lines.

use std::path::{Path, PathBuf};

use log::*;
use nom::bytes::complete::tag;
use nom::character::complete::space0;
use nom::number::complete::double;
use nom::sequence::{delimited, tuple};
use nom::IResult;
use plotters::prelude::*;

use super::{legend, padded_range, points, prepare_output, sibling, style, LABEL_FONT};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChamberSample {
    pub time_s: f64,
    pub temperature: f64,
    pub setpoint: f64,
}

fn field<'a>(name: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, f64> {
    delimited(tuple((space0, tag(name), tag(":"), space0)), double, tag(","))
}

/// Parses the leading `t`, `T` and `SP` fields of a status line.
pub fn parse_line(line: &str) -> IResult<&str, ChamberSample> {
    let (rest, (time_s, temperature, setpoint)) =
        tuple((field("t"), field("T"), field("SP")))(line)?;
    Ok((
        rest,
        ChamberSample {
            time_s,
            temperature,
            setpoint,
        },
    ))
}

/// Every status line of `log`. Malformed status lines are skipped with a
/// warning.
pub fn parse_log(log: &str) -> Vec<ChamberSample> {
    log.lines()
        .enumerate()
        .filter(|(_, line)| line.starts_with('t'))
        .filter_map(|(n, line)| match parse_line(line) {
            Ok((_, sample)) => Some(sample),
            Err(e) => {
                warn!("Skipping line {}: {:?}", n + 1, e);
                None
            }
        })
        .collect()
}

pub fn render(samples: &[ChamberSample], path: &Path, size: (u32, u32)) -> Result<()> {
    let hours: Vec<f64> = samples.iter().map(|s| s.time_s / 3600.0).collect();
    let setpoint: Vec<f64> = samples.iter().map(|s| s.setpoint).collect();
    let temperature: Vec<f64> = samples.iter().map(|s| s.temperature).collect();

    prepare_output(path)?;
    let root = BitMapBackend::new(path, size).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(
            padded_range(hours.iter()),
            padded_range(setpoint.iter().chain(&temperature)),
        )?;
    chart
        .configure_mesh()
        .x_desc("Time (h)")
        .y_desc("Temperature (°C)")
        .axis_desc_style(LABEL_FONT)
        .draw()?;

    for (k, (label, values)) in [("Setpoint", &setpoint), ("Temperature", &temperature)]
        .into_iter()
        .enumerate()
    {
        chart
            .draw_series(LineSeries::new(points(&hours, values), style(k)))?
            .label(label)
            .legend(legend(style(k)));
    }
    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .draw()?;

    root.present()?;
    info!("Saved {} ({} samples)", path.display(), samples.len());
    Ok(())
}

/// Plots the log at `input` to `<stem>.png` next to it.
pub fn render_file(input: &Path, size: (u32, u32)) -> Result<PathBuf> {
    let samples = parse_log(&std::fs::read_to_string(input)?);
    let path = sibling(input, "");
    render(&samples, &path, size)?;
    Ok(path)
}
