//! Bench automation for an R&S NGU401 SMU and a Keithley 2450: streaming
//! FastLog captures, the experiment procedures built on them, and the plots
//! made from their archives.

pub mod archive;
pub mod capture;
pub mod config;
pub mod error;
pub mod experiment;
pub mod instrument;
pub mod metric;
pub mod plot;
pub mod signal;
pub mod temperature;
pub mod util;

pub use error::{Error, Result};
