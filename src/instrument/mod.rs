//! Instrument control channel.
//!
//! Every driver talks to its hardware through [`Instrument`]: plain writes,
//! text queries, binary float queries and the status byte. [`ScpiSocket`] is
//! the network implementation; [`mock::MockInstrument`] stands in for it in
//! tests.

pub mod block;
pub mod k2450;
pub mod mock;
pub mod ngu;
pub mod scpi;

pub use k2450::Keithley2450;
pub use ngu::{ArbPoint, ArbTable, FastLogRate, Level, Ngu401, Priority};
pub use scpi::ScpiSocket;

use crate::error::Result;

/// IEEE 488.2 status byte as configured for FastLog streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusByte(pub u8);

impl StatusByte {
    /// Operation status summary: a FastLog chunk is waiting.
    pub const DATA_READY: u8 = 0x80;
    /// Questionable status summary: FastLog skipped samples.
    pub const DATA_LOST: u8 = 0x08;

    pub fn data_ready(self) -> bool {
        self.0 & Self::DATA_READY != 0
    }

    pub fn data_lost(self) -> bool {
        self.0 & Self::DATA_LOST != 0
    }
}

pub trait Instrument {
    fn write(&mut self, command: &str) -> Result<()>;

    fn query(&mut self, command: &str) -> Result<String>;

    /// Sends `command` and decodes the binary block reply as `f32` values.
    fn query_binary(&mut self, command: &str) -> Result<Vec<f32>>;

    fn read_stb(&mut self) -> Result<StatusByte>;

    /// Clears the instrument status and input queue.
    fn clear(&mut self) -> Result<()> {
        self.write("*CLS")
    }

    /// Blocks until all pending operations have finished.
    fn wait_complete(&mut self) -> Result<()> {
        self.query("*OPC?").map(|_| ())
    }

    fn query_number(&mut self, command: &str) -> Result<f64> {
        let reply = self.query(command)?;
        block::parse_number(&reply)
    }

    fn query_pair(&mut self, command: &str) -> Result<(f64, f64)> {
        let reply = self.query(command)?;
        block::parse_pair(&reply)
    }
}
