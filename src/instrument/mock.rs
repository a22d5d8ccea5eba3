//! Scripted stand-in for a networked instrument.
//!
//! Every command is recorded in [`MockInstrument::log`]. Queries are answered
//! by a responder closure and status bytes are served from a queue, so a
//! capture loop driven by the mock always terminates once the queue is empty.
//! Writes are shown to the responder as well so it can track instrument
//! state such as a programmed level.

use std::collections::VecDeque;

use super::block::{decode_f32_block, parse_list};
use super::{Instrument, StatusByte};
use crate::error::{Error, Result};

pub enum Reply {
    Text(String),
    Block(Vec<u8>),
    Silent,
}

impl Reply {
    pub fn text(s: impl Into<String>) -> Self {
        Reply::Text(s.into())
    }
}

pub struct MockInstrument {
    pub log: Vec<String>,
    responder: Box<dyn FnMut(&str) -> Reply>,
    status: VecDeque<u8>,
}

impl Default for MockInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl MockInstrument {
    /// Answers `*OPC?` with `1` and every other query with `0`.
    pub fn new() -> Self {
        Self::with_responder(|cmd| match cmd {
            "*OPC?" => Reply::text("1"),
            _ => Reply::text("0"),
        })
    }

    pub fn with_responder(responder: impl FnMut(&str) -> Reply + 'static) -> Self {
        MockInstrument {
            log: Vec::new(),
            responder: Box::new(responder),
            status: VecDeque::new(),
        }
    }

    pub fn push_status(&mut self, stb: u8) {
        self.status.push_back(stb);
    }

    /// Number of logged commands equal to `command`.
    pub fn count(&self, command: &str) -> usize {
        self.log.iter().filter(|c| c.as_str() == command).count()
    }

    pub fn sent(&self, command: &str) -> bool {
        self.count(command) > 0
    }

    fn reply(&mut self, command: &str) -> Reply {
        self.log.push(command.to_string());
        (self.responder)(command)
    }
}

fn no_reply(command: &str) -> Error {
    Error::Instrument(format!("no reply to {:?}", command))
}

impl Instrument for MockInstrument {
    fn write(&mut self, command: &str) -> Result<()> {
        self.reply(command);
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String> {
        match self.reply(command) {
            Reply::Text(s) => Ok(s),
            Reply::Block(_) => Err(Error::Instrument(format!(
                "binary reply to text query {:?}",
                command
            ))),
            Reply::Silent => Err(no_reply(command)),
        }
    }

    fn query_binary(&mut self, command: &str) -> Result<Vec<f32>> {
        match self.reply(command) {
            Reply::Block(raw) => decode_f32_block(&raw),
            Reply::Text(s) => Ok(parse_list(&s)?.into_iter().map(|v| v as f32).collect()),
            Reply::Silent => Err(no_reply(command)),
        }
    }

    fn read_stb(&mut self) -> Result<StatusByte> {
        self.status
            .pop_front()
            .map(StatusByte)
            .ok_or_else(|| Error::Instrument("status script exhausted".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::block::encode_f32_block;

    #[test]
    fn records_traffic() {
        let mut mock = MockInstrument::new();
        mock.write("*RST").unwrap();
        mock.wait_complete().unwrap();
        assert_eq!(mock.log, vec!["*RST", "*OPC?"]);
        assert!(mock.sent("*RST"));
    }

    #[test]
    fn serves_binary_blocks() {
        let mut mock = MockInstrument::with_responder(|_| Reply::Block(encode_f32_block(&[1.0, 2.0])));
        assert_eq!(mock.query_binary("FLOG:DATA?").unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn exhausted_status_is_an_error() {
        let mut mock = MockInstrument::new();
        mock.push_status(0x80);
        assert!(mock.read_stb().unwrap().data_ready());
        assert!(mock.read_stb().is_err());
    }
}
