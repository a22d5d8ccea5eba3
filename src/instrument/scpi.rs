use std::io::prelude::*;
use std::io::BufReader;
use std::net::*;
use std::time::Duration;
use log::*;

use super::block::{block_len, decode_f32_block, parse_number};
use super::{Instrument, StatusByte};
use crate::error::{Error, Result};

const RX_BUF_SIZE: usize = 4096;

/// Raw SCPI socket (port 5025) with newline terminated messages.
pub struct ScpiSocket {
    stream: BufReader<TcpStream>,
    name: String,
}

impl ScpiSocket {

    pub fn connect<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<ScpiSocket> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        let name = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        info!("Connected to {}", name);
        Ok(ScpiSocket {
            stream: BufReader::with_capacity(RX_BUF_SIZE, stream),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let len = self.stream.read_line(&mut line)?;
        if len == 0 {
            return Err(Error::Instrument(format!("{} closed the connection", self.name)));
        }
        Ok(line.trim_end().to_string())
    }

    fn read_block(&mut self) -> Result<Vec<u8>> {
        let mut raw = Vec::with_capacity(RX_BUF_SIZE);
        let mut byte = [0_u8; 1];
        let total = loop {
            self.stream.read_exact(&mut byte)?;
            raw.push(byte[0]);
            if let Some(total) = block_len(&raw)? {
                break total;
            }
        };
        let header = raw.len();
        raw.resize(total, 0);
        self.stream.read_exact(&mut raw[header..])?;
        // Terminating newline after the payload.
        let mut rest = String::new();
        self.stream.read_line(&mut rest)?;
        Ok(raw)
    }
}

impl Instrument for ScpiSocket {
    fn write(&mut self, command: &str) -> Result<()> {
        debug!("{} <- {}", self.name, command);
        let stream = self.stream.get_mut();
        stream.write_all(command.as_bytes())?;
        stream.write_all(b"\n")?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String> {
        self.write(command)?;
        let reply = self.read_line()?;
        debug!("{} -> {}", self.name, reply);
        Ok(reply)
    }

    fn query_binary(&mut self, command: &str) -> Result<Vec<f32>> {
        self.write(command)?;
        let raw = self.read_block()?;
        decode_f32_block(&raw)
    }

    fn read_stb(&mut self) -> Result<StatusByte> {
        let reply = self.query("*STB?")?;
        let value = parse_number(&reply)?;
        Ok(StatusByte(value as u8))
    }
}

impl Drop for ScpiSocket {
    fn drop(&mut self) {
        if let Err(e) = self.stream.get_ref().shutdown(Shutdown::Both) {
            warn!("Closing {} failed: {}", self.name, e);
        }
        info!("Connection to {} closed", self.name);
    }
}
