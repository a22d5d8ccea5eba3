//! Serial temperature sensor.
//!
//! The sensor MCU prints one reading per line. [`TemperatureReader::read`]
//! never blocks: it returns whatever complete lines arrived since the last
//! call. The first partial line after opening the port is discarded, as is
//! a line that grows past [`MAX_PENDING`] bytes.

use std::io::{self, Read};
use std::time::Duration;

use log::*;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::error::Result;
use crate::instrument::block::parse_number;

/// Longest partial line kept while waiting for its line break.
pub const MAX_PENDING: usize = 4096;

/// Anything that can hand over the bytes received so far without waiting.
pub trait ByteSource {
    fn read_available(&mut self) -> io::Result<Vec<u8>>;
}

impl ByteSource for Box<dyn SerialPort> {
    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        let waiting = self.bytes_to_read()? as usize;
        let mut buf = vec![0_u8; waiting];
        if waiting > 0 {
            self.read_exact(&mut buf)?;
        }
        Ok(buf)
    }
}

pub trait TemperatureSource {
    /// Readings received since the previous call, possibly none.
    fn read(&mut self) -> Result<Vec<f64>>;
}

pub struct TemperatureReader<S: ByteSource> {
    source: S,
    synced: bool,
    buffer: Vec<u8>,
}

impl TemperatureReader<Box<dyn SerialPort>> {
    /// Opens `port` 8N1 without flow control. DTR and RTS are held low so
    /// the sensor MCU is not reset and a JTAG session on it survives.
    pub fn open(port: &str, baud_rate: u32) -> Result<Self> {
        let mut serial = serialport::new(port, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::ZERO)
            .open()?;
        serial.write_data_terminal_ready(false)?;
        serial.write_request_to_send(false)?;
        info!("Temperature sensor on {} at {} baud", port, baud_rate);
        Ok(TemperatureReader::new(serial))
    }
}

impl<S: ByteSource> TemperatureReader<S> {
    pub fn new(source: S) -> Self {
        TemperatureReader {
            source,
            synced: false,
            buffer: Vec::new(),
        }
    }

    /// Drops everything received so far, including partial lines.
    pub fn discard(&mut self) -> Result<()> {
        let _ = self.read()?;
        Ok(())
    }

    fn take_lines(&mut self) -> Vec<f64> {
        if !self.synced {
            match self.buffer.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    self.buffer.drain(..=idx);
                    self.synced = true;
                }
                None => {
                    self.limit_pending();
                    return Vec::new();
                }
            }
        }

        let readings = match self.buffer.iter().rposition(|&b| b == b'\n') {
            Some(end) => {
                let readings = parse_readings(&String::from_utf8_lossy(&self.buffer[..end]));
                self.buffer.drain(..=end);
                readings
            }
            None => Vec::new(),
        };
        self.limit_pending();
        readings
    }

    /// Drops a partial line that outgrew [`MAX_PENDING`] and resynchronises
    /// on the next line break.
    fn limit_pending(&mut self) {
        if self.buffer.len() > MAX_PENDING {
            warn!("Dropping {} bytes without a line break", self.buffer.len());
            self.buffer.clear();
            self.synced = false;
        }
    }
}

fn parse_readings(text: &str) -> Vec<f64> {
    text.split_whitespace()
        .filter_map(|token| match parse_number(token) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring temperature record {:?}", token);
                None
            }
        })
        .collect()
}

impl<S: ByteSource> TemperatureSource for TemperatureReader<S> {
    fn read(&mut self) -> Result<Vec<f64>> {
        let bytes = self.source.read_available()?;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        self.buffer.extend_from_slice(&bytes);
        Ok(self.take_lines())
    }
}

/// Mean of the readings, NaN when there are none.
pub fn mean_reading(readings: &[f64]) -> f64 {
    if readings.is_empty() {
        f64::NAN
    } else {
        readings.iter().sum::<f64>() / readings.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out one scripted burst per call.
    struct Bursts(VecDeque<Vec<u8>>);

    impl ByteSource for Bursts {
        fn read_available(&mut self) -> io::Result<Vec<u8>> {
            Ok(self.0.pop_front().unwrap_or_default())
        }
    }

    fn raw_reader(bursts: Vec<Vec<u8>>) -> TemperatureReader<Bursts> {
        TemperatureReader::new(Bursts(bursts.into()))
    }

    fn reader(bursts: &[&str]) -> TemperatureReader<Bursts> {
        raw_reader(bursts.iter().map(|b| b.as_bytes().to_vec()).collect())
    }

    #[test]
    fn drops_partial_first_line() {
        let mut r = reader(&["3.1234\n25.0001\n25.0", "002\n"]);
        assert_eq!(r.read().unwrap(), vec![25.0001]);
        assert_eq!(r.read().unwrap(), vec![25.0002]);
    }

    #[test]
    fn waits_for_first_newline() {
        let mut r = reader(&["12.5", "3", "4\n21.5\n"]);
        assert!(r.read().unwrap().is_empty());
        assert!(r.read().unwrap().is_empty());
        assert_eq!(r.read().unwrap(), vec![21.5]);
    }

    #[test]
    fn nothing_waiting_yields_nothing() {
        let mut r = reader(&[]);
        assert!(r.read().unwrap().is_empty());
    }

    #[test]
    fn several_lines_in_one_burst() {
        let mut r = reader(&["x\n20.0\r\n20.5\n21.0\n21"]);
        assert_eq!(r.read().unwrap(), vec![20.0, 20.5, 21.0]);
    }

    #[test]
    fn garbage_tokens_are_skipped() {
        let mut r = reader(&["\nboot\n22.25\n"]);
        assert_eq!(r.read().unwrap(), vec![22.25]);
    }

    #[test]
    fn character_split_across_bursts() {
        // U+00A0 (no-break space) arrives one byte per burst.
        let mut r = raw_reader(vec![b"\n22.5\xc2".to_vec(), b"\xa023.0\n".to_vec()]);
        assert!(r.read().unwrap().is_empty());
        assert_eq!(r.read().unwrap(), vec![22.5, 23.0]);
    }

    #[test]
    fn endless_line_is_dropped() {
        let mut r = raw_reader(vec![
            b"\n".to_vec(),
            vec![b'7'; MAX_PENDING / 2],
            vec![b'7'; MAX_PENDING],
            b"77\n24.0\n".to_vec(),
        ]);
        assert!(r.read().unwrap().is_empty());
        assert!(r.read().unwrap().is_empty());
        assert_eq!(r.buffer.len(), MAX_PENDING / 2);
        assert!(r.read().unwrap().is_empty());
        assert!(r.buffer.is_empty());
        // The tail of the dropped line is skipped up to its line break.
        assert_eq!(r.read().unwrap(), vec![24.0]);
        assert!(r.buffer.is_empty());
    }

    #[test]
    fn mean_of_nothing_is_nan() {
        assert!(mean_reading(&[]).is_nan());
        assert_eq!(mean_reading(&[1.0, 2.0, 3.0]), 2.0);
    }
}
