//! Error type shared by the instrument drivers, the archive codec and the
//! plotting code.
//!
//! Transport failures and malformed instrument replies abort the running
//! procedure. Data loss reported by the instrument is not an error: it is a
//! capture outcome (see [`crate::capture::CaptureOutcome`]) so the partial
//! record can still be saved.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Cannot parse instrument reply: {0}")]
    Parse(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Zip container error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Plot error: {0}")]
    Plot(String),
}

impl<E: std::error::Error + Send + Sync> From<plotters::drawing::DrawingAreaErrorKind<E>> for Error {
    fn from(err: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        Error::Plot(err.to_string())
    }
}

impl Error {
    pub(crate) fn parse(what: impl Into<String>) -> Self {
        Error::Parse(what.into())
    }

    pub(crate) fn archive(what: impl Into<String>) -> Self {
        Error::Archive(what.into())
    }

    pub(crate) fn plot(what: impl Into<String>) -> Self {
        Error::Plot(what.into())
    }

    pub(crate) fn invalid(what: impl Into<String>) -> Self {
        Error::Invalid(what.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Instrument("no response to *IDN?".to_string());
        assert_eq!(err.to_string(), "Instrument error: no response to *IDN?");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        let err: Error = io.into();
        assert!(err.to_string().contains("read timed out"));
    }
}
