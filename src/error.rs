//! Errors surfaced by the impairment engine.
//!
//! Most runtime faults (a lost packet read, a failed probe, an unwritable log
//! row) are logged and absorbed by the loop that hit them. Only three things
//! reach a caller as a [`ShaperError`]:
//! - the host's capture backend refusing to open in [`crate::Engine::start`]
//! - a session log that cannot be created or written through [`crate::metrics::CsvLog`]
//! - a preset name that does not parse

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ShaperError {
    /// Capture could not be opened for the target selector. Carries the
    /// backend's full context chain.
    #[error("{0}")]
    Capture(String),

    /// The CSV writer rejected a record or flush.
    #[error("{0}")]
    Logging(String),

    /// Log directory, rotation or file open failed.
    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    InvalidInput(String),
}

/// Wire shape shown to a settings surface.
#[derive(Serialize)]
struct Report<'a> {
    kind: &'static str,
    message: &'a str,
}

impl ShaperError {
    /// Variant name, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Capture(_) => "Capture",
            Self::Logging(_) => "Logging",
            Self::Io(_) => "Io",
            Self::InvalidInput(_) => "InvalidInput",
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::Capture(m) | Self::Logging(m) | Self::Io(m) | Self::InvalidInput(m) => m,
        }
    }
}

impl Serialize for ShaperError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Report {
            kind: self.kind(),
            message: self.message(),
        }
        .serialize(serializer)
    }
}

/// Capture backends report through `anyhow`.
impl From<anyhow::Error> for ShaperError {
    fn from(err: anyhow::Error) -> Self {
        Self::Capture(format!("{err:#}"))
    }
}

impl From<std::io::Error> for ShaperError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<csv::Error> for ShaperError {
    fn from(err: csv::Error) -> Self {
        Self::Logging(err.to_string())
    }
}
