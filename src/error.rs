use std::fmt;

/// Errors surfaced by the bus session and the polling cycle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error, typically from the serial port communication.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// An error from the `serialport` crate while opening or configuring the line.
    #[cfg(feature = "serialport")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
    /// The startup handshake failed on every attempt.
    #[error("Link initialisation failed after {attempts} attempts")]
    LinkInit { attempts: u32 },
    /// A command could not be written after all retries.
    #[error("Cannot write command '{0}'")]
    WriteFailed(String),
    /// Too many consecutive link failures; the session must be abandoned.
    #[error("{0}")]
    BreakerTripped(Tripped),
    /// The operator asked to stop; the link has been closed.
    #[error("Interrupted")]
    Interrupted,
    /// A record could not be serialised for publishing.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Details of a tripped failure tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tripped {
    pub failures: u32,
    pub threshold: u32,
}

impl fmt::Display for Tripped {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Reached {} consecutive link failures (threshold {})",
            self.failures, self.threshold
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
