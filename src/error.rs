use thiserror::Error;

/// An error that can be provided to consumers
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file is missing, unparseable or carries an out-of-range value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serial error
    #[error("Serial error: {0}")]
    Serial(#[from] serial::core::Error),

    /// I/O error (UDP bind, capture file, ...)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The inbound stream stopped producing anything recognizable
    #[error("Protocol desync: {0}")]
    Desync(String),
}

impl Error {
    /// Process exit code mandated for this error kind
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            Error::Serial(_) | Error::Io(_) => 2,
            Error::Desync(_) => 3,
        }
    }
}
