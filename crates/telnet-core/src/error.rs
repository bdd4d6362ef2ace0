use thiserror::Error;

/// Errors produced by the telnetd engine and its collaborators.
#[derive(Debug, Error)]
pub enum TelnetError {
    #[error("config error: {0}")]
    Config(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("spawn error: {0}")]
    Spawn(String),

    #[error("resize failed: {0}")]
    Resize(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type TelnetResult<T> = Result<T, TelnetError>;
