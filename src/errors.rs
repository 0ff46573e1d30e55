use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("link not ready: {0}")]
    NotReady(String),
}

/// Failures while establishing the link. All of them end the run.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("peripheral returned a non-ready banner: {0:?}")]
    UnexpectedBanner(String),
    #[error("peripheral did not answer the hello byte")]
    NoResponse,
    #[error("peripheral answered the hello byte with {0:#04X}")]
    UnexpectedResponse(u8),
    #[error("io error during handshake: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown tag byte {0:#04X}")]
    UnknownTag(u8),
    #[error("serial stream closed while waiting for data")]
    StreamClosed,
    #[error("timestamp went backwards: {current} after {previous}")]
    TimestampDesync { previous: u32, current: u32 },
    #[error("unsupported timestamp width {0} (must be 1-4 bytes)")]
    InvalidWidth(usize),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Whether the error leaves the link usable for the next trial.
    pub fn is_trial_local(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownTag(_) | ProtocolError::TimestampDesync { .. }
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScoreError {
    #[error("need at least 2 continuation taps to score, found {found}")]
    InsufficientData { found: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid trial parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;
