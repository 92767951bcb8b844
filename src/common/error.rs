use std::net::IpAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported security type: {0}")]
    UnsupportedSecurityType(String),

    #[error("bad length chunk: length={length}, padding={padding}")]
    BadLengthChunk { length: u16, padding: usize },

    #[error("AEAD authentication failed")]
    AeadAuthFailed,

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("replayed auth id")]
    ReplayedAuthId,

    #[error("max ip sessions exceeded for {0}")]
    MaxIpSessionsExceeded(IpAddr),

    #[error("fqdn destination not supported")]
    FqdnUnsupported,

    #[error("flow mismatch: expected {expected}, got {got}")]
    FlowMismatch { expected: String, got: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io) => io,
            Error::AeadAuthFailed | Error::BadLengthChunk { .. } => {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
            }
            other => std::io::Error::other(other.to_string()),
        }
    }
}
