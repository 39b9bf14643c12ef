use crate::parser::ParseError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed request: {0}")]
    Parse(#[from] ParseError),

    #[error("Unable to connect to {target}: {reason}")]
    UpstreamConnect { target: String, reason: String },

    #[error("Unsupported request target: {0}")]
    UnsupportedMethodShape(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),
}

impl ProxyError {
    /// Errors that mean a peer went away. These end the session quietly.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }

    /// Errors after which the client gets no response at all.
    pub fn closes_silently(&self) -> bool {
        matches!(
            self,
            ProxyError::Parse(_) | ProxyError::UnsupportedMethodShape(_) | ProxyError::Url(_)
        )
    }
}
