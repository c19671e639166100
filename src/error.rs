use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Hardware/software codec session creation or submission failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// Malformed packet, unknown tag or truncated NAL unit
    #[error("Parse error: {0}")]
    Parse(String),

    /// Send failed or no connected peer
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invitation rejected, timed out or could not be issued
    #[error("Handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    /// Peer stopped answering keep-alives
    #[error("Peer {peer} unreachable: liveness timeout")]
    LivenessTimeout { peer: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error category used for logging and propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Codec,
    Parse,
    Transport,
    Handshake,
    Liveness,
    Other,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Codec(_) => ErrorKind::Codec,
            AppError::Parse(_) => ErrorKind::Parse,
            AppError::Transport(_) => ErrorKind::Transport,
            AppError::Handshake { .. } => ErrorKind::Handshake,
            AppError::LivenessTimeout { .. } => ErrorKind::Liveness,
            _ => ErrorKind::Other,
        }
    }

    /// Whether this error must reach the caller.
    ///
    /// Codec, parse and transport errors are logged and dropped where they
    /// occur; only handshake and liveness failures need an app-level decision.
    pub fn propagates(&self) -> bool {
        matches!(self.kind(), ErrorKind::Handshake | ErrorKind::Liveness)
    }

    pub fn handshake(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Handshake {
            peer: peer.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
