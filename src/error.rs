use thiserror::Error;

use crate::state::{ProbeToken, SessionError, TraceResult};

/// Errors surfaced by the trace engine
#[derive(Debug, Error)]
pub enum TraceError {
    /// Unusable interface, capture socket or connection; fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// The traced connection closed or failed mid-probe
    #[error("connection closed after {} hops", .partial.hops.len())]
    ConnectionClosed { partial: Box<TraceResult> },

    /// The session was cancelled from outside
    #[error("trace cancelled after {} hops", .partial.hops.len())]
    Cancelled { partial: Box<TraceResult> },

    #[error("probe token {0} is already pending")]
    TokenCollision(ProbeToken),

    #[error("session state: {0}")]
    State(#[from] SessionError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TraceError {
    /// Hops collected before an abort, if any were kept
    pub fn partial(&self) -> Option<&TraceResult> {
        match self {
            TraceError::ConnectionClosed { partial } | TraceError::Cancelled { partial } => {
                Some(partial.as_ref())
            }
            _ => None,
        }
    }
}
