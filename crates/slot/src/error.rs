//! Slot negotiation error types.

/// Errors produced while requesting an upload slot.
#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("no upload service available")]
    NoService,

    #[error(
        "upload slot rejected by {host}: {}",
        .message.as_deref().unwrap_or("no reason given")
    )]
    Rejected {
        host: String,
        /// Text the peer attached to its error, verbatim.
        message: Option<String>,
    },

    #[error("invalid slot response from {host}: {reason}")]
    Protocol { host: String, reason: String },

    #[error("invalid slot URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("signaling channel error: {0}")]
    Channel(String),
}

impl SlotError {
    /// Peer-supplied rejection text, if the service gave one.
    pub fn peer_message(&self) -> Option<&str> {
        match self {
            Self::Rejected { message, .. } => message.as_deref(),
            _ => None,
        }
    }
}
