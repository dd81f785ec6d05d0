//! Transfer error types and their user-facing categories.

use std::error::Error as _;
use std::time::Duration;

use courier_slot::SlotError;
use courier_transfer::TransferError;

/// Network-level failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Host name could not be resolved.
    Dns,
    /// Connection refused or otherwise not established.
    Connect,
    Timeout,
    Other,
}

/// Errors produced by the upload and download pipelines.
#[derive(Debug, thiserror::Error)]
pub enum HttpTransferError {
    #[error("slot negotiation failed: {0}")]
    Negotiation(#[from] SlotError),

    #[error("size probe failed: {0}")]
    Probe(String),

    #[error("integrity check failed: expected {expected} bytes, got {actual}")]
    Integrity { expected: u64, actual: u64 },

    #[error("remote size changed to {0} bytes")]
    SizeChanged(u64),

    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("transport error ({kind:?}): {message}")]
    Transport { kind: TransportKind, message: String },

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("unexpected HTTP status {code}")]
    Status { code: u16 },

    #[error("crypto error: {0}")]
    Crypto(#[from] TransferError),

    #[error("cancelled")]
    Cancelled,

    #[error("upload stalled for {0:?}")]
    WriteStalled(Duration),
}

/// User-facing failure categories, one message each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    ServerNotFound,
    CouldNotConnect,
    WriteFailed,
    IntegrityViolation,
    FileNotFound,
}

impl HttpTransferError {
    /// Category shown to the user. `None` for cancellation, which is silent.
    pub fn category(&self) -> Option<ErrorCategory> {
        let category = match self {
            Self::Cancelled => return None,
            Self::Transport {
                kind: TransportKind::Dns,
                ..
            } => ErrorCategory::ServerNotFound,
            Self::Transport {
                kind: TransportKind::Connect | TransportKind::Timeout,
                ..
            }
            | Self::Tls(_)
            | Self::WriteStalled(_) => ErrorCategory::CouldNotConnect,
            Self::Write(_) | Self::Crypto(TransferError::Io(_)) => ErrorCategory::WriteFailed,
            Self::Integrity { .. } | Self::SizeChanged(_) | Self::Crypto(_) => {
                ErrorCategory::IntegrityViolation
            }
            Self::Negotiation(_)
            | Self::Probe(_)
            | Self::Status { .. }
            | Self::Transport {
                kind: TransportKind::Other,
                ..
            } => ErrorCategory::FileNotFound,
        };
        Some(category)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<reqwest::Error> for HttpTransferError {
    fn from(err: reqwest::Error) -> Self {
        classify(&err)
    }
}

/// Flattens an error and its sources into one line.
fn error_chain(err: &reqwest::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        out.push_str(": ");
        out.push_str(&e.to_string());
        source = e.source();
    }
    out
}

/// Verdict for an I/O error found in a reqwest source chain. rustls reports
/// handshake failures as `InvalidData`, which only means TLS while the
/// connection is being set up.
fn classify_io(
    kind: std::io::ErrorKind,
    connecting: bool,
    message: &str,
) -> Option<HttpTransferError> {
    let transport = |kind| HttpTransferError::Transport {
        kind,
        message: message.to_string(),
    };
    match kind {
        std::io::ErrorKind::ConnectionRefused => Some(transport(TransportKind::Connect)),
        std::io::ErrorKind::TimedOut => Some(transport(TransportKind::Timeout)),
        std::io::ErrorKind::InvalidData if connecting => {
            Some(HttpTransferError::Tls(message.to_string()))
        }
        _ => None,
    }
}

/// Maps a reqwest failure onto the transfer taxonomy.
///
/// TLS failures surface from rustls as `InvalidData` I/O errors somewhere in
/// the source chain; resolver failures only by their message.
pub fn classify(err: &reqwest::Error) -> HttpTransferError {
    let message = error_chain(err);
    let transport = |kind| HttpTransferError::Transport {
        kind,
        message: message.clone(),
    };

    if err.is_timeout() {
        return transport(TransportKind::Timeout);
    }

    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(verdict) = e
            .downcast_ref::<std::io::Error>()
            .and_then(|io| classify_io(io.kind(), err.is_connect(), &message))
        {
            return verdict;
        }
        source = e.source();
    }

    let lower = message.to_ascii_lowercase();
    if lower.contains("dns error")
        || lower.contains("failed to lookup address")
        || lower.contains("name or service not known")
    {
        transport(TransportKind::Dns)
    } else if lower.contains("certificate") || lower.contains("handshake") {
        HttpTransferError::Tls(message.clone())
    } else if err.is_connect() {
        transport(TransportKind::Connect)
    } else {
        transport(TransportKind::Other)
    }
}
