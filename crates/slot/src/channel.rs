//! Signaling channel trait and upload service discovery.

use std::future::Future;
use std::pin::Pin;

use courier_protocol::Iq;
use courier_protocol::constants::{NS_HTTP_UPLOAD, NS_HTTP_UPLOAD_LEGACY};

use crate::error::SlotError;

/// Upload slot dialect spoken by a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Current,
    Legacy,
}

impl Dialect {
    pub fn namespace(self) -> &'static str {
        match self {
            Self::Current => NS_HTTP_UPLOAD,
            Self::Legacy => NS_HTTP_UPLOAD_LEGACY,
        }
    }

    pub fn from_namespace(ns: &str) -> Option<Self> {
        match ns {
            NS_HTTP_UPLOAD => Some(Self::Current),
            NS_HTTP_UPLOAD_LEGACY => Some(Self::Legacy),
            _ => None,
        }
    }
}

/// An upload service found through capability discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadService {
    /// Address the slot request is sent to.
    pub host: String,
    pub dialect: Dialect,
}

impl UploadService {
    /// Picks the service to use from discovered `(host, features)` pairs.
    ///
    /// A host advertising the current namespace wins over any host that only
    /// speaks the legacy one. Among equals the first listed host wins.
    pub fn discover<'a, I, F>(candidates: I) -> Option<Self>
    where
        I: IntoIterator<Item = (&'a str, F)>,
        F: IntoIterator<Item = &'a str>,
    {
        let mut legacy = None;
        for (host, features) in candidates {
            let mut has_legacy = false;
            for feature in features {
                match Dialect::from_namespace(feature) {
                    Some(Dialect::Current) => {
                        return Some(Self {
                            host: host.to_string(),
                            dialect: Dialect::Current,
                        });
                    }
                    Some(Dialect::Legacy) => has_legacy = true,
                    None => {}
                }
            }
            if has_legacy && legacy.is_none() {
                legacy = Some(Self {
                    host: host.to_string(),
                    dialect: Dialect::Legacy,
                });
            }
        }
        legacy
    }
}

/// The signaling layer as seen by slot negotiation.
///
/// Implemented by the chat client on top of its XML stream. Using a trait
/// keeps negotiation testable without a server.
pub trait SignalingChannel: Send + Sync {
    /// The upload service found through capability discovery, if any.
    fn upload_service(&self) -> Option<UploadService>;

    /// Sends an IQ request and resolves with the matching response
    /// (`result` or `error`). Transport failures map to [`SlotError::Channel`].
    fn send_iq(&self, iq: Iq) -> Pin<Box<dyn Future<Output = Result<Iq, SlotError>> + Send + '_>>;
}
