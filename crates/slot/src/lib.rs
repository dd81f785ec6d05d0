//! Upload slot negotiation.
//!
//! Before a file can be PUT to the HTTP host, the upload service reachable
//! over the signaling channel hands out a [`Slot`](courier_protocol::Slot):
//! a put URL, a get URL and a few headers. Two dialects exist, told apart by
//! namespace:
//!
//! - **current** (`urn:xmpp:http:upload:0`): request parameters and slot
//!   URLs are attributes, headers are `<header name=…>` children of `<put>`.
//! - **legacy** (`urn:xmpp:http:upload`): everything is element text, no
//!   headers.
//!
//! The signaling transport itself is supplied by the caller through
//! [`SignalingChannel`].

pub mod channel;
pub mod error;
pub mod requester;

pub use channel::{Dialect, SignalingChannel, UploadService};
pub use error::SlotError;
pub use requester::{SlotRequester, build_request, convert_filename, parse_slot};
