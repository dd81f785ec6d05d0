//! Wire-level types for the Courier HTTP transfer engine.
//!
//! The signaling layer (XML stream, routing, IQ tracking) lives outside this
//! workspace. What the transfer crates exchange with it is modelled here:
//! a minimal [`Element`] tree, the [`Iq`] envelope, the upload [`Slot`] and
//! the status/encryption enums shared by uploads and downloads.

pub mod constants;
pub mod slot;
pub mod stanza;
pub mod types;

pub use slot::{Slot, SlotHeaderError};
pub use stanza::{Element, Iq, IqType};
pub use types::{Encryption, TransferStatus};
