use serde::{Deserialize, Serialize};

/// Lifecycle of a single transfer.
///
/// A finished transfer has no status at all: the pipeline detaches itself
/// from the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    #[default]
    Unknown,
    Checking,
    /// Size known, waiting for the user to accept.
    Offer,
    /// Size could not be determined, waiting for the user to retry.
    OfferCheckFilesize,
    Downloading,
    Uploading,
    Failed,
    /// The remote host no longer has the file.
    Deleted,
}

impl TransferStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Checking => 1,
            Self::Offer | Self::OfferCheckFilesize => 2,
            Self::Downloading | Self::Uploading => 3,
            Self::Failed | Self::Deleted => 4,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Statuses only move forward, except that an offer may go back to
    /// `Checking` when the user asks for a new size probe. Re-entering the
    /// current status is a no-op and allowed.
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if self.is_offer() && next == Self::Checking {
            return true;
        }
        next.rank() > self.rank()
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Deleted)
    }

    /// Statuses in which the user may start the transfer.
    pub fn is_offer(self) -> bool {
        matches!(self, Self::Offer | Self::OfferCheckFilesize)
    }
}

/// Encryption mode carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Encryption {
    #[default]
    None,
    /// PGP ciphertext not yet decrypted.
    PendingDecryption,
    /// PGP content already decrypted locally.
    Decrypted,
    Omemo,
    Otr,
}

impl Encryption {
    /// Modes whose files travel as `aesgcm://` with a key fragment.
    pub fn requires_transport_encryption(self) -> bool {
        matches!(self, Self::Omemo | Self::Otr)
    }

    pub fn is_pgp(self) -> bool {
        matches!(self, Self::PendingDecryption | Self::Decrypted)
    }
}
