//! Local side of a Courier transfer: the file being moved, its optional
//! AES-256-GCM transport encryption and the `aesgcm://` URL convention.

mod checksum;
pub mod cipher;
mod file;
pub mod mime;
mod progress;
pub mod url;
mod validation;

pub use checksum::PlaintextDigest;
pub use cipher::{DEFAULT_IV, GcmDecryptor, GcmEncryptor, TAG_LEN, decrypt_file};
pub use file::TransferFile;
pub use progress::{RefreshThrottle, progress_percent};
pub use validation::validate_file_name;

/// Read/encrypt buffer size for streamed bodies: 16 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key material already bound")]
    KeyAlreadyBound,

    #[error("invalid key material length: {0} bytes")]
    InvalidKeyLength(usize),

    #[error("invalid IV length: {0} bytes")]
    InvalidIv(usize),

    #[error("authentication tag mismatch")]
    TagMismatch,

    #[error("ciphertext shorter than the authentication tag ({0} bytes)")]
    Truncated(u64),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),
}
