//! Contracts with the chat client: the message record, UI/notification
//! host and on-disk file layout.
//!
//! The transfer core never owns a message. It holds a [`MessageHandle`],
//! reads and writes the narrow set of fields below and attaches itself as
//! the message's active [`Transferable`] while running.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use courier_protocol::{Encryption, TransferStatus};

use crate::error::ErrorCategory;

/// File metadata stored on a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileParams {
    pub url: Option<String>,
    /// Plaintext size in bytes.
    pub size: u64,
    pub width: u32,
    pub height: u32,
    /// Hex SHA-256 of the plaintext, known for files this client uploaded.
    pub sha256: Option<String>,
}

/// A chat message carrying (or about to carry) a file.
pub trait MessageRef: Send + Sync {
    fn id(&self) -> String;

    /// Message body: the file URL for file messages.
    fn body(&self) -> String;
    fn set_body(&self, body: String);

    fn encryption(&self) -> Encryption;
    fn set_encryption(&self, encryption: Encryption);

    fn file_params(&self) -> FileParams;
    fn set_file_params(&self, params: FileParams);

    fn is_read(&self) -> bool;

    fn transferable(&self) -> Option<Arc<dyn Transferable>>;
    /// Attaches (`Some`) or detaches (`None`) the active transfer.
    fn set_transferable(&self, transferable: Option<Arc<dyn Transferable>>);
}

pub type MessageHandle = Arc<dyn MessageRef>;

/// Either direction of an in-flight transfer, as seen by the UI.
pub trait Transferable: Send + Sync {
    fn status(&self) -> TransferStatus;

    /// 0..=100.
    fn progress(&self) -> u8;

    /// Bytes on the wire, 0 when unknown.
    fn file_size(&self) -> u64;

    /// User asked to start an offered transfer. Returns `false` when there
    /// is nothing to start.
    fn start(&self) -> bool;

    /// Cancels the transfer. Safe to call repeatedly and after completion.
    fn cancel(&self);
}

/// Why an upload ended without success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Cancelled,
    /// Server-provided text or transport error description.
    Error(String),
}

/// Side effects the pipelines trigger in the chat client.
pub trait TransferHost: Send + Sync {
    /// Full UI refresh, after every status change.
    fn update_ui(&self);

    /// Lightweight, non-persisting progress refresh.
    fn on_progress(&self, message: &MessageHandle, transferred: u64, total: u64);

    /// Stores the message's current fields.
    fn persist(&self, message: &MessageHandle);

    fn has_internet(&self) -> bool {
        true
    }

    fn has_storage_permission(&self) -> bool {
        true
    }

    fn data_saver_enabled(&self) -> bool {
        false
    }

    /// Toast for a failure of an interactive transfer.
    fn show_error(&self, category: ErrorCategory);

    /// New-message notification (also used to surface download offers).
    fn notify(&self, message: &MessageHandle);

    /// System notification for a failed automatic transfer.
    fn notify_failed(&self, message: &MessageHandle);

    /// Makes a finished file visible to media indexing.
    fn media_scan(&self, path: &Path);

    /// Hands downloaded PGP content over for decryption.
    fn decrypt_pgp(&self, message: &MessageHandle, notify: bool);

    fn mark_sending(&self, message: &MessageHandle);

    fn mark_send_failed(&self, message: &MessageHandle, reason: &FailureReason);

    /// Sends the message (now carrying the uploaded file's URL).
    fn resend(&self, message: &MessageHandle, delayed: bool);
}

/// Where files live on local storage.
pub trait FileStore: Send + Sync {
    /// Final, user-visible location for a downloaded file.
    fn download_path(&self, file_name: &str) -> PathBuf;

    /// Private cache location for ciphertext awaiting decryption.
    fn private_download_path(&self, file_name: &str) -> PathBuf;

    /// Local file to upload for `message`.
    fn upload_source(&self, message: &MessageHandle) -> Option<PathBuf>;
}

/// A [`FileStore`] over two directories.
///
/// Upload sources are either registered explicitly or found in the media
/// directory as `<message id>.<ext>`.
pub struct DirectoryStore {
    media_dir: PathBuf,
    private_dir: PathBuf,
    sources: Mutex<HashMap<String, PathBuf>>,
}

impl DirectoryStore {
    pub fn new(media_dir: impl Into<PathBuf>, private_dir: impl Into<PathBuf>) -> Self {
        Self {
            media_dir: media_dir.into(),
            private_dir: private_dir.into(),
            sources: Mutex::new(HashMap::new()),
        }
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    /// Uses `path` as the upload source for message `id`.
    pub fn register_upload(&self, id: impl Into<String>, path: impl Into<PathBuf>) {
        self.sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.into(), path.into());
    }
}

impl FileStore for DirectoryStore {
    fn download_path(&self, file_name: &str) -> PathBuf {
        self.media_dir.join(file_name)
    }

    fn private_download_path(&self, file_name: &str) -> PathBuf {
        self.private_dir.join(file_name)
    }

    fn upload_source(&self, message: &MessageHandle) -> Option<PathBuf> {
        let id = message.id();
        if let Some(path) = self
            .sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
        {
            return Some(path.clone());
        }
        std::fs::read_dir(&self.media_dir)
            .ok()?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .find(|path| {
                path.is_file() && path.file_stem().and_then(|s| s.to_str()) == Some(id.as_str())
            })
    }
}
