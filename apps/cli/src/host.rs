//! Terminal implementations of the transfer engine's host contracts.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use courier_http::{
    ErrorCategory, FailureReason, FileParams, MessageHandle, MessageRef, TransferHost, Transferable,
};
use courier_protocol::{Encryption, Iq};
use courier_slot::{SignalingChannel, SlotError, UploadService};
use courier_transfer::{RefreshThrottle, progress_percent};
use tokio::sync::watch;
use tracing::{info, warn};

/// How a fetch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Saved(PathBuf),
    Failed(ErrorCategory),
}

/// Prints progress to stderr and records the outcome.
pub struct CliHost {
    throttle: RefreshThrottle,
    outcome: Mutex<Option<Outcome>>,
    changed: watch::Sender<u64>,
}

impl CliHost {
    pub fn new() -> (Arc<Self>, watch::Receiver<u64>) {
        let (changed, rx) = watch::channel(0);
        let host = Arc::new(Self {
            throttle: RefreshThrottle::default(),
            outcome: Mutex::new(None),
            changed,
        });
        (host, rx)
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn settle(&self, outcome: Outcome) {
        let mut slot = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(outcome);
        }
        drop(slot);
        self.bump();
    }

    fn bump(&self) {
        self.changed.send_modify(|n| *n += 1);
    }
}

pub fn describe(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::ServerNotFound => "server not found",
        ErrorCategory::CouldNotConnect => "could not connect to the server",
        ErrorCategory::WriteFailed => "could not write the file",
        ErrorCategory::IntegrityViolation => "file integrity check failed",
        ErrorCategory::FileNotFound => "file not found on the server",
    }
}

impl TransferHost for CliHost {
    fn update_ui(&self) {
        self.bump();
    }

    fn on_progress(&self, _message: &MessageHandle, transferred: u64, total: u64) {
        if !self.throttle.should_refresh() && transferred < total {
            return;
        }
        let mut err = std::io::stderr().lock();
        if total > 0 {
            let _ = write!(
                err,
                "\r{:>3}% {transferred}/{total} bytes",
                progress_percent(transferred, total)
            );
        } else {
            let _ = write!(err, "\r{transferred} bytes");
        }
        let _ = err.flush();
    }

    fn persist(&self, _message: &MessageHandle) {}

    fn show_error(&self, category: ErrorCategory) {
        self.settle(Outcome::Failed(category));
    }

    fn notify(&self, message: &MessageHandle) {
        info!(message = %message.id(), "download waiting for confirmation");
        self.bump();
    }

    fn notify_failed(&self, message: &MessageHandle) {
        warn!(message = %message.id(), "background download failed");
        self.settle(Outcome::Failed(ErrorCategory::FileNotFound));
    }

    fn media_scan(&self, path: &Path) {
        eprintln!();
        self.settle(Outcome::Saved(path.to_path_buf()));
    }

    fn decrypt_pgp(&self, message: &MessageHandle, _notify: bool) {
        warn!(message = %message.id(), "file is PGP-encrypted and was saved as is");
    }

    fn mark_sending(&self, _message: &MessageHandle) {}

    fn mark_send_failed(&self, message: &MessageHandle, reason: &FailureReason) {
        warn!(message = %message.id(), ?reason, "upload failed");
    }

    fn resend(&self, _message: &MessageHandle, _delayed: bool) {}
}

/// The message record for one fetched URL.
pub struct CliMessage {
    id: String,
    body: Mutex<String>,
    encryption: Mutex<Encryption>,
    params: Mutex<FileParams>,
    transferable: Mutex<Option<Arc<dyn Transferable>>>,
}

impl CliMessage {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            body: Mutex::new(url.into()),
            encryption: Mutex::new(Encryption::None),
            params: Mutex::new(FileParams::default()),
            transferable: Mutex::new(None),
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MessageRef for CliMessage {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn body(&self) -> String {
        lock(&self.body).clone()
    }

    fn set_body(&self, body: String) {
        *lock(&self.body) = body;
    }

    fn encryption(&self) -> Encryption {
        *lock(&self.encryption)
    }

    fn set_encryption(&self, encryption: Encryption) {
        *lock(&self.encryption) = encryption;
    }

    fn file_params(&self) -> FileParams {
        lock(&self.params).clone()
    }

    fn set_file_params(&self, params: FileParams) {
        *lock(&self.params) = params;
    }

    /// Fetched on request: never worth a notification.
    fn is_read(&self) -> bool {
        true
    }

    fn transferable(&self) -> Option<Arc<dyn Transferable>> {
        lock(&self.transferable).clone()
    }

    fn set_transferable(&self, transferable: Option<Arc<dyn Transferable>>) {
        *lock(&self.transferable) = transferable;
    }
}

/// Signaling channel for a tool that never uploads.
pub struct NullChannel;

impl SignalingChannel for NullChannel {
    fn upload_service(&self) -> Option<UploadService> {
        None
    }

    fn send_iq(&self, _iq: Iq) -> Pin<Box<dyn Future<Output = Result<Iq, SlotError>> + Send + '_>> {
        Box::pin(async { Err(SlotError::Channel("no signaling connection".into())) })
    }
}
