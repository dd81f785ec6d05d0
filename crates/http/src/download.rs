//! Download pipeline: size probe, resumable GET, optional decryption.
//!
//! ```text
//! init ──► probe (Checking) ──┬─► Offer / OfferCheckFilesize ──start()──┐
//!                             ├─► Deleted                                │
//!                             └─► auto-accept ──► download (Downloading) ◄┘
//!                                                   └─► decrypt ─► finalize
//! ```
//!
//! Every phase runs on a worker task. Failures end in exactly one terminal
//! step; cancellation is silent.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use courier_protocol::{Encryption, TransferStatus};
use courier_transfer::mime::{self, CRYPTO_EXTENSIONS, PGP_EXTENSIONS};
use courier_transfer::url::{from_encrypted_scheme, key_from_fragment, strip_fragment};
use courier_transfer::{TransferFile, decrypt_file, progress_percent, validate_file_name};
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderMap, RANGE};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ErrorCategory, HttpTransferError};
use crate::manager::Shared;
use crate::message::{MessageHandle, TransferHost, Transferable};

/// Where the bytes go.
struct Target {
    /// Fragment-stripped URL requested on the wire.
    url: Url,
    /// Download destination; the private cache when a key is bound.
    file: TransferFile,
    /// User-visible location of the plaintext.
    final_path: PathBuf,
    pending_pgp: bool,
}

/// Outcome of the size probe.
enum Probe {
    Size(u64),
    Unknown,
    Deleted,
}

pub struct DownloadTransfer {
    shared: Weak<Shared>,
    me: Weak<DownloadTransfer>,
    host: Arc<dyn TransferHost>,
    message: MessageHandle,
    target: Mutex<Option<Target>>,
    status: Mutex<TransferStatus>,
    progress: AtomicU8,
    accepted_automatically: AtomicBool,
    cancel: CancellationToken,
    finished: AtomicBool,
}

impl DownloadTransfer {
    pub(crate) fn new(shared: &Arc<Shared>, message: MessageHandle) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            shared: Arc::downgrade(shared),
            me: me.clone(),
            host: shared.host.clone(),
            message,
            target: Mutex::new(None),
            status: Mutex::new(TransferStatus::Unknown),
            progress: AtomicU8::new(0),
            accepted_automatically: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            finished: AtomicBool::new(false),
        })
    }

    pub fn message_id(&self) -> String {
        self.message.id()
    }

    fn target(&self) -> MutexGuard<'_, Option<Target>> {
        self.target.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn shared(&self) -> Result<Arc<Shared>, HttpTransferError> {
        self.shared.upgrade().ok_or(HttpTransferError::Cancelled)
    }

    fn set_status(&self, next: TransferStatus) -> bool {
        {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if !status.can_transition_to(next) {
                warn!(message = %self.message.id(), from = ?*status, to = ?next, "illegal status transition");
                return false;
            }
            *status = next;
        }
        self.host.update_ui();
        true
    }

    /// Moves `from` → `to` only if the status is currently `from`.
    fn claim(&self, from: TransferStatus, to: TransferStatus) -> bool {
        {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if *status != from {
                return false;
            }
            *status = to;
        }
        self.host.update_ui();
        true
    }

    async fn race<F, T, E>(&self, fut: F) -> Result<T, HttpTransferError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<HttpTransferError>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HttpTransferError::Cancelled),
            r = fut => r.map_err(Into::into),
        }
    }

    fn check_cancelled(&self) -> Result<(), HttpTransferError> {
        if self.cancel.is_cancelled() {
            Err(HttpTransferError::Cancelled)
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    pub(crate) fn init(&self, interactive: bool) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        self.message
            .set_transferable(Some(this.clone() as Arc<dyn Transferable>));

        match self.resolve_target() {
            Ok(target) => {
                debug!(
                    message = %self.message.id(),
                    url = %target.url,
                    path = %target.file.path().display(),
                    encrypted = target.file.has_key(),
                    "download target resolved"
                );
                *self.target() = Some(target);
                self.schedule_probe(this, interactive);
            }
            Err(e) => {
                warn!(message = %self.message.id(), error = %e, "cannot download message body");
                self.cancel_transfer();
            }
        }
    }

    fn resolve_target(&self) -> Result<Target, HttpTransferError> {
        let shared = self.shared()?;
        let body = self.message.body();
        let url = from_encrypted_scheme(&body).map_err(|e| HttpTransferError::Probe(e.to_string()))?;

        let last_segment = url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .unwrap_or("");
        let parts: Vec<&str> = last_segment.split('.').collect();
        let last = if parts.len() > 1 {
            parts.last().map(|p| p.to_ascii_lowercase())
        } else {
            None
        };

        let mut encryption = self.message.encryption();
        if last
            .as_deref()
            .is_some_and(|ext| PGP_EXTENSIONS.contains(&ext))
        {
            encryption = Encryption::PendingDecryption;
        } else if !encryption.requires_transport_encryption() {
            encryption = Encryption::None;
        }
        let extension = match last {
            Some(ext) if CRYPTO_EXTENSIONS.contains(&ext.as_str()) => {
                (parts.len() > 2).then(|| parts[parts.len() - 2].to_string())
            }
            Some(_) => parts.last().map(|p| p.to_string()),
            None => None,
        };

        let name = local_name(&self.message.id(), extension.as_deref());
        validate_file_name(&name)?;

        let final_path = shared.files.download_path(&name);
        let file = match url.fragment().and_then(key_from_fragment) {
            Some(material) => {
                let mut file = TransferFile::new(shared.files.private_download_path(&name));
                file.set_key_material(&material)?;
                file
            }
            None => {
                if encryption.requires_transport_encryption() {
                    encryption = Encryption::None;
                }
                TransferFile::new(final_path.clone())
            }
        };
        self.message.set_encryption(encryption);

        Ok(Target {
            url: strip_fragment(&url),
            file,
            final_path,
            pending_pgp: encryption == Encryption::PendingDecryption,
        })
    }

    fn schedule_probe(&self, this: Arc<Self>, interactive: bool) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.spawn(self.cancel.clone(), async move {
            this.check_file_size(interactive).await;
        });
    }

    fn schedule_download(&self, this: Arc<Self>, interactive: bool) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.spawn(self.cancel.clone(), async move {
            this.download_and_finish(interactive).await;
        });
    }

    // -----------------------------------------------------------------------
    // Size probe
    // -----------------------------------------------------------------------

    async fn check_file_size(self: Arc<Self>, interactive: bool) {
        self.set_status(TransferStatus::Checking);
        match self.probe(interactive).await {
            Ok(Probe::Size(size)) => {
                self.apply_size(size);
                let shared = match self.shared() {
                    Ok(s) => s,
                    Err(e) => return self.fail(e, interactive),
                };
                let auto = interactive
                    || (self.host.has_storage_permission()
                        && size <= shared.config.auto_accept_file_size
                        && !self.host.data_saver_enabled());
                drop(shared);
                if auto {
                    self.accepted_automatically.store(!interactive, Ordering::SeqCst);
                    info!(message = %self.message.id(), size, interactive, "download accepted");
                    self.download_and_finish(interactive).await;
                } else {
                    info!(message = %self.message.id(), size, "download offered");
                    self.set_status(TransferStatus::Offer);
                    self.host.notify(&self.message);
                }
            }
            Ok(Probe::Unknown) => {
                info!(message = %self.message.id(), "remote size unknown");
                self.set_status(TransferStatus::OfferCheckFilesize);
                if !interactive {
                    self.host.notify(&self.message);
                }
            }
            Ok(Probe::Deleted) => {
                info!(message = %self.message.id(), "remote file deleted");
                self.set_status(TransferStatus::Deleted);
                if interactive {
                    self.host.show_error(ErrorCategory::FileNotFound);
                }
                self.finish();
            }
            Err(HttpTransferError::Tls(reason)) => {
                // Left for an interactive retry that may prompt about the certificate.
                warn!(message = %self.message.id(), %reason, "TLS failure while probing");
                self.accepted_automatically.store(false, Ordering::SeqCst);
                self.set_status(TransferStatus::OfferCheckFilesize);
                self.host.notify(&self.message);
            }
            Err(e) => self.fail(e, interactive),
        }
    }

    async fn probe(&self, interactive: bool) -> Result<Probe, HttpTransferError> {
        let shared = self.shared()?;
        let url = match self.target().as_ref() {
            Some(t) => t.url.clone(),
            None => return Err(HttpTransferError::Probe("no download target".into())),
        };
        let client = shared.clients.for_url(&url, interactive)?;
        drop(shared);

        debug!(message = %self.message.id(), %url, "probing remote size");
        let mut response = self
            .race(client.head(url.clone()).header(ACCEPT_ENCODING, "identity").send())
            .await?;
        if matches!(
            response.status(),
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
        ) {
            debug!(message = %self.message.id(), "HEAD refused, probing with GET");
            response = self
                .race(client.get(url.clone()).header(ACCEPT_ENCODING, "identity").send())
                .await?;
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(Probe::Deleted);
        }
        if !status.is_success() {
            return Err(HttpTransferError::Status {
                code: status.as_u16(),
            });
        }

        if let Some(content_type) = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            self.maybe_rename(content_type);
        }

        Ok(match declared_length(response.headers()) {
            Some(size) => Probe::Size(size),
            None => Probe::Unknown,
        })
    }

    /// Renames an unencrypted target whose extension disagrees with the
    /// served content type.
    fn maybe_rename(&self, content_type: &str) {
        let Some(new_ext) = mime::extension_for(content_type) else {
            return;
        };
        let Ok(shared) = self.shared() else {
            return;
        };
        let mut guard = self.target();
        let Some(target) = guard.as_mut() else {
            return;
        };
        if target.file.has_key() || target.pending_pgp {
            return;
        }
        let current = target.file.extension();
        let current_mime = current.as_deref().and_then(mime::guess_from_extension);
        if current_mime == mime::guess_from_extension(new_ext) {
            return;
        }
        let name = local_name(&self.message.id(), Some(new_ext));
        if validate_file_name(&name).is_err() {
            return;
        }
        let path = shared.files.download_path(&name);
        debug!(
            message = %self.message.id(),
            from = ?current,
            to = new_ext,
            "content type disagrees with extension, renaming target"
        );
        target.file.set_path(path.clone());
        target.final_path = path;
    }

    /// Records the size on the wire and persists the plaintext size.
    fn apply_size(&self, size: u64) {
        let plaintext = {
            let mut guard = self.target();
            let Some(target) = guard.as_mut() else {
                return;
            };
            target.file.set_expected_size(size);
            target.file.plaintext_size()
        };
        let mut params = self.message.file_params();
        params.size = plaintext;
        self.message.set_file_params(params);
        self.host.persist(&self.message);
    }

    // -----------------------------------------------------------------------
    // Transfer
    // -----------------------------------------------------------------------

    async fn download_and_finish(self: Arc<Self>, interactive: bool) {
        let result = async {
            self.download(interactive).await?;
            self.check_cancelled()?;
            self.decrypt().await
        }
        .await;
        self.conclude(result, interactive);
    }

    /// Terminal step for a transfer whose bytes are on disk. A cancel that
    /// landed while decrypting wins over the result.
    fn conclude(&self, result: Result<u64, HttpTransferError>, interactive: bool) {
        match result.and_then(|plaintext| self.check_cancelled().map(|()| plaintext)) {
            Ok(plaintext) => self.finalize(plaintext),
            Err(HttpTransferError::SizeChanged(size)) => {
                info!(message = %self.message.id(), size, "remote size changed, download aborted for retry");
                self.finish();
            }
            Err(e) => self.fail(e, interactive),
        }
    }

    async fn download(&self, interactive: bool) -> Result<(), HttpTransferError> {
        self.set_status(TransferStatus::Downloading);
        let shared = self.shared()?;
        let (url, path, expected) = match self.target().as_ref() {
            Some(t) => (t.url.clone(), t.file.path().to_path_buf(), t.file.expected_size()),
            None => return Err(HttpTransferError::Probe("no download target".into())),
        };
        let client = shared.clients.for_url(&url, interactive)?;
        let ceiling = if expected > 0 {
            expected
        } else {
            shared.config.max_unknown_download_size
        };
        drop(shared);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let existing = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        let try_resume = existing > 0 && existing < expected;

        let mut response = self
            .fetch(&client, &url, try_resume.then_some(existing))
            .await?;
        let resumed = try_resume && range_starts_at(response.headers(), existing);
        if try_resume && !resumed {
            info!(message = %self.message.id(), offset = existing, "range not honored, restarting");
            if response.status() == StatusCode::PARTIAL_CONTENT {
                // A partial body at another offset is useless: ask for all of it.
                drop(response);
                response = self.fetch(&client, &url, None).await?;
            }
        }
        if !resumed {
            if let Some(declared) = declared_length(response.headers()) {
                if declared != expected {
                    if expected == 0 {
                        self.apply_size(declared);
                        return Err(HttpTransferError::SizeChanged(declared));
                    }
                    return Err(HttpTransferError::Integrity {
                        expected,
                        actual: declared,
                    });
                }
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(resumed)
            .truncate(!resumed)
            .open(&path)
            .await?;
        let mut written = if resumed { existing } else { 0 };
        let mut body = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(HttpTransferError::Cancelled),
                next = body.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            let len = chunk.len() as u64;
            if written + len > ceiling {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(HttpTransferError::Integrity {
                    expected: ceiling,
                    actual: written + len,
                });
            }
            file.write_all(&chunk).await?;
            written += len;
            self.progress
                .store(progress_percent(written, expected), Ordering::SeqCst);
            self.host.on_progress(&self.message, written, expected);
        }
        file.flush().await?;

        if expected > 0 && written < expected {
            return Err(HttpTransferError::Integrity {
                expected,
                actual: written,
            });
        }
        info!(message = %self.message.id(), bytes = written, resumed, "download complete");
        Ok(())
    }

    /// GET with identity encoding, from `offset` when given.
    async fn fetch(
        &self,
        client: &reqwest::Client,
        url: &Url,
        offset: Option<u64>,
    ) -> Result<reqwest::Response, HttpTransferError> {
        let mut request = client.get(url.clone()).header(ACCEPT_ENCODING, "identity");
        if let Some(offset) = offset {
            debug!(message = %self.message.id(), offset, "requesting resume");
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = self.race(request.send()).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HttpTransferError::Status {
                code: status.as_u16(),
            });
        }
        Ok(response)
    }

    /// Decrypts into the final location when a key is bound. Returns the
    /// plaintext size.
    async fn decrypt(&self) -> Result<u64, HttpTransferError> {
        let (src, dest, key, iv, plaintext) = match self.target().as_ref() {
            Some(t) => (
                t.file.path().to_path_buf(),
                t.final_path.clone(),
                t.file.key().copied(),
                t.file.iv().to_vec(),
                t.file.plaintext_size(),
            ),
            None => return Err(HttpTransferError::Probe("no download target".into())),
        };
        let Some(key) = key else {
            return Ok(plaintext);
        };

        let src_blocking = src.clone();
        let size = tokio::task::spawn_blocking(move || decrypt_file(&src_blocking, &dest, &key, &iv))
            .await
            .map_err(|e| HttpTransferError::Write(std::io::Error::other(e)))??;
        if let Err(e) = tokio::fs::remove_file(&src).await {
            warn!(path = %src.display(), error = %e, "failed to remove ciphertext");
        }
        debug!(message = %self.message.id(), bytes = size, "download decrypted");
        Ok(size)
    }

    fn finalize(&self, plaintext: u64) {
        let (final_path, pending_pgp) = match self.target().as_ref() {
            Some(t) => (t.final_path.clone(), t.pending_pgp),
            None => return,
        };
        if !self.finish() {
            return;
        }
        let mut params = self.message.file_params();
        params.url = Some(self.message.body());
        params.size = plaintext;
        self.message.set_file_params(params);
        self.host.persist(&self.message);

        self.host.media_scan(&final_path);
        self.host.update_ui();

        let notify =
            self.accepted_automatically.load(Ordering::SeqCst) && !self.message.is_read();
        if pending_pgp {
            self.host.decrypt_pgp(&self.message, notify);
        } else if notify {
            self.host.notify(&self.message);
        }
        info!(message = %self.message.id(), path = %final_path.display(), "download finished");
    }

    // -----------------------------------------------------------------------
    // Terminal steps
    // -----------------------------------------------------------------------

    /// Detaches and unregisters. Runs at most once.
    fn finish(&self) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.message.set_transferable(None);
        if let Some(shared) = self.shared.upgrade() {
            shared.finish_download(&self.message.id());
        }
        true
    }

    fn fail(&self, err: HttpTransferError, interactive: bool) {
        if err.is_cancelled() {
            debug!(message = %self.message.id(), "download cancelled");
            self.finish();
            return;
        }
        warn!(message = %self.message.id(), error = %err, "download failed");
        self.set_status(TransferStatus::Failed);
        if !self.finish() {
            return;
        }
        if interactive {
            if let Some(category) = err.category() {
                self.host.show_error(category);
            }
        } else {
            self.host.notify_failed(&self.message);
        }
    }

    /// Aborts any outstanding work and detaches the transfer.
    pub(crate) fn cancel_transfer(&self) {
        self.cancel.cancel();
        if self.finish() {
            info!(message = %self.message.id(), "download cancelled");
            self.host.update_ui();
        }
    }
}

impl Transferable for DownloadTransfer {
    fn status(&self) -> TransferStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    fn file_size(&self) -> u64 {
        self.target()
            .as_ref()
            .map(|t| t.file.expected_size())
            .unwrap_or(0)
    }

    fn start(&self) -> bool {
        if self.finished.load(Ordering::SeqCst) || !self.host.has_internet() {
            return false;
        }
        let Some(this) = self.me.upgrade() else {
            return false;
        };
        if self.claim(TransferStatus::OfferCheckFilesize, TransferStatus::Checking) {
            info!(message = %self.message.id(), "re-probing on user request");
            self.schedule_probe(this, true);
            true
        } else if self.claim(TransferStatus::Offer, TransferStatus::Downloading) {
            info!(message = %self.message.id(), "download started on user request");
            self.schedule_download(this, true);
            true
        } else {
            false
        }
    }

    fn cancel(&self) {
        self.cancel_transfer();
    }
}

fn local_name(id: &str, extension: Option<&str>) -> String {
    match extension {
        Some(ext) if !ext.is_empty() => format!("{id}.{ext}"),
        _ => id.to_string(),
    }
}

/// `Content-Length` read from the raw header; reqwest reports 0 for HEAD.
fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn range_starts_at(headers: &HeaderMap, offset: u64) -> bool {
    headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().starts_with(&format!("bytes {offset}-")))
}
