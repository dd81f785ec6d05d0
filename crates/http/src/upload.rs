//! Upload pipeline: optional key generation, slot negotiation and a streamed
//! PUT that hashes and encrypts chunk by chunk.

use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use courier_protocol::TransferStatus;
use courier_protocol::constants::PGP_MIME_TYPE;
use courier_transfer::url::{strip_fragment, to_encrypted_scheme};
use courier_transfer::{
    DEFAULT_CHUNK_SIZE, GcmEncryptor, PlaintextDigest, TAG_LEN, TransferFile, mime,
    progress_percent,
};
use futures_util::Stream;
use rand::RngCore;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::WRITE_TIMEOUT;
use crate::error::HttpTransferError;
use crate::manager::Shared;
use crate::message::{FailureReason, MessageHandle, TransferHost, Transferable};

/// Chunks buffered between the file reader and the request body.
const BODY_BUFFER: usize = 4;

type BodyChunk = Result<Bytes, std::io::Error>;

/// Request body fed by the reader task.
struct BodyStream(mpsc::Receiver<BodyChunk>);

impl Stream for BodyStream {
    type Item = BodyChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}

/// Resolves once `transmitted` has not moved for `timeout` while short of
/// `total`. Never resolves after the whole body was handed over.
pub(crate) async fn watch_for_stall(
    transmitted: &AtomicU64,
    total: u64,
    timeout: Duration,
) -> HttpTransferError {
    let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + timeout, timeout);
    let mut last = transmitted.load(Ordering::SeqCst);
    loop {
        ticks.tick().await;
        let current = transmitted.load(Ordering::SeqCst);
        if current == last && current < total {
            return HttpTransferError::WriteStalled(timeout);
        }
        last = current;
    }
}

/// What a successful upload hands back to the message.
struct Uploaded {
    url: String,
    /// Plaintext bytes.
    size: u64,
    sha256: Option<String>,
}

pub struct UploadTransfer {
    shared: Weak<Shared>,
    me: Weak<UploadTransfer>,
    host: Arc<dyn TransferHost>,
    message: MessageHandle,
    delayed: bool,
    file: Mutex<Option<TransferFile>>,
    status: Mutex<TransferStatus>,
    progress: AtomicU8,
    transmitted: AtomicU64,
    cancel: CancellationToken,
    finished: AtomicBool,
}

impl UploadTransfer {
    pub(crate) fn new(shared: &Arc<Shared>, message: MessageHandle, delayed: bool) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            shared: Arc::downgrade(shared),
            me: me.clone(),
            host: shared.host.clone(),
            message,
            delayed,
            file: Mutex::new(None),
            status: Mutex::new(TransferStatus::Unknown),
            progress: AtomicU8::new(0),
            transmitted: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            finished: AtomicBool::new(false),
        })
    }

    pub fn message_id(&self) -> String {
        self.message.id()
    }

    fn shared(&self) -> Result<Arc<Shared>, HttpTransferError> {
        self.shared.upgrade().ok_or(HttpTransferError::Cancelled)
    }

    fn set_status(&self, next: TransferStatus) {
        {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if !status.can_transition_to(next) {
                warn!(message = %self.message.id(), from = ?*status, to = ?next, "illegal status transition");
                return;
            }
            *status = next;
        }
        self.host.update_ui();
    }

    pub(crate) fn init(&self) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        self.message
            .set_transferable(Some(this.clone() as Arc<dyn Transferable>));
        self.set_status(TransferStatus::Uploading);

        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.spawn(self.cancel.clone(), async move {
            match this.upload().await {
                Ok(done) => this.succeed(done),
                Err(e) => this.fail(e),
            }
        });
    }

    /// Runs every phase.
    async fn upload(self: &Arc<Self>) -> Result<Uploaded, HttpTransferError> {
        let shared = self.shared()?;
        let path = shared.files.upload_source(&self.message).ok_or_else(|| {
            HttpTransferError::Write(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no local file for message",
            ))
        })?;

        let encryption = self.message.encryption();
        let content_type = if encryption.is_pgp() {
            PGP_MIME_TYPE
        } else {
            mime::guess_from_path(&path)
        };

        let size = tokio::fs::metadata(&path).await?.len();
        let mut file = TransferFile::new(path.clone());
        if encryption.requires_transport_encryption() || shared.config.always_encrypt_uploads {
            let mut material = [0u8; 44];
            rand::rngs::OsRng.fill_bytes(&mut material);
            file.set_key_material(&material)?;
        }
        let expected = if file.has_key() {
            size + TAG_LEN as u64
        } else {
            size
        };
        file.set_expected_size(expected);
        *self.file.lock().unwrap_or_else(|e| e.into_inner()) = Some(file.clone());
        debug!(
            message = %self.message.id(),
            path = %path.display(),
            size,
            encrypted = file.has_key(),
            content_type,
            "upload prepared"
        );

        self.host.mark_sending(&self.message);
        self.check_cancelled()?;

        let name = upload_name(&path);
        let slot = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(HttpTransferError::Cancelled),
            slot = shared.slots.request(&name, expected, Some(content_type)) => slot?,
        };
        self.check_cancelled()?;

        let client = shared.clients.for_url(&slot.put, !self.delayed)?;
        drop(shared);

        let (tx, rx) = mpsc::channel(BODY_BUFFER);
        let mut producer = tokio::spawn(Arc::clone(self).produce_body(file.clone(), tx));

        let mut request = client
            .put(slot.put.clone())
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, expected)
            .body(reqwest::Body::wrap_stream(BodyStream(rx)));
        for (name, value) in slot.headers() {
            request = request.header(name.as_str(), value.as_str());
        }

        info!(message = %self.message.id(), put = %slot.put, bytes = expected, "uploading");
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HttpTransferError::Cancelled),
            stalled = watch_for_stall(&self.transmitted, expected, WRITE_TIMEOUT) => Err(stalled),
            response = request.send() => response.map_err(HttpTransferError::from),
        };
        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                producer.abort();
                return Err(e);
            }
        };

        let status = response.status().as_u16();
        if status != 200 && status != 201 {
            producer.abort();
            return Err(HttpTransferError::Status { code: status });
        }
        // A server may answer before draining the body; the digest is then
        // incomplete and dropped.
        let sha256 = match tokio::time::timeout(WRITE_TIMEOUT, &mut producer).await {
            Ok(joined) => joined.ok().flatten(),
            Err(_) => {
                producer.abort();
                None
            }
        };

        let url = match file.key_fragment() {
            Some(fragment) => format!("{}#{fragment}", to_encrypted_scheme(&strip_fragment(&slot.get))),
            None => slot.get.to_string(),
        };
        Ok(Uploaded {
            url,
            size: file.plaintext_size(),
            sha256,
        })
    }

    /// Reads, hashes, encrypts and forwards the file. Read errors end the
    /// body with an error so the request fails. Returns the plaintext digest
    /// once the whole file went out.
    async fn produce_body(
        self: Arc<Self>,
        file: TransferFile,
        tx: mpsc::Sender<BodyChunk>,
    ) -> Option<String> {
        match self.stream_file(&file, &tx).await {
            Ok(digest) => digest.map(PlaintextDigest::finish),
            Err(e) => {
                warn!(message = %self.message.id(), error = %e, "reading upload source failed");
                let _ = tx.send(Err(e)).await;
                None
            }
        }
    }

    async fn stream_file(
        &self,
        file: &TransferFile,
        tx: &mpsc::Sender<BodyChunk>,
    ) -> Result<Option<PlaintextDigest>, std::io::Error> {
        let mut input = tokio::fs::File::open(file.path()).await?;
        let mut encryptor = match file.key() {
            Some(key) => Some(GcmEncryptor::new(key, file.iv()).map_err(std::io::Error::other)?),
            None => None,
        };
        let total = file.expected_size();
        let mut digest = PlaintextDigest::new();
        let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];

        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
            let mut chunk = buf[..n].to_vec();
            if let Some(encryptor) = encryptor.as_mut() {
                encryptor.encrypt(&mut chunk);
            }
            if tx.send(Ok(Bytes::from(chunk))).await.is_err() {
                return Ok(None);
            }
            self.advance(n as u64, total);
        }

        if let Some(encryptor) = encryptor {
            let tag = encryptor.finalize();
            if tx.send(Ok(Bytes::copy_from_slice(&tag))).await.is_err() {
                return Ok(None);
            }
            self.advance(tag.len() as u64, total);
        }
        debug!(message = %self.message.id(), bytes = digest.len(), "upload body complete");
        Ok(Some(digest))
    }

    fn advance(&self, n: u64, total: u64) {
        let sent = self.transmitted.fetch_add(n, Ordering::SeqCst) + n;
        self.progress
            .store(progress_percent(sent, total), Ordering::SeqCst);
        self.host.on_progress(&self.message, sent, total);
    }

    fn check_cancelled(&self) -> Result<(), HttpTransferError> {
        if self.cancel.is_cancelled() {
            Err(HttpTransferError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Hands the uploaded file's URL to the message. A transfer that was
    /// already cancelled or failed leaves the message untouched.
    fn succeed(&self, done: Uploaded) {
        if !self.finish() {
            return;
        }
        let Uploaded { url, size, sha256 } = done;
        self.message.set_body(url.clone());
        let mut params = self.message.file_params();
        params.url = Some(url.clone());
        params.size = size;
        params.sha256 = sha256;
        self.message.set_file_params(params);
        self.host.persist(&self.message);

        info!(message = %self.message.id(), %url, size, "upload finished");
        self.host.resend(&self.message, self.delayed);
    }

    /// Detaches and unregisters. Runs at most once.
    fn finish(&self) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.message.set_transferable(None);
        if let Some(shared) = self.shared.upgrade() {
            shared.finish_upload(&self.message.id());
        }
        true
    }

    fn fail(&self, err: HttpTransferError) {
        let reason = match &err {
            HttpTransferError::Cancelled => FailureReason::Cancelled,
            HttpTransferError::Negotiation(e) => FailureReason::Error(
                e.peer_message()
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string()),
            ),
            other => FailureReason::Error(other.to_string()),
        };
        if !self.finish() {
            return;
        }
        match &reason {
            FailureReason::Cancelled => info!(message = %self.message.id(), "upload cancelled"),
            FailureReason::Error(text) => warn!(message = %self.message.id(), error = %text, "upload failed"),
        }
        self.set_status(TransferStatus::Failed);
        self.host.mark_send_failed(&self.message, &reason);
    }

    /// Aborts negotiation or the PUT, whichever is outstanding.
    pub(crate) fn cancel_transfer(&self) {
        self.cancel.cancel();
        self.fail(HttpTransferError::Cancelled);
    }
}

impl Transferable for UploadTransfer {
    fn status(&self) -> TransferStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    fn file_size(&self) -> u64 {
        self.file
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|f| f.expected_size())
            .unwrap_or(0)
    }

    /// Uploads start on creation.
    fn start(&self) -> bool {
        false
    }

    fn cancel(&self) {
        self.cancel_transfer();
    }
}

fn upload_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .to_string()
}
