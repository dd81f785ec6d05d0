//! Registry of in-flight transfers and the worker pool they run on.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use courier_slot::{SignalingChannel, SlotRequester};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{HttpClients, SystemTrust, TrustManager};
use crate::config::TransferConfig;
use crate::download::DownloadTransfer;
use crate::message::{FileStore, MessageHandle, TransferHost};
use crate::upload::UploadTransfer;

/// Collaborators injected by the chat client.
pub struct Services {
    pub host: Arc<dyn TransferHost>,
    pub files: Arc<dyn FileStore>,
    pub channel: Arc<dyn SignalingChannel>,
    pub trust: Arc<dyn TrustManager>,
}

impl Services {
    /// Services with the platform trust store.
    pub fn new(
        host: Arc<dyn TransferHost>,
        files: Arc<dyn FileStore>,
        channel: Arc<dyn SignalingChannel>,
    ) -> Self {
        Self {
            host,
            files,
            channel,
            trust: Arc::new(SystemTrust),
        }
    }

    pub fn with_trust_manager(mut self, trust: Arc<dyn TrustManager>) -> Self {
        self.trust = trust;
        self
    }
}

/// State shared between the manager and its pipelines. Pipelines hold it
/// weakly so a dropped manager does not live on through its transfers.
pub(crate) struct Shared {
    pub(crate) config: TransferConfig,
    pub(crate) clients: HttpClients,
    pub(crate) host: Arc<dyn TransferHost>,
    pub(crate) files: Arc<dyn FileStore>,
    pub(crate) slots: SlotRequester,
    workers: Arc<Semaphore>,
    runtime: Handle,
    uploads: Mutex<HashMap<String, Arc<UploadTransfer>>>,
    downloads: Mutex<HashMap<String, Arc<DownloadTransfer>>>,
}

impl Shared {
    /// Runs `task` on the runtime once a worker permit is free. Cancellation
    /// while waiting drops the task unrun.
    pub(crate) fn spawn<F>(&self, cancel: CancellationToken, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let workers = Arc::clone(&self.workers);
        self.runtime.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                permit = workers.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            task.await;
            drop(permit);
        });
    }

    pub(crate) fn finish_upload(&self, id: &str) {
        if lock(&self.uploads).remove(id).is_some() {
            debug!(message = %id, "upload removed from registry");
        }
    }

    pub(crate) fn finish_download(&self, id: &str) {
        if lock(&self.downloads).remove(id).is_some() {
            debug!(message = %id, "download removed from registry");
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Entry point for starting transfers.
///
/// At most one transfer, upload or download, exists per message. Entry
/// points never block: they register the transfer and schedule its work on
/// the runtime.
pub struct TransferManager {
    shared: Arc<Shared>,
}

impl TransferManager {
    pub fn new(config: TransferConfig, services: Services, runtime: Handle) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        let clients = HttpClients::new(&config, services.trust);
        Self {
            shared: Arc::new(Shared {
                clients,
                host: services.host,
                files: services.files,
                slots: SlotRequester::new(services.channel),
                workers,
                runtime,
                uploads: Mutex::new(HashMap::new()),
                downloads: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.shared.config
    }

    /// Starts downloading the file a message points at.
    ///
    /// Returns `None` without side effects when the message already has a
    /// transfer.
    pub fn create_download(
        &self,
        message: MessageHandle,
        interactive: bool,
    ) -> Option<Arc<DownloadTransfer>> {
        let id = message.id();
        let transfer = {
            let uploads = lock(&self.shared.uploads);
            let mut downloads = lock(&self.shared.downloads);
            if uploads.contains_key(&id) || downloads.contains_key(&id) {
                debug!(message = %id, "transfer already active, ignoring download request");
                return None;
            }
            let transfer = DownloadTransfer::new(&self.shared, message);
            downloads.insert(id.clone(), Arc::clone(&transfer));
            transfer
        };
        info!(message = %id, interactive, "download created");
        transfer.init(interactive);
        Some(transfer)
    }

    /// Starts uploading the local file belonging to a message.
    ///
    /// `delayed` is passed through to the resend once the upload completes.
    /// Returns `None` when the message already has a transfer.
    pub fn create_upload(&self, message: MessageHandle, delayed: bool) -> Option<Arc<UploadTransfer>> {
        let id = message.id();
        let transfer = {
            let mut uploads = lock(&self.shared.uploads);
            let downloads = lock(&self.shared.downloads);
            if uploads.contains_key(&id) || downloads.contains_key(&id) {
                debug!(message = %id, "transfer already active, ignoring upload request");
                return None;
            }
            let transfer = UploadTransfer::new(&self.shared, message, delayed);
            uploads.insert(id.clone(), Arc::clone(&transfer));
            transfer
        };
        info!(message = %id, delayed, "upload created");
        transfer.init();
        Some(transfer)
    }

    pub fn is_active(&self, message_id: &str) -> bool {
        lock(&self.shared.uploads).contains_key(message_id)
            || lock(&self.shared.downloads).contains_key(message_id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.shared.uploads).len() + lock(&self.shared.downloads).len()
    }

    /// Cancels every registered transfer.
    pub fn cancel_all(&self) {
        let uploads: Vec<_> = lock(&self.shared.uploads).values().cloned().collect();
        let downloads: Vec<_> = lock(&self.shared.downloads).values().cloned().collect();
        for upload in uploads {
            upload.cancel_transfer();
        }
        for download in downloads {
            download.cancel_transfer();
        }
    }
}
