//! Test doubles for the pipeline tests: a message, a recording host, a slot
//! channel and a raw-socket HTTP server.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_protocol::constants::NS_STANZAS;
use courier_protocol::{Element, Encryption, Iq};
use courier_slot::{Dialect, SignalingChannel, SlotError, UploadService};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

use crate::config::TransferConfig;
use crate::error::ErrorCategory;
use crate::manager::{Services, TransferManager};
use crate::message::{
    DirectoryStore, FailureReason, FileParams, MessageHandle, MessageRef, TransferHost, Transferable,
};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

pub(crate) struct MockMessage {
    id: String,
    body: Mutex<String>,
    encryption: Mutex<Encryption>,
    params: Mutex<FileParams>,
    read: AtomicBool,
    transferable: Mutex<Option<Arc<dyn Transferable>>>,
}

impl MockMessage {
    pub(crate) fn new(id: &str, body: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            body: Mutex::new(body.to_string()),
            encryption: Mutex::new(Encryption::None),
            params: Mutex::new(FileParams::default()),
            read: AtomicBool::new(false),
            transferable: Mutex::new(None),
        })
    }

    pub(crate) fn set_read(&self, read: bool) {
        self.read.store(read, Ordering::SeqCst);
    }
}

impl MessageRef for MockMessage {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn body(&self) -> String {
        self.body.lock().unwrap().clone()
    }

    fn set_body(&self, body: String) {
        *self.body.lock().unwrap() = body;
    }

    fn encryption(&self) -> Encryption {
        *self.encryption.lock().unwrap()
    }

    fn set_encryption(&self, encryption: Encryption) {
        *self.encryption.lock().unwrap() = encryption;
    }

    fn file_params(&self) -> FileParams {
        self.params.lock().unwrap().clone()
    }

    fn set_file_params(&self, params: FileParams) {
        *self.params.lock().unwrap() = params;
    }

    fn is_read(&self) -> bool {
        self.read.load(Ordering::SeqCst)
    }

    fn transferable(&self) -> Option<Arc<dyn Transferable>> {
        self.transferable.lock().unwrap().clone()
    }

    fn set_transferable(&self, transferable: Option<Arc<dyn Transferable>>) {
        *self.transferable.lock().unwrap() = transferable;
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HostEvent {
    UpdateUi,
    Progress(String, u64, u64),
    Persist(String),
    ShowError(ErrorCategory),
    Notify(String),
    NotifyFailed(String),
    MediaScan(PathBuf),
    DecryptPgp(String, bool),
    MarkSending(String),
    MarkSendFailed(String, FailureReason),
    Resend(String, bool),
}

pub(crate) struct RecordingHost {
    events: Mutex<Vec<HostEvent>>,
    pub(crate) internet: AtomicBool,
    pub(crate) storage: AtomicBool,
    pub(crate) data_saver: AtomicBool,
}

impl RecordingHost {
    pub(crate) fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            internet: AtomicBool::new(true),
            storage: AtomicBool::new(true),
            data_saver: AtomicBool::new(false),
        }
    }

    pub(crate) fn events(&self) -> Vec<HostEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&HostEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    pub(crate) async fn wait_for(&self, pred: impl Fn(&HostEvent) -> bool) {
        self.wait_for_count(pred, 1).await;
    }

    /// Polls until `n` matching events were recorded. Panics after 10 s.
    pub(crate) async fn wait_for_count(&self, pred: impl Fn(&HostEvent) -> bool, n: usize) {
        let poll = async {
            while self.count(&pred) < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(10), poll).await.is_err() {
            panic!("timed out waiting for host event; recorded: {:?}", self.events());
        }
    }

    fn record(&self, event: HostEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl TransferHost for RecordingHost {
    fn update_ui(&self) {
        self.record(HostEvent::UpdateUi);
    }

    fn on_progress(&self, message: &MessageHandle, transferred: u64, total: u64) {
        self.record(HostEvent::Progress(message.id(), transferred, total));
    }

    fn persist(&self, message: &MessageHandle) {
        self.record(HostEvent::Persist(message.id()));
    }

    fn has_internet(&self) -> bool {
        self.internet.load(Ordering::SeqCst)
    }

    fn has_storage_permission(&self) -> bool {
        self.storage.load(Ordering::SeqCst)
    }

    fn data_saver_enabled(&self) -> bool {
        self.data_saver.load(Ordering::SeqCst)
    }

    fn show_error(&self, category: ErrorCategory) {
        self.record(HostEvent::ShowError(category));
    }

    fn notify(&self, message: &MessageHandle) {
        self.record(HostEvent::Notify(message.id()));
    }

    fn notify_failed(&self, message: &MessageHandle) {
        self.record(HostEvent::NotifyFailed(message.id()));
    }

    fn media_scan(&self, path: &Path) {
        self.record(HostEvent::MediaScan(path.to_path_buf()));
    }

    fn decrypt_pgp(&self, message: &MessageHandle, notify: bool) {
        self.record(HostEvent::DecryptPgp(message.id(), notify));
    }

    fn mark_sending(&self, message: &MessageHandle) {
        self.record(HostEvent::MarkSending(message.id()));
    }

    fn mark_send_failed(&self, message: &MessageHandle, reason: &FailureReason) {
        self.record(HostEvent::MarkSendFailed(message.id(), reason.clone()));
    }

    fn resend(&self, message: &MessageHandle, delayed: bool) {
        self.record(HostEvent::Resend(message.id(), delayed));
    }
}

// ---------------------------------------------------------------------------
// Slot channel
// ---------------------------------------------------------------------------

enum SlotReply {
    Grant { base: String },
    Reject(String),
    Hang,
}

pub(crate) struct SlotChannel {
    service: Option<UploadService>,
    reply: SlotReply,
    sent: Mutex<Vec<Iq>>,
}

impl SlotChannel {
    /// No upload service advertised.
    pub(crate) fn none() -> Self {
        Self {
            service: None,
            reply: SlotReply::Hang,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Grants `<base>/files/<filename>` with an authorization header plus two
    /// headers that must be dropped.
    pub(crate) fn current(base: &str) -> Self {
        Self::with_reply(SlotReply::Grant {
            base: base.to_string(),
        })
    }

    pub(crate) fn rejecting(text: &str) -> Self {
        Self::with_reply(SlotReply::Reject(text.to_string()))
    }

    /// Never answers.
    pub(crate) fn hanging() -> Self {
        Self::with_reply(SlotReply::Hang)
    }

    fn with_reply(reply: SlotReply) -> Self {
        Self {
            service: Some(UploadService {
                host: "upload.example".into(),
                dialect: Dialect::Current,
            }),
            reply,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn sent(&self) -> Vec<Iq> {
        self.sent.lock().unwrap().clone()
    }
}

impl SignalingChannel for SlotChannel {
    fn upload_service(&self) -> Option<UploadService> {
        self.service.clone()
    }

    fn send_iq(&self, iq: Iq) -> Pin<Box<dyn Future<Output = Result<Iq, SlotError>> + Send + '_>> {
        self.sent.lock().unwrap().push(iq.clone());
        Box::pin(async move {
            match &self.reply {
                SlotReply::Grant { base } => {
                    let name = iq
                        .payload
                        .as_ref()
                        .and_then(|p| p.attribute("filename"))
                        .unwrap_or("file")
                        .to_string();
                    let url = format!("{base}/files/{name}");
                    let slot = Element::with_ns("slot", Dialect::Current.namespace())
                        .child(
                            Element::new("put")
                                .attr("url", url.clone())
                                .child(
                                    Element::new("header")
                                        .attr("name", "Authorization")
                                        .text("Bearer slot-token"),
                                )
                                .child(Element::new("header").attr("name", "X-Evil").text("1"))
                                .child(
                                    Element::new("header")
                                        .attr("name", "Cookie")
                                        .text("a=1\nSet-Cookie: b=2"),
                                ),
                        )
                        .child(Element::new("get").attr("url", url));
                    Ok(iq.result(Some(slot)))
                }
                SlotReply::Reject(text) => Ok(iq.error_reply(
                    Element::new("error")
                        .attr("type", "modify")
                        .child(Element::with_ns("text", NS_STANZAS).text(text.clone())),
                )),
                SlotReply::Hang => std::future::pending().await,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// A manager wired to a recording host and a scratch directory store.
pub(crate) struct TestEnv {
    pub(crate) manager: TransferManager,
    pub(crate) host: Arc<RecordingHost>,
    pub(crate) store: Arc<DirectoryStore>,
    pub(crate) channel: Arc<SlotChannel>,
    dir: tempfile::TempDir,
}

impl TestEnv {
    pub(crate) fn new(config: TransferConfig) -> Self {
        Self::with_channel(config, SlotChannel::none())
    }

    pub(crate) fn with_channel(config: TransferConfig, channel: SlotChannel) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("media")).unwrap();
        let host = Arc::new(RecordingHost::new());
        let store = Arc::new(DirectoryStore::new(
            dir.path().join("media"),
            dir.path().join("private"),
        ));
        let channel = Arc::new(channel);
        let services = Services::new(host.clone(), store.clone(), channel.clone());
        let manager = TransferManager::new(config, services, tokio::runtime::Handle::current());
        Self {
            manager,
            host,
            store,
            channel,
            dir,
        }
    }

    pub(crate) fn media_dir(&self) -> PathBuf {
        self.dir.path().join("media")
    }

    pub(crate) fn private_dir(&self) -> PathBuf {
        self.dir.path().join("private")
    }
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct MockRequest {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
}

impl MockRequest {
    /// Case-insensitive header lookup.
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// How the response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// `Content-Length` header.
    Length,
    /// No length; body ends when the connection closes.
    Close,
}

#[derive(Debug, Clone)]
pub(crate) struct MockResponse {
    pub(crate) status: u16,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
    pub(crate) framing: Framing,
}

impl MockResponse {
    pub(crate) fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            framing: Framing::Length,
        }
    }

    pub(crate) fn header(mut self, name: &str, value: impl ToString) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub(crate) fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub(crate) fn close_delimited(mut self) -> Self {
        self.framing = Framing::Close;
        self
    }
}

pub(crate) type Handler = Arc<dyn Fn(&MockRequest) -> MockResponse + Send + Sync>;

struct ServerState {
    handler: Handler,
    requests: Mutex<Vec<MockRequest>>,
    delay_ms: AtomicU64,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// One-response-per-connection HTTP/1.1 server on a loopback port.
pub(crate) struct MockServer {
    pub(crate) base: String,
    state: Arc<ServerState>,
    accept: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub(crate) async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(ServerState {
            handler,
            requests: Mutex::new(Vec::new()),
            delay_ms: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        });
        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, accept_state.clone()));
            }
        });
        Self {
            base: format!("http://127.0.0.1:{port}"),
            state,
            accept,
        }
    }

    /// Delays every response by `delay`.
    pub(crate) fn with_delay(self, delay: Duration) -> Self {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    pub(crate) fn url(&self, path: &str) -> Url {
        Url::parse(&format!("{}{path}", self.base)).unwrap()
    }

    pub(crate) fn requests(&self) -> Vec<MockRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub(crate) fn requests_with(&self, method: &str) -> Vec<MockRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }

    pub(crate) fn count(&self, method: &str) -> usize {
        self.requests_with(method).len()
    }

    /// Most requests being handled at the same time.
    pub(crate) fn max_concurrent(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn read_request(stream: &mut TcpStream) -> Option<MockRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let head_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let mut request = MockRequest {
        method,
        path,
        headers,
        body: buf[head_end + 4..].to_vec(),
    };

    let chunked = request
        .header("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
    if chunked {
        while find_subslice(&request.body, b"0\r\n\r\n").is_none() {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            request.body.extend_from_slice(&chunk[..n]);
        }
        request.body = decode_chunked(&request.body);
    } else if let Some(len) = request
        .header("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        while request.body.len() < len {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            request.body.extend_from_slice(&chunk[..n]);
        }
    }
    Some(request)
}

fn decode_chunked(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(line_end) = find_subslice(rest, b"\r\n") {
        let size_str = String::from_utf8_lossy(&rest[..line_end]).to_string();
        let Ok(size) = usize::from_str_radix(size_str.trim(), 16) else {
            break;
        };
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        let end = (start + size).min(rest.len());
        out.extend_from_slice(&rest[start..end]);
        rest = &rest[(end + 2).min(rest.len())..];
    }
    out
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        206 => "Partial Content",
        404 => "Not Found",
        405 => "Method Not Allowed",
        410 => "Gone",
        _ => "Status",
    }
}

async fn serve_connection(mut stream: TcpStream, state: Arc<ServerState>) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    let now = state.active.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_active.fetch_max(now, Ordering::SeqCst);
    state.requests.lock().unwrap().push(request.clone());

    let response = (state.handler)(&request);
    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    state.active.fetch_sub(1, Ordering::SeqCst);

    let mut head = format!("HTTP/1.1 {} {}\r\n", response.status, reason(response.status));
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if response.framing == Framing::Length
        && !response
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-length"))
    {
        head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    }
    head.push_str("Connection: close\r\n\r\n");

    let _ = stream.write_all(head.as_bytes()).await;
    if request.method != "HEAD" {
        let _ = stream.write_all(&response.body).await;
    }
    let _ = stream.shutdown().await;
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Answers a GET or HEAD for `data`, honoring `Range: bytes=N-` when
/// `honor_range` is set.
pub(crate) fn respond_with_file(request: &MockRequest, data: &[u8], honor_range: bool) -> MockResponse {
    let offset = request
        .header("range")
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.strip_suffix('-'))
        .and_then(|r| r.parse::<usize>().ok());
    match offset {
        Some(start) if honor_range && start < data.len() => MockResponse::new(206)
            .header(
                "Content-Range",
                format!("bytes {start}-{}/{}", data.len() - 1, data.len()),
            )
            .body(data[start..].to_vec()),
        _ => MockResponse::new(200).body(data.to_vec()),
    }
}

/// Serves `data` at every path, with range support.
pub(crate) fn serve_bytes(data: Vec<u8>) -> Handler {
    Arc::new(move |req: &MockRequest| respond_with_file(req, &data, true))
}

/// Serves `data` at every path, always from the start.
pub(crate) fn serve_bytes_ignoring_range(data: Vec<u8>) -> Handler {
    Arc::new(move |req: &MockRequest| respond_with_file(req, &data, false))
}

/// PUT stores the body under its path (201); GET and HEAD serve it back.
pub(crate) fn storage() -> Handler {
    let files: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
    Arc::new(move |req: &MockRequest| {
        let mut files = files.lock().unwrap();
        match req.method.as_str() {
            "PUT" => {
                files.insert(req.path.clone(), req.body.clone());
                MockResponse::new(201)
            }
            "GET" | "HEAD" => match files.get(&req.path) {
                Some(data) => {
                    let mime = courier_transfer::mime::guess_from_path(Path::new(&req.path));
                    respond_with_file(req, data, true).header("Content-Type", mime)
                }
                None => MockResponse::new(404),
            },
            _ => MockResponse::new(405),
        }
    })
}
