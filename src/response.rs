use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::sync::Notify;

use crate::body::{Body, BodyReader};
use crate::sniff;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The response-writer shape handed to upstream handlers. Implemented by
/// [`Response`] itself, by the host server's client bridge, and by test
/// recorders.
pub trait ResponseWriter: Send + Sync {
    /// Adds a header. Calls after the head has been written are dropped.
    fn set_header(&self, name: HeaderName, value: HeaderValue);
    /// Commits status and headers. Only the first call has any effect.
    fn write_head(&self, code: StatusCode);
    fn write_chunk(&self, chunk: Bytes) -> BoxFuture<'_, Result<usize>>;
    fn flush_output(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// One-shot gate: opens exactly once, wakes every waiter, stays open.
pub struct Gate {
    opened: AtomicBool,
    notify: Notify,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            opened: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn open(&self) {
        self.opened.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        if self.is_open() {
            return;
        }
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register with the notifier before re-checking, so an open()
            // racing with this wait cannot slip between check and sleep.
            notified.as_mut().enable();
            if self.is_open() {
                return;
            }
            notified.await;
            if self.is_open() {
                return;
            }
        }
    }
}

struct Head {
    code: StatusCode,
    snapshot: HeaderMap,
}

/// Stand-in response writer that decouples header emission, body-store
/// selection and body delivery.
///
/// The producer (upstream handler) mutates headers, writes the head and
/// streams body bytes. The orchestrator waits for `headers_ready`, picks a
/// body store based on the snapshot, and attaches it with [`Response::set_body`],
/// which unblocks the producer's first body byte. Readers can be attached at
/// any point after that and tail the store while it is still being written.
pub struct Response {
    headers: Mutex<HeaderMap>,
    head: OnceLock<Head>,
    body: OnceLock<Option<Body>>,
    headers_ready: Gate,
    body_ready: Gate,
    closed: Gate,
}

impl Response {
    pub fn new() -> Self {
        Self {
            headers: Mutex::new(HeaderMap::new()),
            head: OnceLock::new(),
            body: OnceLock::new(),
            headers_ready: Gate::new(),
            body_ready: Gate::new(),
            closed: Gate::new(),
        }
    }

    /// Commits the status code and snapshots the headers. Idempotent; only
    /// the first call wins.
    pub fn write_header(&self, code: StatusCode) {
        if self.head.get().is_some() {
            return;
        }
        let snapshot = self.headers.lock().expect("response headers").clone();
        let _ = self.head.set(Head { code, snapshot });
        self.headers_ready.open();
    }

    /// Streams a chunk into the body store. The first call implies
    /// `write_header(200)` (with content-type detection over the first
    /// bytes) and blocks until a store has been attached.
    pub async fn write(&self, chunk: Bytes) -> Result<usize> {
        self.write_header_for(&chunk);
        self.body_ready.wait().await;
        match self.body.get() {
            Some(Some(body)) => body.write(chunk).await,
            _ => Err(anyhow!("no body storage attached")),
        }
    }

    fn write_header_for(&self, chunk: &[u8]) {
        if self.head.get().is_some() {
            return;
        }
        {
            let mut headers = self.headers.lock().expect("response headers");
            if !headers.contains_key(CONTENT_TYPE) && !headers.contains_key(TRANSFER_ENCODING) {
                let sample = &chunk[..chunk.len().min(512)];
                if let Ok(value) = HeaderValue::from_str(sniff::detect_content_type(sample)) {
                    headers.insert(CONTENT_TYPE, value);
                }
            }
        }
        self.write_header(StatusCode::OK);
    }

    /// Attaches the body store and unblocks pending writes. May only be
    /// called once, after the head has been written.
    pub fn set_body(&self, body: Body) {
        if self.body.set(Some(body)).is_ok() {
            self.body_ready.open();
        }
    }

    /// Opens the body gate without attaching storage, so a failed store
    /// setup cannot strand the producer; subsequent writes error out.
    pub fn abort(&self) {
        if self.body.set(None).is_ok() {
            self.body_ready.open();
        }
    }

    /// Marks the end of the body and closes the store.
    pub fn close(&self) {
        if let Some(Some(body)) = self.body.get() {
            body.close();
        }
        self.closed.open();
    }

    /// Releases the backing storage once all readers are done.
    pub async fn clean(&self) -> Result<()> {
        match self.body.get() {
            Some(Some(body)) => body.clean().await,
            _ => Ok(()),
        }
    }

    pub async fn flush(&self) -> Result<()> {
        if self.head.get().is_none() {
            self.write_header(StatusCode::OK);
        }
        match self.body.get() {
            Some(Some(body)) => body.flush().await,
            _ => Ok(()),
        }
    }

    pub fn reader(&self) -> Result<BodyReader> {
        match self.body.get() {
            Some(Some(body)) => body.reader(),
            _ => Err(anyhow!("no body storage attached")),
        }
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.get().and_then(|b| b.as_ref())
    }

    pub fn code(&self) -> StatusCode {
        self.head.get().map(|h| h.code).unwrap_or(StatusCode::OK)
    }

    /// Snapshot taken at `write_header` time. Safe to read once the header
    /// gate is open.
    pub fn snapshot(&self) -> Option<&HeaderMap> {
        self.head.get().map(|h| &h.snapshot)
    }

    pub fn snapshot_headers(&self) -> HeaderMap {
        self.snapshot().cloned().unwrap_or_default()
    }

    pub async fn wait_headers(&self) {
        self.headers_ready.wait().await;
    }

    pub async fn wait_body(&self) {
        self.body_ready.wait().await;
    }

    pub async fn wait_close(&self) {
        self.closed.wait().await;
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseWriter for Response {
    fn set_header(&self, name: HeaderName, value: HeaderValue) {
        if self.head.get().is_some() {
            return;
        }
        self.headers
            .lock()
            .expect("response headers")
            .append(name, value);
    }

    fn write_head(&self, code: StatusCode) {
        self.write_header(code);
    }

    fn write_chunk(&self, chunk: Bytes) -> BoxFuture<'_, Result<usize>> {
        Box::pin(self.write(chunk))
    }

    fn flush_output(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.flush())
    }
}
