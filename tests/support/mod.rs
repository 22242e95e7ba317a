#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use cellar::body::Body;
use cellar::entry::{CacheEntry, CachedRequest};
use cellar::handler::{CacheHandler, CacheOptions, Upstream};
use cellar::response::{BoxFuture, Response, ResponseWriter};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};

pub const STATUS_HEADER: &str = "x-cache-status";

type ServeFn = dyn Fn(Arc<dyn ResponseWriter>) -> BoxFuture<'static, Result<StatusCode>>
    + Send
    + Sync;

/// Upstream stub driven by a closure, with an invocation counter.
pub struct MockUpstream {
    hits: AtomicUsize,
    serve_fn: Box<ServeFn>,
}

impl MockUpstream {
    pub fn new<F, Fut>(f: F) -> Arc<Self>
    where
        F: Fn(Arc<dyn ResponseWriter>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StatusCode>> + Send + 'static,
    {
        Arc::new(Self {
            hits: AtomicUsize::new(0),
            serve_fn: Box::new(move |writer| Box::pin(f(writer))),
        })
    }

    /// Responds 200 with the given headers and body.
    pub fn fixed(headers: &[(&str, &str)], body: &'static str) -> Arc<Self> {
        let headers: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        Self::new(move |writer| {
            let headers = headers.clone();
            async move {
                for (name, value) in &headers {
                    writer.set_header(
                        name.parse::<HeaderName>().expect("header name"),
                        value.parse::<HeaderValue>().expect("header value"),
                    );
                }
                if !body.is_empty() {
                    writer.write_chunk(Bytes::from_static(body.as_bytes())).await?;
                }
                Ok(StatusCode::OK)
            }
        })
    }

    /// Always fails without writing anything.
    pub fn failing() -> Arc<Self> {
        Self::new(|_writer| async { Err(anyhow!("upstream exploded")) })
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Upstream for MockUpstream {
    fn serve(
        &self,
        writer: Arc<dyn ResponseWriter>,
        _request: Arc<CachedRequest>,
    ) -> BoxFuture<'static, Result<StatusCode>> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        (self.serve_fn)(writer)
    }
}

/// Client-side writer that records the head and body it receives. The head
/// snapshot is taken at `write_head`, like a real wire writer; a body write
/// without a head implies 200.
pub struct RecordingWriter {
    headers: Mutex<HeaderMap>,
    head: Mutex<Option<(StatusCode, HeaderMap)>>,
    body: Mutex<Vec<u8>>,
}

impl RecordingWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            headers: Mutex::new(HeaderMap::new()),
            head: Mutex::new(None),
            body: Mutex::new(Vec::new()),
        })
    }

    pub fn head(&self) -> Option<(StatusCode, HeaderMap)> {
        self.head.lock().expect("head").clone()
    }

    pub fn status(&self) -> StatusCode {
        self.head().expect("head not written").0
    }

    pub fn sent_header(&self, name: &str) -> Option<String> {
        self.head()?
            .1
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn body(&self) -> Vec<u8> {
        self.body.lock().expect("body").clone()
    }
}

impl ResponseWriter for RecordingWriter {
    fn set_header(&self, name: HeaderName, value: HeaderValue) {
        if self.head.lock().expect("head").is_some() {
            return;
        }
        self.headers.lock().expect("headers").append(name, value);
    }

    fn write_head(&self, code: StatusCode) {
        let mut head = self.head.lock().expect("head");
        if head.is_none() {
            *head = Some((code, self.headers.lock().expect("headers").clone()));
        }
    }

    fn write_chunk(&self, chunk: Bytes) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            self.write_head(StatusCode::OK);
            self.body.lock().expect("body").extend_from_slice(&chunk);
            Ok(chunk.len())
        })
    }
}

/// Writer standing in for a disconnected client: accepts the head, fails
/// every body write.
pub struct FailingWriter {
    head: Mutex<Option<StatusCode>>,
}

impl FailingWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            head: Mutex::new(None),
        })
    }
}

impl ResponseWriter for FailingWriter {
    fn set_header(&self, _name: HeaderName, _value: HeaderValue) {}

    fn write_head(&self, code: StatusCode) {
        let mut head = self.head.lock().expect("head");
        if head.is_none() {
            *head = Some(code);
        }
    }

    fn write_chunk(&self, _chunk: Bytes) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async { Err(anyhow!("client went away")) })
    }
}

pub fn request(method: Method, uri: &str, headers: &[(&str, &str)]) -> CachedRequest {
    let uri: Uri = uri.parse().expect("uri");
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            name.parse::<HeaderName>().expect("header name"),
            value.parse::<HeaderValue>().expect("header value"),
        );
    }
    CachedRequest::new(method, uri, map)
}

pub fn get(uri: &str) -> CachedRequest {
    request(Method::GET, uri, &[])
}

pub fn test_options() -> CacheOptions {
    CacheOptions {
        status_header: Some(HeaderName::from_static(STATUS_HEADER)),
        ..CacheOptions::default()
    }
}

pub fn cache_handler(upstream: Arc<MockUpstream>) -> Arc<CacheHandler> {
    CacheHandler::new(test_options(), upstream)
}

pub fn cache_handler_with(options: CacheOptions, upstream: Arc<MockUpstream>) -> Arc<CacheHandler> {
    CacheHandler::new(options, upstream)
}

pub async fn do_request(
    handler: &Arc<CacheHandler>,
    request: &CachedRequest,
) -> (Result<StatusCode>, Arc<RecordingWriter>) {
    let writer = RecordingWriter::new();
    let sink: Arc<dyn ResponseWriter> = writer.clone();
    let result = handler.serve(sink, request).await;
    (result, writer)
}

pub async fn request_and_assert(
    handler: &Arc<CacheHandler>,
    request: &CachedRequest,
    code: StatusCode,
    cache_status: &str,
    body: &[u8],
) -> Arc<RecordingWriter> {
    let (result, writer) = do_request(handler, request).await;
    result.expect("serve");
    assert_eq!(writer.status(), code);
    assert_eq!(writer.sent_header(STATUS_HEADER).as_deref(), Some(cache_status));
    assert_eq!(writer.body(), body);
    writer
}

/// Builds a public entry with a closed body, ready for index tests.
pub async fn make_entry(
    key: &str,
    request: &CachedRequest,
    response_headers: &[(&str, &str)],
    content: &[u8],
    ttl: Duration,
    body_dir: Option<&Path>,
) -> Arc<CacheEntry> {
    let response = Arc::new(Response::new());
    for (name, value) in response_headers {
        response.set_header(
            name.parse::<HeaderName>().expect("header name"),
            value.parse::<HeaderValue>().expect("header value"),
        );
    }
    response.write_header(StatusCode::OK);
    let body = match body_dir {
        Some(dir) => Body::file_in(dir).expect("file body"),
        None => Body::buffer(),
    };
    response.set_body(body);
    if !content.is_empty() {
        response
            .write(Bytes::copy_from_slice(content))
            .await
            .expect("write body");
    }
    response.close();
    Arc::new(CacheEntry::new(
        key.to_string(),
        request,
        response,
        true,
        Instant::now() + ttl,
    ))
}

/// Entry that only occupies a coalescing slot.
pub async fn make_private_entry(key: &str, request: &CachedRequest, ttl: Duration) -> Arc<CacheEntry> {
    let response = Arc::new(Response::new());
    response.write_header(StatusCode::OK);
    response.close();
    Arc::new(CacheEntry::new(
        key.to_string(),
        request,
        response,
        false,
        Instant::now() + ttl,
    ))
}
