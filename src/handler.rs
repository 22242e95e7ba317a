use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::{CONNECTION, HOST, RANGE, UPGRADE};
use http::{HeaderName, HeaderValue, Method, StatusCode};
use tokio::sync::mpsc;

use crate::body::Body;
use crate::config;
use crate::entry::{CacheEntry, CachedRequest};
use crate::index::HttpCache;
use crate::keylock::UrlLock;
use crate::response::{BoxFuture, Response, ResponseWriter};
use crate::rules::{self, CacheRule};

pub const STATUS_HIT: &str = "hit";
pub const STATUS_MISS: &str = "miss";
pub const STATUS_SKIP: &str = "skip";
pub const STATUS_BYPASS: &str = "bypass";

/// The single collaborator the cache drives: whatever sits behind it
/// (a proxy client, another middleware, a test double) serves the request
/// by writing into the provided writer.
pub trait Upstream: Send + Sync {
    fn serve(
        &self,
        writer: Arc<dyn ResponseWriter>,
        request: Arc<CachedRequest>,
    ) -> BoxFuture<'static, Result<StatusCode>>;
}

/// Runtime cache options, parsed once at handler construction.
#[derive(Clone)]
pub struct CacheOptions {
    /// Response header stamped with hit/miss/skip/bypass; `None` disables.
    pub status_header: Option<HeaderName>,
    /// Freshness used when a rule matches but the response carries no
    /// explicit expiration.
    pub default_max_age: Duration,
    /// Freshness of private entries kept purely to bound coalescing.
    pub lock_timeout: Duration,
    /// Directory for file-backed bodies; `None` keeps bodies in memory.
    pub storage_path: Option<PathBuf>,
    pub cache_key_template: String,
    pub rules: Vec<CacheRule>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            status_header: None,
            default_max_age: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(300),
            storage_path: None,
            cache_key_template: DEFAULT_KEY_TEMPLATE.to_string(),
            rules: Vec::new(),
        }
    }
}

pub const DEFAULT_KEY_TEMPLATE: &str = "{method} {host}{path}?{query}";

impl CacheOptions {
    pub fn from_config(cfg: &config::Cache) -> Result<Self> {
        let status_header = if cfg.status_header.trim().is_empty() {
            None
        } else {
            Some(
                cfg.status_header
                    .parse::<HeaderName>()
                    .context("parse cache.status_header")?,
            )
        };
        let storage_path = if cfg.path.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(&cfg.path))
        };
        Ok(Self {
            status_header,
            default_max_age: cfg.default_max_age,
            lock_timeout: cfg.lock_timeout,
            storage_path,
            cache_key_template: cfg.cache_key_template.clone(),
            rules: cfg.rules.clone(),
        })
    }
}

/// Per-request orchestration: bypass / hit / skip / miss, with per-key
/// request coalescing and streaming bodies.
pub struct CacheHandler {
    options: CacheOptions,
    cache: HttpCache,
    locks: Arc<UrlLock>,
    next: Arc<dyn Upstream>,
}

impl CacheHandler {
    pub fn new(options: CacheOptions, next: Arc<dyn Upstream>) -> Arc<Self> {
        let locks = Arc::new(UrlLock::new());
        let cache = HttpCache::new(Arc::clone(&locks));
        Arc::new(Self {
            options,
            cache,
            locks,
            next,
        })
    }

    pub async fn serve(
        &self,
        writer: Arc<dyn ResponseWriter>,
        request: &CachedRequest,
    ) -> Result<StatusCode> {
        if !should_use_cache(request) {
            self.stamp_status(writer.as_ref(), request, STATUS_BYPASS);
            return self.next.serve(writer, Arc::new(request.detached())).await;
        }

        let key = self.cache_key(request);
        let lock = self.locks.acquire(&key).await;

        match self.cache.get(&key, &request.headers).await {
            // HIT: a public entry is served as stored.
            Some(entry) if entry.is_public => {
                drop(lock);
                self.respond(&writer, request, &entry, STATUS_HIT).await
            }

            // SKIP: a private entry holds the slot. It is never served;
            // upstream is asked again in case the response turned public.
            Some(_) => {
                drop(lock);
                let (entry, upstream_err) = self.fetch_upstream(&key, request).await;
                if entry.is_public {
                    if let Err(err) = self.attach_public_storage(&entry) {
                        entry.response.abort();
                        return Err(err);
                    }
                    self.cache.put(key, Arc::clone(&entry)).await;
                    let code = self.respond(&writer, request, &entry, STATUS_MISS).await?;
                    return finish(code, upstream_err);
                }
                let code = self.respond(&writer, request, &entry, STATUS_SKIP).await?;
                finish(code, upstream_err)
            }

            // MISS: fetch upstream. The entry is inserted even when it is
            // private so duplicate requests keep coalescing on the key lock.
            None => {
                let (entry, upstream_err) = self.fetch_upstream(&key, request).await;
                if entry.is_public {
                    if let Err(err) = self.attach_public_storage(&entry) {
                        entry.response.abort();
                        drop(lock);
                        return Err(err);
                    }
                }
                self.cache.put(key, Arc::clone(&entry)).await;
                drop(lock);
                let code = self.respond(&writer, request, &entry, STATUS_MISS).await?;
                finish(code, upstream_err)
            }
        }
    }

    /// Spawns the producer task and returns once upstream has committed its
    /// headers. The producer keeps streaming into the response body after
    /// this returns; it is detached from the originating client, so a
    /// disconnect cannot corrupt the body other coalesced clients tail.
    async fn fetch_upstream(
        &self,
        key: &str,
        request: &CachedRequest,
    ) -> (Arc<CacheEntry>, Option<anyhow::Error>) {
        let response = Arc::new(Response::new());
        let detached = Arc::new(request.detached());
        let next = Arc::clone(&self.next);
        let (err_tx, mut err_rx) = mpsc::channel(1);

        let producer_response = Arc::clone(&response);
        tokio::spawn(async move {
            let writer: Arc<dyn ResponseWriter> = Arc::clone(&producer_response) as Arc<dyn ResponseWriter>;
            let code = match next.serve(writer, detached).await {
                Ok(code) => code,
                Err(err) => {
                    let _ = err_tx.try_send(err);
                    StatusCode::BAD_GATEWAY
                }
            };
            // Upstream may have returned without writing anything; this
            // opens the header gate in that case and is a no-op otherwise.
            producer_response.write_header(code);
            // The body store is attached by the orchestrator. Closing
            // before that would strand it, so wait for the gate.
            producer_response.wait_body().await;
            producer_response.close();
        });

        response.wait_headers().await;

        let snapshot = response.snapshot_headers();
        let (is_public, expiration) = rules::cacheable_status(
            request,
            response.code(),
            &snapshot,
            &self.options.rules,
            self.options.default_max_age,
            self.options.lock_timeout,
        );
        let entry = Arc::new(CacheEntry::new(
            key.to_string(),
            request,
            response,
            is_public,
            expiration,
        ));
        (entry, err_rx.try_recv().ok())
    }

    fn attach_public_storage(&self, entry: &CacheEntry) -> Result<()> {
        let body = match &self.options.storage_path {
            Some(dir) => Body::file_in(dir)?,
            None => Body::buffer(),
        };
        entry.response.set_body(body);
        Ok(())
    }

    async fn respond(
        &self,
        writer: &Arc<dyn ResponseWriter>,
        request: &CachedRequest,
        entry: &CacheEntry,
        status: &str,
    ) -> Result<StatusCode> {
        self.stamp_status(writer.as_ref(), request, status);

        let snapshot = entry.response.snapshot_headers();
        for (name, value) in snapshot.iter() {
            writer.set_header(name.clone(), value.clone());
        }
        let code = entry.response.code();
        writer.write_head(code);

        if entry.is_public {
            let mut reader = entry.response.reader()?;
            let mut buf = vec![0u8; 32 * 1024];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                writer.write_chunk(Bytes::copy_from_slice(&buf[..n])).await?;
            }
        } else {
            // Private bodies stream straight into this client's writer;
            // attaching it unblocks the producer's first byte.
            entry
                .response
                .set_body(Body::passthrough(Arc::clone(writer)));
            entry.response.wait_close().await;
        }
        Ok(code)
    }

    fn stamp_status(&self, writer: &dyn ResponseWriter, request: &CachedRequest, status: &str) {
        request.context.set_replacement("cache_status", status);
        if let Some(name) = &self.options.status_header {
            if let Ok(value) = HeaderValue::from_str(status) {
                writer.set_header(name.clone(), value);
            }
        }
    }

    pub fn cache_key(&self, request: &CachedRequest) -> String {
        expand_key_template(&self.options.cache_key_template, request)
    }

    pub fn cache(&self) -> &HttpCache {
        &self.cache
    }
}

fn finish(code: StatusCode, upstream_err: Option<anyhow::Error>) -> Result<StatusCode> {
    match upstream_err {
        Some(err) => Err(err),
        None => Ok(code),
    }
}

/// Requests outside the cache's reach: non-GET/HEAD methods, range
/// requests, websocket upgrades. These pass straight through.
pub fn should_use_cache(request: &CachedRequest) -> bool {
    if request.method != Method::GET && request.method != Method::HEAD {
        return false;
    }
    if request.headers.contains_key(RANGE) {
        return false;
    }
    let connection = header_str(&request.headers, CONNECTION);
    let upgrade = header_str(&request.headers, UPGRADE);
    if connection.eq_ignore_ascii_case("upgrade") && upgrade.eq_ignore_ascii_case("websocket") {
        return false;
    }
    true
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Expands the cache-key template with the request's parts and any replacer
/// values carried in its context.
fn expand_key_template(template: &str, request: &CachedRequest) -> String {
    let uri = request.context.original_uri.as_ref().unwrap_or(&request.uri);
    let query = uri.query().unwrap_or("");
    let host = uri
        .host()
        .map(str::to_string)
        .or_else(|| {
            request
                .headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let mut out = template.to_string();
    // Both "with ?query" and "without" spellings of the same resource must
    // produce one key, so an empty query drops the joining '?'.
    if query.is_empty() {
        out = out.replace("?{query}", "");
    }
    out = out
        .replace("{method}", request.method.as_str())
        .replace("{scheme}", uri.scheme_str().unwrap_or("http"))
        .replace("{host}", &host)
        .replace("{path}", uri.path())
        .replace("{query}", query)
        .replace("{uri}", &path_and_query);

    let replacements = request
        .context
        .replacements
        .lock()
        .expect("request replacements");
    for (name, value) in replacements.iter() {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}
