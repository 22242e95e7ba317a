use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use http::header::VARY;
use http::{HeaderMap, HeaderValue, Method, Uri};

use crate::response::Response;

/// Snapshot of the parts of a request the cache consumes: the wire basics
/// plus the host-integration context values that must survive into a
/// detached upstream fetch.
#[derive(Clone)]
pub struct CachedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Connection-scoped; intentionally absent from detached copies.
    pub remote_addr: Option<String>,
    pub context: RequestContext,
}

/// The context values downstream middlewares expect to find on a request.
/// These, and only these, are carried into the detached producer task.
#[derive(Clone, Default)]
pub struct RequestContext {
    pub original_uri: Option<Uri>,
    pub replacements: Arc<Mutex<HashMap<String, String>>>,
    pub remote_user: Option<String>,
    pub mitm: Option<bool>,
    pub request_id: Option<String>,
    pub path_prefix: Option<String>,
}

impl RequestContext {
    pub fn set_replacement(&self, key: &str, value: &str) {
        self.replacements
            .lock()
            .expect("request replacements")
            .insert(key.to_string(), value.to_string());
    }

    pub fn replacement(&self, key: &str) -> Option<String> {
        self.replacements
            .lock()
            .expect("request replacements")
            .get(key)
            .cloned()
    }
}

impl CachedRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
            remote_addr: None,
            context: RequestContext::default(),
        }
    }

    /// Copy handed to the producer task: same request line, headers and
    /// preserved context, detached from anything tied to the originating
    /// connection.
    pub fn detached(&self) -> CachedRequest {
        CachedRequest {
            method: self.method.clone(),
            uri: self.uri.clone(),
            headers: self.headers.clone(),
            remote_addr: None,
            context: self.context.clone(),
        }
    }
}

/// One cached (request-class, response) pair. Immutable once it has been
/// placed in the index; replacement happens at the index level.
pub struct CacheEntry {
    pub key: String,
    /// Enough of the request to evaluate Vary against future requests.
    pub request_headers: HeaderMap,
    pub response: Arc<Response>,
    /// Public entries are served from cache. Private entries only occupy an
    /// index slot so duplicate requests keep coalescing on the key lock.
    pub is_public: bool,
    pub expiration: Instant,
    pub created_at: Instant,
}

impl CacheEntry {
    pub fn new(
        key: String,
        request: &CachedRequest,
        response: Arc<Response>,
        is_public: bool,
        expiration: Instant,
    ) -> Self {
        Self {
            key,
            request_headers: request.headers.clone(),
            response,
            is_public,
            expiration,
            created_at: Instant::now(),
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expiration
    }

    /// True when `request_headers` agrees with this entry on every header
    /// named by the stored response's `Vary`. An absent or empty Vary
    /// matches any request for the key.
    pub fn matches_vary(&self, request_headers: &HeaderMap) -> bool {
        let Some(snapshot) = self.response.snapshot() else {
            return true;
        };
        for value in snapshot.get_all(VARY) {
            let Ok(value) = value.to_str() else {
                return false;
            };
            for name in value.split(',') {
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }
                if !header_values_equal(&self.request_headers, request_headers, name) {
                    return false;
                }
            }
        }
        true
    }
}

fn header_values_equal(a: &HeaderMap, b: &HeaderMap, name: &str) -> bool {
    let left: HashSet<&HeaderValue> = a.get_all(name).iter().collect();
    let right: HashSet<&HeaderValue> = b.get_all(name).iter().collect();
    left == right
}
