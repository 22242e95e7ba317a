use std::time::{Duration, Instant, SystemTime};

use http::header::{CONTENT_RANGE, VARY};
use http::{HeaderMap, StatusCode};
use http_cache_semantics::CachePolicy;
use serde::Deserialize;

use crate::entry::CachedRequest;

/// Operator-defined predicates that force a matching response into the
/// cache even without explicit freshness headers.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum CacheRule {
    Path { path: String },
    Header { header: String, values: Vec<String> },
}

impl CacheRule {
    pub fn matches(&self, request: &CachedRequest, response_headers: &HeaderMap) -> bool {
        match self {
            CacheRule::Path { path } => request.uri.path().starts_with(path.as_str()),
            CacheRule::Header { header, values } => {
                let got = response_headers
                    .get(header.as_str())
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                values.iter().any(|want| want == got)
            }
        }
    }
}

/// Classifies a response: `(true, expiration)` means it may be stored and
/// re-served; `(false, now + lock_timeout)` means it only holds a
/// coalescing slot.
pub fn cacheable_status(
    request: &CachedRequest,
    code: StatusCode,
    snapshot: &HeaderMap,
    rules: &[CacheRule],
    default_max_age: Duration,
    lock_timeout: Duration,
) -> (bool, Instant) {
    let now = Instant::now();
    let private = (false, now + lock_timeout);

    // Partial responses are never stored; a cached 206 would be served to
    // clients that asked for a different range.
    if code == StatusCode::PARTIAL_CONTENT || snapshot.contains_key(CONTENT_RANGE) {
        return private;
    }

    let policy = build_policy(request, code, snapshot);
    if !policy.is_storable() {
        return private;
    }

    if vary_is_wildcard(snapshot) {
        return private;
    }

    let ttl = policy.time_to_live(SystemTime::now());
    let explicit = (ttl > Duration::ZERO).then(|| now + ttl);

    for rule in rules {
        if rule.matches(request, snapshot) {
            return (true, explicit.unwrap_or(now + default_max_age));
        }
    }

    match explicit {
        Some(at) => (true, at),
        None => private,
    }
}

fn build_policy(request: &CachedRequest, code: StatusCode, snapshot: &HeaderMap) -> CachePolicy {
    let mut req = http::Request::new(());
    *req.method_mut() = request.method.clone();
    *req.uri_mut() = request.uri.clone();
    *req.headers_mut() = request.headers.clone();

    let mut res = http::Response::new(());
    *res.status_mut() = code;
    *res.headers_mut() = snapshot.clone();

    CachePolicy::new(&req, &res)
}

fn vary_is_wildcard(snapshot: &HeaderMap) -> bool {
    snapshot
        .get_all(VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|name| name.trim() == "*")
}
