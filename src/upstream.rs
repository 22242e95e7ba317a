use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::{HeaderName, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::entry::CachedRequest;
use crate::handler::Upstream;
use crate::response::{BoxFuture, ResponseWriter};

const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Default upstream: forwards the request to one of the configured
/// addresses and streams the response into the cache's writer frame by
/// frame, so readers can tail the body while it downloads.
pub struct ProxyUpstream {
    client: Client<HttpConnector, Full<Bytes>>,
    addresses: Vec<String>,
    counter: AtomicUsize,
}

impl ProxyUpstream {
    pub fn new(addresses: Vec<String>) -> Result<Self> {
        if addresses.is_empty() {
            return Err(anyhow!("upstream.address is empty"));
        }
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Ok(Self {
            client,
            addresses,
            counter: AtomicUsize::new(0),
        })
    }

    fn pick_address(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.addresses[n % self.addresses.len()].clone()
    }
}

impl Upstream for ProxyUpstream {
    fn serve(
        &self,
        writer: Arc<dyn ResponseWriter>,
        request: Arc<CachedRequest>,
    ) -> BoxFuture<'static, Result<StatusCode>> {
        let client = self.client.clone();
        let address = self.pick_address();
        Box::pin(async move {
            let uri = build_upstream_uri(&request, &address)?;
            let mut builder = http::Request::builder().method(request.method.clone()).uri(uri);
            for (name, value) in request.headers.iter() {
                if is_hop_header(name) {
                    continue;
                }
                builder = builder.header(name, value);
            }
            let outbound = builder
                .body(Full::new(Bytes::new()))
                .context("build upstream request")?;

            let resp = client.request(outbound).await.context("upstream request")?;
            let status = resp.status();
            for (name, value) in resp.headers().iter() {
                if is_hop_header(name) {
                    continue;
                }
                writer.set_header(name.clone(), value.clone());
            }
            writer.write_head(status);

            let mut body = resp.into_body();
            while let Some(frame) = body.frame().await {
                let frame = frame.context("read upstream body")?;
                if let Ok(data) = frame.into_data() {
                    if !data.is_empty() {
                        writer.write_chunk(data).await?;
                    }
                }
            }
            Ok(status)
        })
    }
}

fn is_hop_header(name: &HeaderName) -> bool {
    HOP_HEADERS.contains(&name.as_str())
}

fn build_upstream_uri(request: &CachedRequest, address: &str) -> Result<Uri> {
    let base = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    let path = request
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{base}{path}")
        .parse::<Uri>()
        .context("parse upstream uri")
}
