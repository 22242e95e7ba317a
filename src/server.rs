use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::Bootstrap;
use crate::entry::{CachedRequest, RequestContext};
use crate::handler::{CacheHandler, CacheOptions};
use crate::response::{BoxFuture, ResponseWriter};
use crate::upstream::ProxyUpstream;

const REQUEST_ID_HEADER: &str = "X-Request-ID";
const BODY_CHANNEL_CAPACITY: usize = 32;

pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let options = CacheOptions::from_config(&cfg.cache)?;
    let upstream = Arc::new(ProxyUpstream::new(cfg.upstream.address.clone())?);
    let handler = CacheHandler::new(options, upstream);

    let addr: SocketAddr = cfg.server.addr.parse().context("parse server.addr")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    log::info!("cellar listening on {addr}");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);
    run_accept_loop(listener, shutdown_rx, handler).await
}

fn spawn_signal_handler(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = async {
                if let Some(sig) = sigterm.as_mut() {
                    let _ = sig.recv().await;
                }
            } => {}
        }
        let _ = shutdown.send(true);
    });
}

async fn run_accept_loop(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    handler: Arc<CacheHandler>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, _) = res.context("accept tcp")?;
                let peer = stream.peer_addr().ok().map(|addr| addr.to_string());
                let io = TokioIo::new(stream);
                let handler = Arc::clone(&handler);

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        handle(req, Arc::clone(&handler), peer.clone())
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::error!("http connection error: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle(
    req: Request<Incoming>,
    handler: Arc<CacheHandler>,
    remote: Option<String>,
) -> Result<Response<ChannelBody>, Infallible> {
    let request = build_cached_request(&req, remote);
    let request_id = request.context.request_id.clone();

    let (writer, head_rx, body_rx) = ClientChannel::new();
    let serve_writer: Arc<dyn ResponseWriter> = Arc::clone(&writer) as Arc<dyn ResponseWriter>;
    tokio::spawn(async move {
        if let Err(err) = handler.serve(serve_writer, &request).await {
            log::warn!("cache handler error: {err:#}");
        }
    });

    let mut resp = match head_rx.await {
        Ok((code, headers)) => {
            let mut builder = Response::builder().status(code);
            for (name, value) in headers.iter() {
                builder = builder.header(name, value);
            }
            builder
                .body(ChannelBody::new(body_rx))
                .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, "bad response head"))
        }
        // The handler failed before committing a head.
        Err(_) => plain_response(StatusCode::INTERNAL_SERVER_ERROR, "cache handler failed"),
    };
    if let Some(id) = request_id {
        if let Ok(value) = id.parse() {
            resp.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
    }
    Ok(resp)
}

fn build_cached_request(req: &Request<Incoming>, remote: Option<String>) -> CachedRequest {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:016x}", rand::random::<u64>()));
    CachedRequest {
        method: req.method().clone(),
        uri: req.uri().clone(),
        headers: req.headers().clone(),
        remote_addr: remote,
        context: RequestContext {
            original_uri: Some(req.uri().clone()),
            request_id: Some(request_id),
            ..RequestContext::default()
        },
    }
}

/// Bridge between the cache handler and one hyper response: the head
/// travels over a oneshot, body chunks over a bounded channel feeding
/// [`ChannelBody`]. Dropping the response (client disconnect) makes
/// subsequent writes fail without touching the producer.
struct ClientChannel {
    headers: Mutex<HeaderMap>,
    head_tx: Mutex<Option<oneshot::Sender<(StatusCode, HeaderMap)>>>,
    body_tx: mpsc::Sender<Bytes>,
}

impl ClientChannel {
    fn new() -> (
        Arc<Self>,
        oneshot::Receiver<(StatusCode, HeaderMap)>,
        mpsc::Receiver<Bytes>,
    ) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let channel = Arc::new(Self {
            headers: Mutex::new(HeaderMap::new()),
            head_tx: Mutex::new(Some(head_tx)),
            body_tx,
        });
        (channel, head_rx, body_rx)
    }
}

impl ResponseWriter for ClientChannel {
    fn set_header(&self, name: HeaderName, value: HeaderValue) {
        if self.head_tx.lock().expect("head slot").is_some() {
            self.headers.lock().expect("client headers").append(name, value);
        }
    }

    fn write_head(&self, code: StatusCode) {
        if let Some(tx) = self.head_tx.lock().expect("head slot").take() {
            let headers = self.headers.lock().expect("client headers").clone();
            let _ = tx.send((code, headers));
        }
    }

    fn write_chunk(&self, chunk: Bytes) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            // A body write without an explicit head implies 200.
            self.write_head(StatusCode::OK);
            let len = chunk.len();
            self.body_tx
                .send(chunk)
                .await
                .map_err(|_| anyhow!("client disconnected"))?;
            Ok(len)
        })
    }
}

/// Streaming response body backed by the chunk channel.
pub struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelBody {
    fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }
}

impl hyper::body::Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, Infallible>>> {
        self.get_mut()
            .rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|bytes| Ok(Frame::data(bytes))))
    }
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<ChannelBody> {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(Bytes::from_static(message.as_bytes()));
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(ChannelBody::new(rx))
        .expect("static response")
}
