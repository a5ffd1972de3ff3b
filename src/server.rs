//! HTTP server and graceful shutdown.
//!
//! The bridge between hyper and the pipeline core: it accepts connections,
//! turns each hyper request into a [`Request`] plus a [`Context`], wires the
//! connection's fate to the transport cancellation scope, and hands the
//! whole thing to [`App::handle`].
//!
//! # Graceful shutdown
//!
//! On SIGTERM or Ctrl-C the server stops accepting immediately, lets every
//! in-flight connection run to completion, then returns from
//! [`Server::serve`]. Kubernetes sends SIGTERM and waits
//! `terminationGracePeriodSeconds` before SIGKILL — set it longer than your
//! slowest request.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::app::App;
use crate::request::Request;
use crate::scope::{CancelHandle, Scope};
use crate::transport::Transport;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Infrastructure failures surfaced by [`Server::serve`].
///
/// Application-level failures never appear here — the executor turns them
/// into responses.
#[derive(Debug)]
pub enum ServeError {
    /// Binding or accepting on the listener failed.
    Io(std::io::Error),
    /// The app has no middleware registered; serving it would 200 every
    /// request with an empty body, which is never what you meant.
    NoMiddleware,
}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {e}"),
            Self::NoMiddleware => f.write_str("no middleware registered"),
        }
    }
}

impl std::error::Error for ServeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::NoMiddleware => None,
        }
    }
}

impl From<std::io::Error> for ServeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not a valid `host:port` string.
    pub fn bind(addr: &str) -> Self {
        let addr: SocketAddr = addr.parse().expect("invalid socket address");
        Self { addr }
    }

    /// Starts accepting connections and running each request through `app`.
    ///
    /// Returns only after a full graceful shutdown (SIGTERM or Ctrl-C,
    /// followed by all in-flight requests completing).
    pub async fn serve(self, app: App) -> Result<(), ServeError> {
        if !app.has_middleware() {
            return Err(ServeError::NoMiddleware);
        }

        let listener = TcpListener::bind(self.addr).await?;
        let app = Arc::new(app);

        info!(addr = %self.addr, env = ?app.current_env(), "pinion listening");

        // JoinSet tracks every connection task so shutdown can drain them.
        let mut tasks = tokio::task::JoinSet::new();

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Shutdown checked first so SIGTERM stops the accept loop
                // even with connections queued.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let app = Arc::clone(&app);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        let svc = service_fn(move |req| {
                            let app = Arc::clone(&app);
                            async move { dispatch(app, req).await }
                        });

                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks so the JoinSet stays bounded.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("pinion stopped");
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Runs one request end to end.
///
/// The error type is [`Infallible`](std::convert::Infallible): every failure
/// becomes a response inside the executor, hyper never sees an error. If the
/// client disconnects, hyper drops this future mid-await — the drop guard
/// then fires the transport cancellation scope, and the still-running
/// pipeline task observes it through the ended flag.
async fn dispatch(
    app: Arc<App>,
    req: hyper::Request<hyper::body::Incoming>,
) -> Result<http::Response<Full<Bytes>>, std::convert::Infallible> {
    let (parts, body) = req.into_parts();

    let headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (name.as_str().to_owned(), String::from_utf8_lossy(value.as_bytes()).into_owned())
        })
        .collect();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("failed to read request body: {e}");
            return Ok(plain(StatusCode::BAD_REQUEST, "bad request"));
        }
    };

    let request = Request::new(parts.method, parts.uri.path(), headers, body);

    let (transport_scope, disconnect) = Scope::new();
    let _guard = FireOnDrop(disconnect);

    let (transport, reply) = HyperTransport::new();
    let ctx = app.context(request, &transport_scope, Box::new(transport));
    app.handle(ctx).await;

    Ok(reply.await.unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error")))
}

/// Fires its cancellation handle when dropped. Firing after the scope
/// already ended is a no-op, so the guard may drop on every path.
struct FireOnDrop(CancelHandle);

impl Drop for FireOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn plain(status: StatusCode, body: &'static str) -> http::Response<Full<Bytes>> {
    let mut res = http::Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *res.status_mut() = status;
    res
}

// ── Hyper-backed transport ────────────────────────────────────────────────────

/// Buffers the response and releases it to the waiting [`dispatch`] future
/// on finalize, through a oneshot channel.
struct HyperTransport {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    reply: Option<oneshot::Sender<http::Response<Full<Bytes>>>>,
}

impl HyperTransport {
    fn new() -> (Self, oneshot::Receiver<http::Response<Full<Bytes>>>) {
        let (tx, rx) = oneshot::channel();
        (Self { status: 200, headers: Vec::new(), body: Vec::new(), reply: Some(tx) }, rx)
    }
}

impl Transport for HyperTransport {
    fn set_status(&mut self, code: u16) {
        self.status = code;
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        self.headers.push((name.to_owned(), value.to_owned()));
    }

    fn write_body(&mut self, body: &[u8]) {
        self.body.clear();
        self.body.extend_from_slice(body);
    }

    fn finalize(&mut self) -> std::io::Result<()> {
        let Some(reply) = self.reply.take() else {
            return Err(std::io::Error::other("transport already finalized"));
        };

        let status = StatusCode::from_u16(self.status).map_err(std::io::Error::other)?;
        let mut builder = http::Response::builder().status(status);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        let response = builder
            .body(Full::new(Bytes::from(std::mem::take(&mut self.body))))
            .map_err(std::io::Error::other)?;

        if reply.send(response).is_err() {
            // The dispatch future is gone — client disconnected. Nothing
            // left to deliver the response to.
            warn!("response ready but client already disconnected");
        }
        Ok(())
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives: SIGTERM or
/// SIGINT on Unix, Ctrl-C elsewhere.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    // On non-Unix platforms the SIGTERM arm never resolves.
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
