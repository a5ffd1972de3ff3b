//! The application: middleware list, typed configuration, and the pipeline
//! executor.
//!
//! # The executor's promises
//!
//! For every request, [`App::handle`]:
//!
//! 1. rejects paths containing a doubled separator (`"//"`) with 404 before
//!    any middleware runs;
//! 2. watches the transport-level cancellation signal in the background and
//!    latches the context's ended flag when it fires — never touching the
//!    response;
//! 3. runs middleware strictly in registration order, stopping on the first
//!    error or as soon as the ended flag is observed between steps;
//! 4. forces the ended flag after the loop, closing the race against late
//!    cancellation;
//! 5. routes any error through the [`OnError`] capability, reports
//!    server-classified results to the diagnostic [`Sink`], and writes the
//!    classified status and message as the response;
//! 6. finalizes the response exactly once — on the normal path, on early
//!    exit, on error, and on panic;
//! 7. contains any panic raised by middleware, classification, or
//!    finalization: the request answers 500 with a recovered-panic report,
//!    the process keeps serving.

use std::any::Any;
use std::backtrace::Backtrace;
use std::sync::Arc;

use tracing::error;

use crate::context::Context;
use crate::error::{Error, Fault, normalize};
use crate::middleware::{BoxedMiddleware, Middleware};
use crate::request::Request;
use crate::scope::Scope;
use crate::transport::{Compress, Transport};

// ── External capabilities ─────────────────────────────────────────────────────

/// Classifies a middleware failure into the [`Error`] written out.
///
/// Must be total — never panic — and side-effect free beyond inspecting the
/// context. Returning `None` suppresses the response write for that failure.
pub trait OnError: Send + Sync {
    fn on_error(&self, ctx: &Context, fault: Fault) -> Option<Error>;
}

/// The default classifier: [`normalize`], with the context's already-set
/// status as the fallback code when it is an error status.
pub struct DefaultOnError;

impl OnError for DefaultOnError {
    fn on_error(&self, ctx: &Context, fault: Fault) -> Option<Error> {
        let status = ctx.status();
        let fallback = (status >= 400).then_some(status);
        normalize(Some(fault), fallback)
    }
}

/// Diagnostic sink for server-classified errors and recovered panics.
///
/// Fire-and-forget; implementations must not block the executor meaningfully.
pub trait Sink: Send + Sync {
    fn report(&self, message: &str);
}

/// The default sink logs through `tracing` at error level.
struct TracingSink;

impl Sink for TracingSink {
    fn report(&self, message: &str) {
        error!("{message}");
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Deployment environment. Informational; read via [`App::env`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Env {
    Development,
    Production,
}

// ── App ───────────────────────────────────────────────────────────────────────

/// The top-level application instance.
///
/// Configuration is a set of named, typed fields fixed before serving begins
/// — middleware and settings are read-only for the lifetime of any request,
/// so the hot path takes no locks on them.
///
/// ```rust,no_run
/// use pinion::{App, Context, Fault, Server};
///
/// async fn hello(ctx: Context) -> Result<(), Fault> {
///     ctx.text(200, "hello, pinion").map_err(Fault::opaque)
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let app = App::new().with(hello);
///     Server::bind("0.0.0.0:3000").serve(app).await.unwrap();
/// }
/// ```
pub struct App {
    middleware: Vec<BoxedMiddleware>,
    on_error: Arc<dyn OnError>,
    sink: Arc<dyn Sink>,
    compress: Option<Arc<dyn Compress>>,
    env: Env,
}

impl App {
    pub fn new() -> Self {
        Self {
            middleware: Vec::new(),
            on_error: Arc::new(DefaultOnError),
            sink: Arc::new(TracingSink),
            compress: None,
            env: Env::Development,
        }
    }

    /// Appends a middleware. Registration order is invocation order — no
    /// priorities, no reordering.
    pub fn with(mut self, mw: impl Middleware) -> Self {
        self.middleware.push(mw.into_boxed());
        self
    }

    /// Replaces the error classifier. Defaults to [`DefaultOnError`].
    pub fn on_error(mut self, on_error: impl OnError + 'static) -> Self {
        self.on_error = Arc::new(on_error);
        self
    }

    /// Replaces the diagnostic sink. Defaults to a `tracing`-backed sink.
    pub fn sink(mut self, sink: impl Sink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Installs a transport wrapper, applied before the pipeline runs and
    /// closed exactly once via finalization. Off by default.
    pub fn compress(mut self, compress: impl Compress + 'static) -> Self {
        self.compress = Some(Arc::new(compress));
        self
    }

    pub fn env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }

    pub fn current_env(&self) -> Env {
        self.env
    }

    pub(crate) fn has_middleware(&self) -> bool {
        !self.middleware.is_empty()
    }

    /// Builds the per-request [`Context`] over `parent` — the transport's
    /// cancellation signal — applying the configured compression wrapper.
    pub fn context(&self, req: Request, parent: &Scope, transport: Box<dyn Transport>) -> Context {
        let transport = match &self.compress {
            Some(compress) => compress.wrap(transport),
            None => transport,
        };
        Context::new(req, parent, transport)
    }

    // ── Executor ──────────────────────────────────────────────────────────────

    /// Drives one request through the pipeline to a finalized response.
    ///
    /// The pipeline itself runs on its own task; this method is the
    /// per-request recovery boundary around it.
    ///
    /// A recovered panic becomes a 500 whose `meta` carries the panic
    /// payload and a backtrace. The backtrace is captured here at the
    /// recovery boundary, after the pipeline task has already unwound, so
    /// it shows where the panic was caught rather than the frames that
    /// raised it; the payload message is the pointer back to the culprit.
    /// Capturing the panic-site frames would require a process-global
    /// [`std::panic::set_hook`], and this crate never touches global
    /// process state.
    pub async fn handle(self: &Arc<Self>, ctx: Context) {
        let watcher = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.done().await;
                ctx.mark_ended();
            })
        };

        let app = Arc::clone(self);
        let pipeline = {
            let ctx = ctx.clone();
            tokio::spawn(async move { app.run(ctx).await })
        };

        if let Err(failure) = pipeline.await {
            let msg = match failure.try_into_panic() {
                Ok(payload) => panic_message(payload.as_ref()),
                Err(join_err) => join_err.to_string(),
            };
            let err = Error::with_meta(
                500,
                format!("panic recovered: {msg}"),
                Backtrace::force_capture().to_string(),
            );
            ctx.mark_ended();
            self.sink.report(&err.to_string());
            let _ = ctx.text(500, &err.msg);
            if let Err(e) = ctx.respond() {
                // Already on the recovery path; the request is a loss, the
                // process is not.
                error!("finalize failed during panic recovery: {e}");
            }
        }

        // Release every background waiter tied to this request: the watcher
        // above, timeout watchers, and anything middleware parked on done().
        ctx.cancel();
        watcher.await.ok();
    }

    /// The pipeline proper. Runs inside the spawned task so that a panic
    /// anywhere in here — middleware, classification, finalization — unwinds
    /// into the join handle [`handle`](App::handle) is waiting on.
    async fn run(&self, ctx: Context) {
        // handle "/abc//efg" before any middleware sees it
        if ctx.request().path().contains("//") {
            let _ = ctx.text(404, "Not Found");
            finalize(&ctx);
            return;
        }

        let mut fault = None;
        for mw in &self.middleware {
            if let Err(f) = mw.call(ctx.clone()).await {
                fault = Some(f);
                break;
            }
            if ctx.is_ended() {
                break;
            }
        }

        // The loop may have finished before the cancellation watcher fired;
        // force the flag so finalization never races the ended decision.
        ctx.mark_ended();

        if let Some(fault) = fault {
            ctx.clear_after();
            if let Some(err) = self.on_error.on_error(&ctx, fault) {
                if err.is_server() {
                    self.sink.report(&err.to_string());
                }
                let code = if err.code == 0 { 500 } else { err.code };
                let _ = ctx.text(code, &err.msg);
            }
        } else {
            ctx.run_after();
        }

        finalize(&ctx);
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

/// Finalizes the response or escalates to the recovery boundary. Errors
/// returned by the transport's finalize are unrecoverable for the request
/// and are never retried.
fn finalize(ctx: &Context) {
    if let Err(e) = ctx.respond() {
        panic!("finalize failed: {e}");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}
