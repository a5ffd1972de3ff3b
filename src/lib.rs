//! # pinion
//!
//! The request-processing core of an HTTP middleware framework.
//! Nothing more. Nothing less.
//!
//! ## The contract
//!
//! Your router matches paths. Your proxy terminates TLS. Your templates
//! render themselves. pinion does none of that — by design. What it does is
//! the part every middleware stack gets subtly wrong: turning one inbound
//! request into an ordered sequence of middleware invocations that ends
//! deterministically, whatever goes wrong along the way.
//!
//! Three guarantees, held on every path — normal completion, early exit,
//! middleware error, client disconnect, and panic:
//!
//! - **Exactly-once finalization** — the response transport's `finalize` is
//!   invoked once per request, never zero times, never twice.
//! - **Cooperative cancellation** — a per-request tree of one-shot
//!   [cancellation scopes](Scope), parented to the transport signal.
//!   Canceling a parent cancels every descendant; a deadline and an explicit
//!   cancel are distinguishable by [`Reason`]. The pipeline polls the ended
//!   flag between steps; in-flight middleware are never pre-empted.
//! - **Panic containment** — a panic in any middleware becomes a 500 with a
//!   captured stack trace reported to the diagnostic [`Sink`]; the process
//!   keeps serving.
//!
//! Heterogeneous failures flow through one normalization point: middleware
//! return a [`Fault`], [`normalize`] makes it a structured [`Error`], and
//! the [`OnError`] capability decides what the client sees.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use pinion::{App, Context, Error, Fault, Server, middleware};
//!
//! async fn guard(ctx: Context) -> Result<(), Fault> {
//!     if ctx.request().header("authorization").is_none() {
//!         return Err(Error::new(401, "missing credentials").into());
//!     }
//!     Ok(())
//! }
//!
//! async fn hello(ctx: Context) -> Result<(), Fault> {
//!     ctx.text(200, "hello, pinion").map_err(Fault::opaque)
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = App::new()
//!         .with(middleware::timeout(Duration::from_secs(5), |ctx| {
//!             let _ = ctx.text(504, "service timeout");
//!             ctx.cancel();
//!         }))
//!         .with(guard)
//!         .with(hello);
//!
//!     Server::bind("0.0.0.0:3000").serve(app).await.unwrap();
//! }
//! ```

mod app;
mod context;
mod error;
mod request;
mod scope;
mod server;
mod transport;

pub mod middleware;

pub use app::{App, DefaultOnError, Env, OnError, Sink};
pub use context::Context;
pub use error::{Error, Fault, HttpError, normalize};
pub use request::Request;
pub use scope::{CancelHandle, Reason, Scope};
pub use server::{ServeError, Server};
pub use transport::{AlreadySent, Compress, Transport};
pub use middleware::Middleware;
