//! Middleware trait and type erasure.
//!
//! # How async middleware are stored
//!
//! The app holds an ordered list of middleware of *different* concrete
//! types. Rust collections hold one type, so we hide each middleware behind
//! a trait object (`dyn ErasedMiddleware`) and store everything uniformly.
//!
//! The chain from user code to vtable call is:
//!
//! ```text
//! async fn auth(ctx: Context) -> Result<(), Fault> { … }   ← user writes this
//!        ↓ app.with(auth)
//! auth.into_boxed()                                ← Middleware blanket impl
//!        ↓
//! Arc::new(FnMiddleware(auth))                     ← heap-allocated wrapper
//!        ↓  stored as BoxedMiddleware = Arc<dyn ErasedMiddleware>
//! mw.call(ctx)  at request time                    ← one vtable dispatch
//! ```
//!
//! The per-step runtime cost is one Arc clone plus one virtual call —
//! negligible next to network I/O.

mod timeout;

pub use timeout::timeout;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::error::Fault;

// ── Internal types ────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future for one middleware step.
///
/// `Pin<Box<…>>` because the runtime polls the future in place; `Send +
/// 'static` so tokio may move it across worker threads.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = Result<(), Fault>> + Send + 'static>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Middleware` trait's `into_boxed` method.
#[doc(hidden)]
pub trait ErasedMiddleware {
    fn call(&self, ctx: Context) -> BoxFuture;
}

/// A heap-allocated, type-erased middleware shared across concurrent requests.
#[doc(hidden)]
pub type BoxedMiddleware = Arc<dyn ErasedMiddleware + Send + Sync + 'static>;

// ── Public Middleware trait ───────────────────────────────────────────────────

/// Implemented for every valid middleware.
///
/// You never implement this yourself. It is automatically satisfied for any
/// `async fn` or closure with the signature:
///
/// ```text
/// async fn name(ctx: Context) -> Result<(), Fault>
/// ```
///
/// Returning `Err` stops the pipeline; the fault is normalized, classified,
/// and written as the response. The trait is **sealed** (via the private
/// `Sealed` supertrait): only the blanket impl below can satisfy it.
pub trait Middleware: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed(self) -> BoxedMiddleware;
}

mod private {
    pub trait Sealed {}
}

// ── Blanket implementations ───────────────────────────────────────────────────

impl<F, Fut> private::Sealed for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Fault>> + Send + 'static,
{
}

impl<F, Fut> Middleware for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Fault>> + Send + 'static,
{
    fn into_boxed(self) -> BoxedMiddleware {
        Arc::new(FnMiddleware(self))
    }
}

// ── Concrete wrapper ──────────────────────────────────────────────────────────

/// Newtype holding a concrete middleware `F`, bridging the typed world to
/// the trait-object world.
struct FnMiddleware<F>(F);

impl<F, Fut> ErasedMiddleware for FnMiddleware<F>
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Fault>> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxFuture {
        Box::pin((self.0)(ctx))
    }
}
