//! Per-request state.
//!
//! One [`Context`] exists per inbound request and is shared — via cheap
//! clones — between the pipeline task, the cancellation watcher, and any
//! background tasks a middleware spawns. Three pieces of state matter:
//!
//! - the request's [cancellation scope](crate::scope::Scope), parented to
//!   the transport's cancellation signal;
//! - the `ended` flag, a monotonic false→true latch the executor polls
//!   between middleware to decide "stop running";
//! - the response state, guarded by one mutex so that racing writers (say,
//!   a timeout hook and a still-running downstream middleware) are fully
//!   serialized, with a write-once flag that turns every post-finalize
//!   write into a soft [`AlreadySent`] instead of a double send.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::warn;

use crate::request::Request;
use crate::scope::{CancelHandle, Scope};
use crate::transport::{AlreadySent, Transport};

/// Deferred action run after the pipeline succeeds, before finalization.
pub(crate) type AfterHook = Box<dyn FnOnce(&Context) + Send>;

/// Per-request state. Clones refer to the same request.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    req: Request,
    scope: Scope,
    cancel: CancelHandle,
    ended: AtomicBool,
    res: Mutex<ResponseState>,
    after: Mutex<Vec<AfterHook>>,
}

struct ResponseState {
    transport: Box<dyn Transport>,
    status: u16,
    sent: bool,
}

impl Context {
    /// `parent` is the transport-level cancellation signal: the request's
    /// own scope is derived under it so that a connection drop propagates
    /// to the request and to every sub-scope middleware derive from it.
    pub fn new(req: Request, parent: &Scope, transport: Box<dyn Transport>) -> Self {
        // No deadline of its own: the request scope fires on parent
        // cancellation or an explicit cancel only.
        let (scope, cancel) = parent.derive();
        Self {
            inner: Arc::new(Inner {
                req,
                scope,
                cancel,
                ended: AtomicBool::new(false),
                res: Mutex::new(ResponseState { transport, status: 200, sent: false }),
                after: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn request(&self) -> &Request {
        &self.inner.req
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    /// Derives a child scope with deadline `now + duration`, parented to this
    /// request's scope. The returned [`CancelHandle`] force-fires the child
    /// with a "canceled" reason; calling it after the child fired is a no-op.
    pub fn derive_timeout(&self, duration: Duration) -> (Scope, CancelHandle) {
        self.inner.scope.child(duration)
    }

    /// Resolves when the request's scope fires — transport disconnect,
    /// explicit [`cancel`](Context::cancel), or parent cancellation.
    /// Observation only.
    pub async fn done(&self) {
        self.inner.scope.done().await;
    }

    /// Force-fires the request's own scope. Lets a middleware or a timeout
    /// hook end the request early; the executor's watcher turns the fired
    /// signal into [`mark_ended`](Context::mark_ended).
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    // ── Ended flag ────────────────────────────────────────────────────────────

    /// Latches the ended flag. Idempotent; the flag never resets. Once set,
    /// the executor runs no further middleware for this request, whatever
    /// triggered the call.
    pub fn mark_ended(&self) {
        self.inner.ended.store(true, Ordering::Release);
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    // ── Response writes ───────────────────────────────────────────────────────

    /// Last status set, 200 until told otherwise. Readable by `OnError`
    /// implementations that want it as a normalization fallback.
    pub fn status(&self) -> u16 {
        self.res().status
    }

    pub fn set_status(&self, code: u16) -> Result<(), AlreadySent> {
        let mut res = self.writable()?;
        res.status = code;
        res.transport.set_status(code);
        Ok(())
    }

    pub fn set_header(&self, name: &str, value: &str) -> Result<(), AlreadySent> {
        self.writable()?.transport.set_header(name, value);
        Ok(())
    }

    pub fn write(&self, chunk: &[u8]) -> Result<(), AlreadySent> {
        self.writable()?.transport.write_body(chunk);
        Ok(())
    }

    /// Sets status and a `text/plain` body in one step.
    pub fn text(&self, code: u16, body: impl AsRef<str>) -> Result<(), AlreadySent> {
        let mut res = self.writable()?;
        res.status = code;
        res.transport.set_status(code);
        res.transport.set_header("content-type", "text/plain; charset=utf-8");
        res.transport.write_body(body.as_ref().as_bytes());
        Ok(())
    }

    /// Sets status and an `application/json` body in one step. Pass bytes
    /// from your serializer directly, e.g. `serde_json::to_vec(&val)`.
    pub fn json(&self, code: u16, body: &[u8]) -> Result<(), AlreadySent> {
        let mut res = self.writable()?;
        res.status = code;
        res.transport.set_status(code);
        res.transport.set_header("content-type", "application/json");
        res.transport.write_body(body);
        Ok(())
    }

    // ── After hooks ───────────────────────────────────────────────────────────

    /// Defers `hook` until the pipeline completes without error. Hooks run
    /// in registration order, before finalization; an error discards them.
    pub fn after(&self, hook: impl FnOnce(&Context) + Send + 'static) {
        self.lock_after().push(Box::new(hook));
    }

    pub(crate) fn clear_after(&self) {
        self.lock_after().clear();
    }

    pub(crate) fn run_after(&self) {
        let hooks = std::mem::take(&mut *self.lock_after());
        for hook in hooks {
            hook(self);
        }
    }

    // ── Finalization ──────────────────────────────────────────────────────────

    /// Flips the sent flag and finalizes the transport. The flag flips
    /// before the transport call, so even a failing finalize is never
    /// attempted twice; later calls return `Ok` without touching the
    /// transport, which keeps the boundary's "ensure responded" pass safe.
    pub(crate) fn respond(&self) -> std::io::Result<()> {
        let mut res = self.res();
        if res.sent {
            return Ok(());
        }
        res.sent = true;
        res.transport.finalize()
    }

    // ── Lock plumbing ─────────────────────────────────────────────────────────

    fn res(&self) -> MutexGuard<'_, ResponseState> {
        // A panicking transport poisons the lock; panic containment already
        // owns that request, so recover the guard and keep serving.
        self.inner.res.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_after(&self) -> MutexGuard<'_, Vec<AfterHook>> {
        self.inner.after.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The response guard: every write goes through here, under the one
    /// response mutex, and fails softly once the response has been sent.
    fn writable(&self) -> Result<MutexGuard<'_, ResponseState>, AlreadySent> {
        let res = self.res();
        if res.sent {
            warn!(path = %self.inner.req.path(), "response already finalized, write dropped");
            return Err(AlreadySent);
        }
        Ok(res)
    }
}
