//! Deadline middleware.

use std::sync::Arc;
use std::time::Duration;

use crate::context::Context;
use crate::middleware::Middleware;
use crate::scope::Reason;

/// Builds a middleware that imposes `duration` on all downstream work.
///
/// On invocation it derives a child cancellation scope with the given
/// deadline, spawns a watcher, and returns immediately — downstream
/// middleware keep running against the now deadline-bearing [`Context`].
/// The watcher waits for whichever fires first:
///
/// - the request's own done signal — the request ended for another reason,
///   the watcher exits without action;
/// - the child scope, with reason "deadline elapsed" — the watcher invokes
///   `hook` to produce the timeout response, then cancels the child
///   (a no-op, it already fired). A deadline that lost the race to an
///   explicit cancel does not trigger the hook.
///
/// The hook runs concurrently with whatever downstream middleware is still
/// executing; the context's response lock orders their writes and the hook
/// typically calls [`Context::cancel`] to stop the pipeline at the next
/// step boundary.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use pinion::{App, Context, Fault, middleware};
///
/// async fn slow_work(ctx: Context) -> Result<(), Fault> {
///     // some process that maybe times out…
///     ctx.done().await; // cooperative: yields once the request ends
///     Ok(())
/// }
///
/// let app = App::new()
///     .with(middleware::timeout(Duration::from_secs(1), |ctx| {
///         let _ = ctx.text(504, "service timeout");
///         ctx.cancel();
///     }))
///     .with(slow_work);
/// ```
pub fn timeout<H>(duration: Duration, hook: H) -> impl Middleware
where
    H: Fn(Context) + Send + Sync + 'static,
{
    let hook = Arc::new(hook);
    move |ctx: Context| {
        let (child, cancel) = ctx.derive_timeout(duration);
        let hook = Arc::clone(&hook);
        tokio::spawn(async move {
            tokio::select! {
                // Request-first on ties: a request that already ended never
                // gets a late timeout response.
                biased;

                () = ctx.done() => {}
                () = child.done() => {
                    if child.reason() == Some(Reason::DeadlineElapsed) {
                        hook(ctx);
                        cancel.cancel();
                    }
                }
            }
        });
        async { Ok::<(), crate::error::Fault>(()) }
    }
}
