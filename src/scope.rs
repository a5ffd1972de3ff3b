//! Cancellation scopes.
//!
//! A [`Scope`] is a node in a parent-linked tree carrying a one-shot done
//! signal, an optional deadline, and — once fired — the [`Reason`] it fired.
//! Firing is irreversible: the node holds a tiny state machine with exactly
//! one transition out of Active, and "first signal wins" is decided by a
//! single `tokio::select!` per derived child.
//!
//! Parent cancellation is transitive: firing a parent fires every descendant
//! (reason [`Reason::CanceledByParent`]) no later than the parent itself is
//! observable as fired. Firing a child never touches the parent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;

/// Why a scope's done signal fired. Stable once recorded — observers reading
/// [`Scope::reason`] after [`Scope::done`] resolves always see the same value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reason {
    /// The parent scope fired first.
    CanceledByParent,
    /// The scope's own deadline elapsed.
    DeadlineElapsed,
    /// [`CancelHandle::cancel`] was invoked before either of the above.
    ExplicitlyCanceled,
}

/// One node in the cancellation tree.
///
/// Cloning a `Scope` is cheap and refers to the same node — every clone
/// observes the same done signal and reason.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

struct Inner {
    // `None` is the Active state; `Some(reason)` is terminal. The watch
    // channel gives us the one-shot broadcast and the wait primitive in one.
    state: watch::Sender<Option<Reason>>,
}

impl Scope {
    /// A fresh root scope in the Active state, with the handle that fires it.
    ///
    /// The server fires the root when the transport drops the connection;
    /// tests fire it to simulate exactly that.
    pub fn new() -> (Self, CancelHandle) {
        let (state, _) = watch::channel(None);
        let scope = Self { inner: Arc::new(Inner { state }) };
        let handle = CancelHandle { scope: scope.clone() };
        (scope, handle)
    }

    /// Derives a child with no deadline of its own: it fires only when
    /// `self` fires or its handle cancels it.
    pub fn derive(&self) -> (Scope, CancelHandle) {
        self.spawn_child(None)
    }

    /// Derives a child whose done signal fires when `deadline` elapses or
    /// when `self` fires, whichever comes first.
    ///
    /// The returned [`CancelHandle`] force-fires the child with
    /// [`Reason::ExplicitlyCanceled`]; calling it after the child already
    /// fired is a no-op.
    pub fn child(&self, deadline: Duration) -> (Scope, CancelHandle) {
        self.spawn_child(Some(deadline))
    }

    fn spawn_child(&self, deadline: Option<Duration>) -> (Scope, CancelHandle) {
        let (child, handle) = Scope::new();

        let parent = self.clone();
        let node = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                // On a tie the parent wins, keeping "child fires no later
                // than parent" exact even when both are ready at once.
                biased;

                () = parent.done() => {
                    node.fire(Reason::CanceledByParent);
                }
                // Already fired (explicit cancel) — nothing left to drive.
                () = node.done() => {}
                () = expire(deadline) => {
                    node.fire(Reason::DeadlineElapsed);
                }
            }
        });

        (child, handle)
    }

    /// Resolves when the done signal fires. Resolves immediately if it
    /// already has. Observation only — waiting never mutates the scope.
    pub async fn done(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives inside `self`, so it cannot drop while we hold
        // `&self` and `wait_for` cannot fail.
        let _ = rx.wait_for(Option::is_some).await;
    }

    /// The recorded reason, or `None` while the scope is still Active.
    pub fn reason(&self) -> Option<Reason> {
        *self.inner.state.borrow()
    }

    /// The single transition out of Active. Returns `false` if the scope
    /// already fired — the first reason sticks.
    pub(crate) fn fire(&self, reason: Reason) -> bool {
        self.inner.state.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason);
                true
            } else {
                false
            }
        })
    }
}

async fn expire(deadline: Option<Duration>) {
    match deadline {
        Some(deadline) => time::sleep(deadline).await,
        None => std::future::pending().await,
    }
}

/// Force-fires its scope with [`Reason::ExplicitlyCanceled`].
///
/// Held separately from [`Scope`] so that observers handed a scope can wait
/// on it but not cancel it.
pub struct CancelHandle {
    scope: Scope,
}

impl CancelHandle {
    /// Idempotent: a no-op once the scope has fired for any reason.
    pub fn cancel(&self) {
        self.scope.fire(Reason::ExplicitlyCanceled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_with_elapsed_reason() {
        let (root, _root_cancel) = Scope::new();
        let (child, _cancel) = root.child(Duration::from_secs(1));

        let started = time::Instant::now();
        child.done().await;
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(child.reason(), Some(Reason::DeadlineElapsed));
        assert_eq!(root.reason(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_fire_propagates_to_descendants() {
        let (root, root_cancel) = Scope::new();
        let (child, _c1) = root.child(Duration::from_secs(60));
        let (grandchild, _c2) = child.child(Duration::from_secs(60));

        root_cancel.cancel();
        child.done().await;
        grandchild.done().await;

        assert_eq!(root.reason(), Some(Reason::ExplicitlyCanceled));
        assert_eq!(child.reason(), Some(Reason::CanceledByParent));
        assert_eq!(grandchild.reason(), Some(Reason::CanceledByParent));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_cancel_beats_deadline() {
        let (root, _root_cancel) = Scope::new();
        let (child, cancel) = root.child(Duration::from_secs(5));

        cancel.cancel();
        child.done().await;
        assert_eq!(child.reason(), Some(Reason::ExplicitlyCanceled));

        // firing is irreversible, the deadline cannot rewrite the reason
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(child.reason(), Some(Reason::ExplicitlyCanceled));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_fire_is_a_noop() {
        let (root, _root_cancel) = Scope::new();
        let (child, cancel) = root.child(Duration::from_millis(10));

        child.done().await;
        assert_eq!(child.reason(), Some(Reason::DeadlineElapsed));
        cancel.cancel();
        assert_eq!(child.reason(), Some(Reason::DeadlineElapsed));
    }

    #[tokio::test(start_paused = true)]
    async fn child_never_outlives_parent_cancellation() {
        let (root, root_cancel) = Scope::new();
        let (child, _cancel) = root.child(Duration::from_secs(60));

        root_cancel.cancel();
        // Waiting on the child alone must be enough — no deadline involved.
        time::timeout(Duration::from_secs(1), child.done())
            .await
            .expect("child did not fire after parent cancellation");
    }
}
