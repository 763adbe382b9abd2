//! Local Task Scope
//!
//! Timers owned by reactive cells hold `Rc` handles, so they can only run as
//! local tasks. Tokio panics when a local task is spawned outside a
//! `LocalSet` and offers no way to ask whether one is running, so the crate
//! tracks it itself: [`run_local`] marks the thread while its `LocalSet` is
//! being polled, and cells only spawn timers while the mark is set.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::{JoinHandle, LocalSet};

thread_local! {
    static LOCAL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks the thread as inside a local scope until dropped.
struct Entered;

impl Entered {
    fn new() -> Self {
        LOCAL_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for Entered {
    fn drop(&mut self) {
        LOCAL_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

struct Scoped<F>(Pin<Box<F>>);

impl<F: Future> Future for Scoped<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let _entered = Entered::new();
        self.0.as_mut().poll(cx)
    }
}

/// Drive `future` on a fresh `LocalSet`. Polling cells created or read
/// inside it can arm their timers.
pub async fn run_local<F: Future>(future: F) -> F::Output {
    let local = LocalSet::new();
    Scoped(Box::pin(local.run_until(future))).await
}

/// Whether the current thread is inside [`run_local`].
pub fn in_local_scope() -> bool {
    LOCAL_DEPTH.with(|depth| depth.get() > 0)
}

/// Spawn a local task if a local scope is active.
pub(crate) fn try_spawn_local<F>(future: F) -> Option<JoinHandle<F::Output>>
where
    F: Future + 'static,
    F::Output: 'static,
{
    in_local_scope().then(|| tokio::task::spawn_local(future))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scope_is_only_set_while_running() {
        assert!(!in_local_scope());
        let inside = run_local(async { in_local_scope() }).await;
        assert!(inside);
        assert!(!in_local_scope());
    }

    #[tokio::test]
    async fn spawning_outside_a_scope_is_refused() {
        assert!(try_spawn_local(async {}).is_none());
        let spawned = run_local(async { try_spawn_local(async { 7 }) }).await;
        assert!(spawned.is_some());
    }
}
