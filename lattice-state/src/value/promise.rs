//! Promises
//!
//! A promise is a handle to an operation that settles once, either resolved
//! with a value or rejected with an error value. Continuations registered with
//! [`Promise::then`] run synchronously at settle time, which is how async
//! derived cells learn about results without an executor of their own.
//! Futures can wait for settlement with [`Promise::settled`].
//!
//! A resolver dropped without settling marks its promise abandoned. The
//! serializer refuses to emit abandoned promises.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use tokio::sync::Notify;

use super::Value;

/// Outcome of a settled promise: `Ok` for resolved, `Err` for rejected.
pub type Settlement = Result<Value, Value>;

/// Observable state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseStatus {
    Pending,
    Resolved,
    Rejected,
    /// The resolver was dropped before settling.
    Abandoned,
}

enum State {
    Pending,
    Settled(Settlement),
    Abandoned,
}

type Continuation = Box<dyn FnOnce(Option<Settlement>)>;

struct PromiseInner {
    state: RefCell<State>,
    continuations: RefCell<Vec<Continuation>>,
    notify: Notify,
}

/// A shared handle to a single-assignment result.
#[derive(Clone)]
pub struct Promise(Rc<PromiseInner>);

impl Promise {
    fn with_state(state: State) -> Self {
        Self(Rc::new(PromiseInner {
            state: RefCell::new(state),
            continuations: RefCell::new(Vec::new()),
            notify: Notify::new(),
        }))
    }

    /// Create a pending promise and the resolver that settles it.
    pub fn pending() -> (Promise, PromiseResolver) {
        let promise = Self::with_state(State::Pending);
        let resolver = PromiseResolver {
            promise: Some(promise.clone()),
        };
        (promise, resolver)
    }

    pub fn resolved(value: impl Into<Value>) -> Self {
        Self::with_state(State::Settled(Ok(value.into())))
    }

    pub fn rejected(error: impl Into<Value>) -> Self {
        Self::with_state(State::Settled(Err(error.into())))
    }

    /// Run a future on the current `LocalSet` and settle with its output.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a `tokio::task::LocalSet`.
    pub fn spawn<F>(future: F) -> Promise
    where
        F: Future<Output = Settlement> + 'static,
    {
        let (promise, resolver) = Self::pending();
        tokio::task::spawn_local(async move {
            let outcome = future.await;
            resolver.settle(outcome);
        });
        promise
    }

    /// A pending promise with no resolver, filled in later by the decoder.
    pub(crate) fn shell() -> Self {
        Self::with_state(State::Pending)
    }

    pub fn status(&self) -> PromiseStatus {
        match &*self.0.state.borrow() {
            State::Pending => PromiseStatus::Pending,
            State::Settled(Ok(_)) => PromiseStatus::Resolved,
            State::Settled(Err(_)) => PromiseStatus::Rejected,
            State::Abandoned => PromiseStatus::Abandoned,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == PromiseStatus::Pending
    }

    /// The settlement, if the promise has settled.
    pub fn settlement(&self) -> Option<Settlement> {
        match &*self.0.state.borrow() {
            State::Settled(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    /// Register a continuation. It receives `None` if the promise is
    /// abandoned. Runs immediately when the promise is already settled.
    pub fn then<F>(&self, continuation: F)
    where
        F: FnOnce(Option<Settlement>) + 'static,
    {
        let outcome = match &*self.0.state.borrow() {
            State::Pending => None,
            State::Settled(outcome) => Some(Some(outcome.clone())),
            State::Abandoned => Some(None),
        };
        match outcome {
            Some(outcome) => continuation(outcome),
            None => self.0.continuations.borrow_mut().push(Box::new(continuation)),
        }
    }

    /// Wait until the promise settles. Yields `None` if it was abandoned.
    pub async fn settled(&self) -> Option<Settlement> {
        loop {
            // Created before the state check so a settle in between is not missed.
            let notified = self.0.notify.notified();
            match &*self.0.state.borrow() {
                State::Pending => {}
                State::Settled(outcome) => return Some(outcome.clone()),
                State::Abandoned => return None,
            }
            notified.await;
        }
    }

    pub(crate) fn settle(&self, outcome: Settlement) {
        self.finish(State::Settled(outcome));
    }

    fn finish(&self, state: State) {
        {
            let mut current = self.0.state.borrow_mut();
            if !matches!(*current, State::Pending) {
                return;
            }
            *current = state;
        }
        let outcome = self.settlement();
        let continuations = std::mem::take(&mut *self.0.continuations.borrow_mut());
        for continuation in continuations {
            continuation(outcome.clone());
        }
        self.0.notify.notify_waiters();
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Promise").field(&self.status()).finish()
    }
}

/// The settling side of a pending promise.
pub struct PromiseResolver {
    promise: Option<Promise>,
}

impl PromiseResolver {
    pub fn resolve(self, value: impl Into<Value>) {
        self.settle(Ok(value.into()));
    }

    pub fn reject(self, error: impl Into<Value>) {
        self.settle(Err(error.into()));
    }

    pub fn settle(mut self, outcome: Settlement) {
        if let Some(promise) = self.promise.take() {
            promise.settle(outcome);
        }
    }
}

impl Drop for PromiseResolver {
    fn drop(&mut self) {
        if let Some(promise) = self.promise.take() {
            promise.finish(State::Abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn continuation_runs_on_resolve() {
        let (promise, resolver) = Promise::pending();
        let seen = Rc::new(Cell::new(0.0));
        let seen_clone = seen.clone();
        promise.then(move |outcome| {
            if let Some(Ok(Value::Number(n))) = outcome {
                seen_clone.set(n);
            }
        });
        assert_eq!(seen.get(), 0.0);
        resolver.resolve(4);
        assert_eq!(seen.get(), 4.0);
        assert_eq!(promise.status(), PromiseStatus::Resolved);
    }

    #[test]
    fn continuation_on_settled_promise_runs_immediately() {
        let promise = Promise::rejected("nope");
        let ran = Rc::new(Cell::new(false));
        let ran_clone = ran.clone();
        promise.then(move |outcome| ran_clone.set(matches!(outcome, Some(Err(_)))));
        assert!(ran.get());
    }

    #[test]
    fn dropped_resolver_abandons() {
        let (promise, resolver) = Promise::pending();
        drop(resolver);
        assert_eq!(promise.status(), PromiseStatus::Abandoned);
        assert!(promise.settlement().is_none());
    }

    #[test]
    fn settles_only_once() {
        let (promise, resolver) = Promise::pending();
        resolver.resolve(1);
        promise.settle(Ok(Value::from(2)));
        assert!(matches!(promise.settlement(), Some(Ok(Value::Number(n))) if n == 1.0));
    }

    #[tokio::test]
    async fn settled_waits_for_resolution() {
        let (promise, resolver) = Promise::pending();
        let waiter = promise.clone();
        let local = tokio::task::LocalSet::new();
        let outcome = local
            .run_until(async move {
                tokio::task::spawn_local(async move {
                    tokio::task::yield_now().await;
                    resolver.resolve("done");
                });
                waiter.settled().await
            })
            .await;
        assert!(matches!(outcome, Some(Ok(Value::String(s))) if &*s == "done"));
    }
}
