//! Async Derived Cells
//!
//! An async derived cell runs a computation that may return a promise. It
//! exposes three independently trackable states:
//!
//! - `value`: the last settled value. Stale values stay readable while a new
//!   computation is in flight.
//! - `loading`: whether a computation is in flight.
//! - `error`: the last rejection, or `None`.
//!
//! # Suspension
//!
//! Reading `value` before any value has settled returns
//! [`ReactiveError::Suspended`] with a promise that resolves once the cell
//! settles. The caller (a task or a render) awaits it and reads again. The
//! same suspension promise is handed to every reader until the cell settles,
//! so readers that suspended before a re-invalidation still wake up with the
//! latest value.
//!
//! # Generations
//!
//! Every computation start bumps a generation counter. A settle carrying an
//! older generation is discarded, which is how re-invalidating a cell while
//! it is loading cancels the effect of the in-flight result.
//!
//! # Polling
//!
//! A cell with a poll interval re-arms a timer after each settle while it has
//! subscribers. When the timer fires the cell is invalidated and restarts.
//! The timer is aborted when the last subscriber goes away. Timers are only
//! armed inside [`run_local`](super::run_local); anywhere else the cell logs a
//! warning and behaves as if it had no interval.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::computed::{flags, SerializationStrategy};
use super::context::ReactiveContext;
use super::local::try_spawn_local;
use super::runtime::{trigger_effects, ContainerRef};
use super::signal::ReactiveCell;
use super::subscriber::{CellId, Consumer, EffectProperty, Producer};
use super::subscription::{
    clear_all_edges_of, clear_edge, get_or_create_edge, track_read, BackRefLedger, EffectSet,
};
use super::EffectSubscription;
use crate::error::{ReactiveError, ReactiveResult};
use crate::value::{ErrorValue, LazyRef, Promise, PromiseResolver, Settlement, Value};

struct AsyncInner {
    id: CellId,
    qrl: RefCell<LazyRef>,
    value: RefCell<Option<Value>>,
    error: RefCell<Option<Value>>,
    loading: Cell<bool>,
    flags: Cell<u8>,
    generation: Cell<u64>,
    effects: RefCell<EffectSet>,
    loading_effects: RefCell<EffectSet>,
    error_effects: RefCell<EffectSet>,
    ledger: BackRefLedger,
    suspension: RefCell<Option<(Promise, PromiseResolver)>>,
    poll: Cell<Option<Duration>>,
    timer: RefCell<Option<JoinHandle<()>>>,
    container: RefCell<Option<ContainerRef>>,
}

/// Which of the three observable states a settle changed.
#[derive(Default)]
struct Changes {
    value: bool,
    loading: bool,
    error: bool,
}

/// A derived cell backed by an asynchronous computation.
#[derive(Clone)]
pub struct AsyncComputed(Rc<AsyncInner>);

impl AsyncComputed {
    /// Create an async derived cell. The computation starts on first read.
    pub fn new(qrl: LazyRef) -> Self {
        Self(Rc::new(AsyncInner {
            id: CellId::new(),
            qrl: RefCell::new(qrl),
            value: RefCell::new(None),
            error: RefCell::new(None),
            loading: Cell::new(false),
            flags: Cell::new(flags::INVALID),
            generation: Cell::new(0),
            effects: RefCell::new(EffectSet::new()),
            loading_effects: RefCell::new(EffectSet::new()),
            error_effects: RefCell::new(EffectSet::new()),
            ledger: BackRefLedger::new(),
            suspension: RefCell::new(None),
            poll: Cell::new(None),
            timer: RefCell::new(None),
            container: RefCell::new(None),
        }))
    }

    pub fn new_in(container: ContainerRef, qrl: LazyRef) -> Self {
        let cell = Self::new(qrl);
        cell.set_container(Some(container));
        cell
    }

    /// Recompute every `interval` while subscribed.
    pub fn with_poll(self, interval: Duration) -> Self {
        self.0.poll.set(Some(interval));
        self
    }

    pub fn with_strategy(self, strategy: SerializationStrategy) -> Self {
        self.set_flag(flags::SERIALIZE_NEVER, strategy == SerializationStrategy::Never);
        self
    }

    pub(crate) fn shell() -> Self {
        Self::new(LazyRef::unresolved("", None))
    }

    pub fn id(&self) -> CellId {
        self.0.id
    }

    /// Read the value with tracking.
    ///
    /// Starts the computation if the cell is invalid. Returns the last settled
    /// value, stale or not. Suspends when nothing has settled yet and a
    /// computation is in flight.
    pub fn value(&self) -> ReactiveResult<Value> {
        track_read(&self.0.effects, || Producer::AsyncComputed(self.clone()));
        if self.is_invalid() {
            self.start();
        }
        if let Some(value) = self.0.value.borrow().clone() {
            return Ok(value);
        }
        if self.0.loading.get() {
            return Err(ReactiveError::Suspended(self.suspension()));
        }
        Ok(Value::Undefined)
    }

    /// Whether a computation is in flight. Tracked separately from `value`.
    pub fn loading(&self) -> bool {
        track_read(&self.0.loading_effects, || Producer::AsyncComputed(self.clone()));
        self.0.loading.get()
    }

    /// The last rejection. Tracked separately from `value`.
    pub fn error(&self) -> Option<Value> {
        track_read(&self.0.error_effects, || Producer::AsyncComputed(self.clone()));
        self.0.error.borrow().clone()
    }

    /// The settled value without tracking or starting anything.
    pub fn untracked_value(&self) -> Option<Value> {
        self.0.value.borrow().clone()
    }

    pub fn untracked_error(&self) -> Option<Value> {
        self.0.error.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        self.0.loading.get()
    }

    pub fn is_invalid(&self) -> bool {
        self.0.flags.get() & flags::INVALID != 0
    }

    pub fn flags(&self) -> u8 {
        self.0.flags.get()
    }

    pub fn strategy(&self) -> SerializationStrategy {
        if self.0.flags.get() & flags::SERIALIZE_NEVER != 0 {
            SerializationStrategy::Never
        } else {
            SerializationStrategy::Always
        }
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.0.poll.get()
    }

    pub fn qrl(&self) -> LazyRef {
        self.0.qrl.borrow().clone()
    }

    pub fn set(&self, _value: impl Into<Value>) -> ReactiveResult<()> {
        Err(ReactiveError::ReadOnly("async computed signal"))
    }

    /// Mark invalid and restart now if anybody is subscribed.
    pub fn invalidate(&self) {
        self.mark_invalid();
        self.restart_if_observed();
    }

    pub(crate) fn mark_invalid(&self) {
        self.set_flag(flags::INVALID, true);
    }

    pub(crate) fn restart_if_observed(&self) {
        if self.is_invalid() && self.subscriber_count() > 0 {
            self.start();
        }
    }

    fn set_flag(&self, flag: u8, on: bool) {
        let current = self.0.flags.get();
        self.0.flags.set(if on { current | flag } else { current & !flag });
    }

    /// The promise handed to suspended readers.
    fn suspension(&self) -> Promise {
        let mut slot = self.0.suspension.borrow_mut();
        let (promise, _) = slot.get_or_insert_with(Promise::pending);
        promise.clone()
    }

    fn start(&self) {
        let generation = self.0.generation.get() + 1;
        self.0.generation.set(generation);
        self.set_flag(flags::INVALID, false);
        trace!(id = self.0.id.raw(), generation, "async computation started");

        if !self.0.loading.replace(true) {
            trigger_effects(self.container().as_ref(), self.loading_effects());
        }

        let consumer = Consumer::AsyncComputed(self.clone());
        let edge = get_or_create_edge(&consumer, EffectProperty::Value);
        clear_edge(&edge);
        let qrl = self.qrl();
        let result = {
            let _ctx = ReactiveContext::enter(edge);
            qrl.call()
        };

        match result {
            Ok(Value::Promise(promise)) => {
                let weak = Rc::downgrade(&self.0);
                promise.then(move |outcome| {
                    if let Some(inner) = weak.upgrade() {
                        AsyncComputed(inner).settle(generation, outcome);
                    }
                });
            }
            Ok(value) => self.settle(generation, Some(Ok(value))),
            Err(ReactiveError::Suspended(promise)) => {
                // An input suspended. Try again once it settles.
                let weak = Rc::downgrade(&self.0);
                promise.then(move |_| {
                    if let Some(inner) = weak.upgrade() {
                        let cell = AsyncComputed(inner);
                        if cell.0.generation.get() == generation {
                            cell.start();
                        }
                    }
                });
            }
            Err(err) => self.settle(generation, Some(Err(err.into_value()))),
        }
    }

    fn settle(&self, generation: u64, outcome: Option<Settlement>) {
        if generation != self.0.generation.get() {
            debug!(
                id = self.0.id.raw(),
                generation,
                current = self.0.generation.get(),
                "discarding stale async result"
            );
            return;
        }

        let mut changes = Changes {
            loading: self.0.loading.replace(false),
            ..Changes::default()
        };
        match outcome {
            Some(Ok(value)) => {
                changes.value = self
                    .0
                    .value
                    .borrow()
                    .as_ref()
                    .map_or(true, |old| !old.is_identical(&value));
                *self.0.value.borrow_mut() = Some(value);
                changes.error = self.0.error.borrow_mut().take().is_some();
            }
            Some(Err(error)) => {
                *self.0.error.borrow_mut() = Some(error);
                changes.error = true;
            }
            None => {
                let error = ErrorValue::new("async computation was abandoned before it settled");
                *self.0.error.borrow_mut() = Some(Value::Error(error));
                changes.error = true;
            }
        }
        self.set_flag(flags::RUN_EFFECTS, changes.value);
        debug!(id = self.0.id.raw(), generation, changed = changes.value, "async computation settled");

        let suspension = self.0.suspension.borrow_mut().take();
        if let Some((_, resolver)) = suspension {
            let settled = self.0.value.borrow().clone().unwrap_or_default();
            resolver.resolve(settled);
        }

        let mut effects = Vec::new();
        if changes.value {
            effects.extend(self.value_effects());
        }
        if changes.loading {
            effects.extend(self.loading_effects());
        }
        if changes.error {
            effects.extend(self.error_effects());
        }
        trigger_effects(self.container().as_ref(), effects);

        self.arm_poll();
    }

    fn arm_poll(&self) {
        let Some(interval) = self.0.poll.get() else {
            return;
        };
        self.cancel_poll();
        if self.subscriber_count() == 0 {
            return;
        }
        let weak: Weak<AsyncInner> = Rc::downgrade(&self.0);
        let handle = try_spawn_local(async move {
            tokio::time::sleep(interval).await;
            if let Some(inner) = weak.upgrade() {
                let cell = AsyncComputed(inner);
                cell.0.timer.borrow_mut().take();
                trace!(id = cell.0.id.raw(), "poll timer fired");
                cell.invalidate();
            }
        });
        if handle.is_none() {
            warn!(id = self.0.id.raw(), "polling requires a local task scope; timer not armed");
        }
        *self.0.timer.borrow_mut() = handle;
    }

    fn cancel_poll(&self) {
        if let Some(handle) = self.0.timer.borrow_mut().take() {
            handle.abort();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.0.timer.borrow().is_some()
    }

    pub fn container(&self) -> Option<ContainerRef> {
        self.0.container.borrow().clone()
    }

    pub fn set_container(&self, container: Option<ContainerRef>) {
        *self.0.container.borrow_mut() = container;
    }

    pub fn ledger(&self) -> &BackRefLedger {
        &self.0.ledger
    }

    pub fn value_effects(&self) -> Vec<EffectSubscription> {
        self.0.effects.borrow().iter().cloned().collect()
    }

    pub fn loading_effects(&self) -> Vec<EffectSubscription> {
        self.0.loading_effects.borrow().iter().cloned().collect()
    }

    pub fn error_effects(&self) -> Vec<EffectSubscription> {
        self.0.error_effects.borrow().iter().cloned().collect()
    }

    /// Every subscribed edge across the three states, without duplicates.
    pub fn all_effects(&self) -> Vec<EffectSubscription> {
        let mut all = EffectSet::new();
        all.extend(self.value_effects());
        all.extend(self.loading_effects());
        all.extend(self.error_effects());
        all.into_iter().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.all_effects().len()
    }

    pub(crate) fn effect_sets(&self) -> [&RefCell<EffectSet>; 3] {
        [&self.0.effects, &self.0.loading_effects, &self.0.error_effects]
    }

    pub(crate) fn has_effect(&self, edge: &EffectSubscription) -> bool {
        self.effect_sets().iter().any(|set| set.borrow().contains(edge))
    }

    pub(crate) fn remove_effect(&self, edge: &EffectSubscription) {
        for set in self.effect_sets() {
            set.borrow_mut().shift_remove(edge);
        }
    }

    pub(crate) fn release(&self) {
        self.cancel_poll();
        clear_all_edges_of(&Consumer::AsyncComputed(self.clone()));
        self.mark_invalid();
    }

    pub(crate) fn set_qrl(&self, qrl: LazyRef) {
        *self.0.qrl.borrow_mut() = qrl;
    }

    /// Restore state on resume.
    pub(crate) fn fill_state(
        &self,
        flag_bits: u8,
        poll: Option<Duration>,
        error: Option<Value>,
        value: Option<Value>,
    ) {
        self.0.flags.set(flag_bits);
        self.0.poll.set(poll);
        *self.0.error.borrow_mut() = error;
        if value.is_none() {
            self.mark_invalid();
        }
        *self.0.value.borrow_mut() = value;
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl ReactiveCell for AsyncComputed {
    fn get(&self) -> ReactiveResult<Value> {
        self.value()
    }

    fn peek(&self) -> Value {
        self.untracked_value().unwrap_or_default()
    }

    fn put(&self, _value: Value) -> ReactiveResult<()> {
        Err(ReactiveError::ReadOnly("async computed signal"))
    }
}

impl fmt::Debug for AsyncComputed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncComputed")
            .field("id", &self.0.id.raw())
            .field("flags", &self.0.flags.get())
            .field("loading", &self.0.loading.get())
            .field("generation", &self.0.generation.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{run_local, Signal, Task};

    fn from_pending(slot: Rc<RefCell<Vec<PromiseResolver>>>) -> AsyncComputed {
        AsyncComputed::new(LazyRef::new("load", move |_| {
            let (promise, resolver) = Promise::pending();
            slot.borrow_mut().push(resolver);
            Ok(Value::from(promise))
        }))
    }

    #[test]
    fn first_read_suspends_then_resolves() {
        let resolvers = Rc::new(RefCell::new(Vec::new()));
        let cell = from_pending(resolvers.clone());

        let suspended = match cell.value() {
            Err(ReactiveError::Suspended(promise)) => promise,
            other => panic!("expected suspension, got {other:?}"),
        };
        assert!(cell.is_loading());

        resolvers.borrow_mut().remove(0).resolve(42);
        assert!(matches!(suspended.settlement(), Some(Ok(Value::Number(n))) if n == 42.0));
        assert_eq!(cell.value().unwrap().as_number(), Some(42.0));
        assert!(!cell.is_loading());
    }

    #[test]
    fn stale_value_is_served_while_reloading() {
        let resolvers = Rc::new(RefCell::new(Vec::new()));
        let cell = from_pending(resolvers.clone());
        let _ = cell.value();
        resolvers.borrow_mut().remove(0).resolve("old");

        cell.mark_invalid();
        assert_eq!(cell.value().unwrap().as_str(), Some("old"));
        assert!(cell.is_loading());
    }

    #[test]
    fn reinvalidation_discards_in_flight_result() {
        let resolvers = Rc::new(RefCell::new(Vec::new()));
        let cell = from_pending(resolvers.clone());
        let waiter = match cell.value() {
            Err(ReactiveError::Suspended(promise)) => promise,
            other => panic!("expected suspension, got {other:?}"),
        };

        cell.mark_invalid();
        assert!(cell.value().is_err());
        assert_eq!(resolvers.borrow().len(), 2);

        let second = resolvers.borrow_mut().pop().unwrap();
        let first = resolvers.borrow_mut().pop().unwrap();
        first.resolve("stale");
        assert!(cell.untracked_value().is_none());

        second.resolve("fresh");
        assert_eq!(cell.value().unwrap().as_str(), Some("fresh"));
        assert!(matches!(waiter.settlement(), Some(Ok(Value::String(s))) if &*s == "fresh"));
    }

    #[test]
    fn rejection_lands_on_error_state() {
        let cell = AsyncComputed::new(LazyRef::new("fail", |_| Ok(Value::from(Promise::rejected("nope")))));
        assert!(cell.value().unwrap().is_undefined());
        assert_eq!(cell.error().unwrap().as_str(), Some("nope"));
        assert!(!cell.is_loading());
    }

    #[test]
    fn thrown_error_lands_on_error_state() {
        let cell = AsyncComputed::new(LazyRef::new("throw", |_| crate::value::throw("bad")));
        assert!(cell.value().is_ok());
        assert_eq!(cell.untracked_error().unwrap().as_str(), Some("bad"));
    }

    #[test]
    fn input_change_restarts_observed_cell() {
        let source = Signal::new(1);
        let s = source.clone();
        let cell = AsyncComputed::new(LazyRef::new("plus", move |_| {
            let n = s.value().as_number().unwrap_or(0.0);
            Ok(Value::from(Promise::resolved(n + 100.0)))
        }));
        let reader = cell.clone();
        let task = Task::new(LazyRef::new("watch", move |_| reader.value()));
        task.run().unwrap();
        assert_eq!(cell.untracked_value().unwrap().as_number(), Some(101.0));

        source.set(2);
        assert_eq!(cell.untracked_value().unwrap().as_number(), Some(102.0));
        assert!(task.is_dirty());
    }

    #[test]
    fn loading_is_tracked_separately() {
        let resolvers = Rc::new(RefCell::new(Vec::new()));
        let cell = from_pending(resolvers.clone());
        let reader = cell.clone();
        let task = Task::new(LazyRef::new("spinner", move |_| Ok(Value::from(reader.loading()))));
        task.run().unwrap();
        assert_eq!(cell.loading_effects().len(), 1);
        assert!(cell.value_effects().is_empty());

        let _ = cell.value();
        assert!(task.is_dirty());
    }

    #[tokio::test]
    async fn polling_recomputes_until_unsubscribed() {
        run_local(async {
            let runs = Rc::new(Cell::new(0u32));
            let runs_clone = runs.clone();
            let cell = AsyncComputed::new(LazyRef::new("tick", move |_| {
                runs_clone.set(runs_clone.get() + 1);
                Ok(Value::from(runs_clone.get() as f64))
            }))
            .with_poll(Duration::from_millis(5));

            let reader = cell.clone();
            let task = Task::new(LazyRef::new("watch", move |_| reader.value()));
            task.run().unwrap();
            assert!(cell.is_polling());

            tokio::time::sleep(Duration::from_millis(40)).await;
            assert!(runs.get() > 1);

            task.dispose();
            assert!(!cell.is_polling());
            let after = runs.get();
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(runs.get(), after);
        })
        .await;
    }

    #[tokio::test]
    async fn polling_without_a_local_scope_is_skipped() {
        let runs = Rc::new(Cell::new(0u32));
        let runs_clone = runs.clone();
        let cell = AsyncComputed::new(LazyRef::new("tick", move |_| {
            runs_clone.set(runs_clone.get() + 1);
            Ok(Value::from(runs_clone.get() as f64))
        }))
        .with_poll(Duration::from_millis(5));

        let reader = cell.clone();
        let task = Task::new(LazyRef::new("watch", move |_| reader.value()));
        task.run().unwrap();
        assert!(!cell.is_polling());
        assert_eq!(cell.untracked_value().unwrap().as_number(), Some(1.0));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.get(), 1);
    }
}
