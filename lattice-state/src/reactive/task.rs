//! Task Implementation
//!
//! A Task is a side-effecting computation that re-runs whenever the cells it
//! read change.
//!
//! # How Tasks Work
//!
//! 1. A task is created with a lazy reference and does not run until
//!    [`Task::run`] is called (by application code or by a container
//!    flushing its chore queue).
//!
//! 2. Before every run, registered cleanups are invoked and every edge the
//!    task owns is cleared, since the previous run's dependencies may no
//!    longer apply.
//!
//! 3. The body runs inside a tracking context bound to the task's edge.
//!
//! 4. When any dependency changes, the task is marked dirty and the
//!    container is asked to schedule it.
//!
//! # Suspension
//!
//! A body that reads an async derived cell with no value yet gets a
//! suspension error. The task catches it, and once the pending promise
//! settles the task marks itself dirty and asks its container to run it
//! again.
//!
//! # Cleanup
//!
//! Cleanup callbacks run before the next run and on [`Task::dispose`]. After
//! disposal the task never runs again.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use super::context::ReactiveContext;
use super::runtime::{ChoreKind, ContainerRef};
use super::subscriber::{CellId, Consumer, EffectProperty};
use super::subscription::{clear_all_edges_of, detach_all, get_or_create_edge, BackRefLedger};
use crate::container::HostNode;
use crate::error::{ReactiveError, ReactiveResult};
use crate::value::{LazyRef, Value};

/// Task flag bits, written to the wire as is.
pub mod task_flags {
    /// A dependency changed since the last run.
    pub const DIRTY: u8 = 1;
    /// The task was disposed and never runs again.
    pub const DISPOSED: u8 = 1 << 1;
}

type Cleanup = Box<dyn FnOnce()>;

struct TaskInner {
    id: CellId,
    qrl: RefCell<LazyRef>,
    flags: Cell<u8>,
    host: RefCell<Option<HostNode>>,
    cleanups: RefCell<Vec<Cleanup>>,
    run_count: Cell<usize>,
    ledger: BackRefLedger,
    container: RefCell<Option<ContainerRef>>,
}

/// A side-effecting consumer.
///
/// # Example
///
/// ```rust
/// use lattice_state::reactive::{Signal, Task};
/// use lattice_state::value::{LazyRef, Value};
///
/// let count = Signal::new(0);
/// let reader = count.clone();
/// let task = Task::new(LazyRef::new("log", move |_| {
///     println!("Count is: {:?}", reader.value());
///     Ok(Value::Undefined)
/// }));
/// task.run().unwrap();
///
/// count.set(5); // marks the task dirty
/// assert!(task.is_dirty());
/// ```
#[derive(Clone)]
pub struct Task(Rc<TaskInner>);

impl Task {
    /// Create a task. It does not run until [`Task::run`] is called.
    pub fn new(qrl: LazyRef) -> Self {
        Self(Rc::new(TaskInner {
            id: CellId::new(),
            qrl: RefCell::new(qrl),
            flags: Cell::new(task_flags::DIRTY),
            host: RefCell::new(None),
            cleanups: RefCell::new(Vec::new()),
            run_count: Cell::new(0),
            ledger: BackRefLedger::new(),
            container: RefCell::new(None),
        }))
    }

    /// Create a task scheduled on `container`.
    pub fn new_in(container: ContainerRef, qrl: LazyRef) -> Self {
        let task = Self::new(qrl);
        task.set_container(Some(container));
        task
    }

    pub(crate) fn shell() -> Self {
        Self::new(LazyRef::unresolved("", None))
    }

    pub fn id(&self) -> CellId {
        self.0.id
    }

    /// Run the task body, re-collecting its dependencies.
    pub fn run(&self) -> ReactiveResult<Value> {
        if self.is_disposed() {
            return Err(ReactiveError::Disposed);
        }
        self.run_cleanups();

        let consumer = Consumer::Task(self.clone());
        detach_all(&consumer);
        self.set_flag(task_flags::DIRTY, false);

        let edge = get_or_create_edge(&consumer, EffectProperty::Value);
        let qrl = self.qrl();
        let result = {
            let _ctx = ReactiveContext::enter(edge);
            qrl.call()
        };
        self.0.run_count.set(self.0.run_count.get() + 1);
        trace!(id = self.0.id.raw(), runs = self.0.run_count.get(), "task ran");

        match result {
            Err(ReactiveError::Suspended(promise)) => {
                debug!(id = self.0.id.raw(), "task suspended");
                let weak = Rc::downgrade(&self.0);
                promise.then(move |_| {
                    if let Some(inner) = weak.upgrade() {
                        Task(inner).reschedule();
                    }
                });
                Ok(Value::Undefined)
            }
            other => other,
        }
    }

    /// Mark dirty and hand the task to its container.
    fn reschedule(&self) {
        self.mark_dirty();
        if let Some(container) = self.container() {
            container.schedule(ChoreKind::Task, &Consumer::Task(self.clone()));
        }
    }

    /// Register a callback to run before the next run or on dispose.
    pub fn on_cleanup(&self, cleanup: impl FnOnce() + 'static) {
        self.0.cleanups.borrow_mut().push(Box::new(cleanup));
    }

    fn run_cleanups(&self) {
        let cleanups = std::mem::take(&mut *self.0.cleanups.borrow_mut());
        for cleanup in cleanups {
            cleanup();
        }
    }

    /// Dispose of the task and sever all its edges.
    ///
    /// After disposal, the task will not run again.
    pub fn dispose(&self) {
        self.set_flag(task_flags::DISPOSED, true);
        self.set_flag(task_flags::DIRTY, false);
        self.run_cleanups();
        clear_all_edges_of(&Consumer::Task(self.clone()));
    }

    pub fn is_disposed(&self) -> bool {
        self.0.flags.get() & task_flags::DISPOSED != 0
    }

    pub(crate) fn mark_dirty(&self) {
        if !self.is_disposed() {
            self.set_flag(task_flags::DIRTY, true);
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.0.flags.get() & task_flags::DIRTY != 0
    }

    /// Get the number of times the task has run.
    pub fn run_count(&self) -> usize {
        self.0.run_count.get()
    }

    pub fn flags(&self) -> u8 {
        self.0.flags.get()
    }

    fn set_flag(&self, flag: u8, on: bool) {
        let current = self.0.flags.get();
        self.0.flags.set(if on { current | flag } else { current & !flag });
    }

    pub fn qrl(&self) -> LazyRef {
        self.0.qrl.borrow().clone()
    }

    pub fn host(&self) -> Option<HostNode> {
        self.0.host.borrow().clone()
    }

    pub fn set_host(&self, host: Option<HostNode>) {
        *self.0.host.borrow_mut() = host;
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

    /// Restore state on resume.
    pub(crate) fn fill(&self, qrl: LazyRef, flag_bits: u8, host: Option<HostNode>) {
        *self.0.qrl.borrow_mut() = qrl;
        self.0.flags.set(flag_bits);
        *self.0.host.borrow_mut() = host;
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn ptr_eq(&self, other: &Task) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.0.id.raw())
            .field("flags", &self.0.flags.get())
            .field("run_count", &self.run_count())
            .field("edges", &self.0.ledger.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::LocalContainer;
    use crate::reactive::{AsyncComputed, Signal};
    use crate::value::Promise;

    #[test]
    fn task_tracks_run_count() {
        let task = Task::new(LazyRef::new("noop", |_| Ok(Value::Undefined)));
        assert_eq!(task.run_count(), 0);
        task.run().unwrap();
        task.run().unwrap();
        assert_eq!(task.run_count(), 2);
    }

    #[test]
    fn task_reruns_on_flush() {
        let container = LocalContainer::new();
        let count = Signal::new_in(container.clone(), 0);
        let reader = count.clone();
        let task = Task::new_in(container.clone(), LazyRef::new("read", move |_| Ok(reader.value())));
        task.run().unwrap();

        count.set(1);
        assert!(task.is_dirty());
        container.flush().unwrap();
        assert_eq!(task.run_count(), 2);
        assert!(!task.is_dirty());
    }

    #[test]
    fn cleanup_runs_before_rerun_and_on_dispose() {
        let task = Task::new(LazyRef::new("noop", |_| Ok(Value::Undefined)));
        let cleaned = Rc::new(Cell::new(0));

        let c = cleaned.clone();
        task.on_cleanup(move || c.set(c.get() + 1));
        task.run().unwrap();
        assert_eq!(cleaned.get(), 1);

        let c = cleaned.clone();
        task.on_cleanup(move || c.set(c.get() + 1));
        task.dispose();
        assert_eq!(cleaned.get(), 2);
    }

    #[test]
    fn disposed_task_never_runs() {
        let count = Signal::new(0);
        let reader = count.clone();
        let task = Task::new(LazyRef::new("read", move |_| Ok(reader.value())));
        task.run().unwrap();
        task.dispose();

        assert_eq!(count.subscriber_count(), 0);
        assert!(matches!(task.run(), Err(ReactiveError::Disposed)));
        count.set(1);
        assert!(!task.is_dirty());
    }

    #[test]
    fn dispose_twice_is_a_no_op() {
        let task = Task::new(LazyRef::new("noop", |_| Ok(Value::Undefined)));
        task.run().unwrap();
        task.dispose();
        task.dispose();
        assert!(task.ledger().is_empty());
    }

    #[test]
    fn suspended_task_reschedules_on_settle() {
        let container = LocalContainer::new();
        let (promise, resolver) = Promise::pending();
        let cell = AsyncComputed::new(LazyRef::new("load", move |_| Ok(Value::from(promise.clone()))));
        let reader = cell.clone();
        let task = Task::new_in(container.clone(), LazyRef::new("render", move |_| reader.value()));

        assert!(task.run().unwrap().is_undefined());
        assert_eq!(container.pending(), 0);

        resolver.resolve("ready");
        assert!(container.pending() >= 1);
        container.flush().unwrap();
        assert_eq!(task.run_count(), 2);
    }
}
