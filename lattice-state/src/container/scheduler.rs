//! Local Container
//!
//! A ready-to-use container for running the reactive graph in-process. It
//! keeps a FIFO queue of chores and a registry of host nodes.
//!
//! # Algorithm
//!
//! 1. Writes hand `(kind, consumer)` chores to [`Container::schedule`]. A
//!    chore already waiting in the queue is not queued again.
//! 2. [`LocalContainer::flush`] pops chores in order:
//!    - `Task` chores re-run dirty tasks;
//!    - `NodeProp` and `Component` chores refresh the host node.
//! 3. Chores queued while flushing run in the same flush.
//!
//! Derived cells are never queued: they recompute on their next read, which
//! happens while the chores that depend on them run.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use tracing::{debug, trace};

use super::node::HostNode;
use crate::error::ReactiveResult;
use crate::reactive::{ChoreKind, Consumer, Container};

/// An in-process container with a deduplicating chore queue.
pub struct LocalContainer {
    chores: RefCell<VecDeque<(ChoreKind, Consumer)>>,
    nodes: RefCell<HashMap<String, HostNode>>,
    next_id: Cell<u64>,
    locale: String,
}

impl LocalContainer {
    /// Create a new empty container.
    pub fn new() -> Rc<Self> {
        Self::with_locale("en")
    }

    pub fn with_locale(locale: &str) -> Rc<Self> {
        Rc::new(Self {
            chores: RefCell::new(VecDeque::new()),
            nodes: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
            locale: locale.to_string(),
        })
    }

    /// Number of chores waiting to run.
    pub fn pending(&self) -> usize {
        self.chores.borrow().len()
    }

    /// Remove and return every waiting chore without running it.
    pub fn drain(&self) -> Vec<(ChoreKind, Consumer)> {
        self.chores.borrow_mut().drain(..).collect()
    }

    /// Run chores until the queue is empty. Returns how many ran.
    ///
    /// Stops at the first chore that fails; the rest stay queued.
    pub fn flush(&self) -> ReactiveResult<usize> {
        let mut ran = 0;
        loop {
            let next = self.chores.borrow_mut().pop_front();
            let Some((kind, consumer)) = next else {
                break;
            };
            match (kind, &consumer) {
                (ChoreKind::Task, Consumer::Task(task)) => {
                    if task.is_dirty() && !task.is_disposed() {
                        task.run()?;
                        ran += 1;
                    }
                }
                (ChoreKind::NodeProp | ChoreKind::Component, Consumer::Node(node)) => {
                    node.refresh()?;
                    ran += 1;
                }
                (kind, consumer) => {
                    debug!(?kind, consumer = ?consumer, "chore kind does not apply to consumer");
                }
            }
        }
        trace!(ran, "flush complete");
        Ok(ran)
    }

    /// Register a node under an id it already carries.
    pub fn register_node(&self, node: &HostNode) {
        if let Some(id) = node.id() {
            self.nodes.borrow_mut().insert(id.to_string(), node.clone());
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.borrow().len()
    }
}

impl Container for LocalContainer {
    fn schedule(&self, kind: ChoreKind, consumer: &Consumer) {
        let mut chores = self.chores.borrow_mut();
        if chores.iter().any(|(k, c)| *k == kind && c == consumer) {
            return;
        }
        trace!(?kind, consumer = ?consumer, "chore queued");
        chores.push_back((kind, consumer.clone()));
    }

    fn node_id(&self, node: &HostNode) -> String {
        if let Some(id) = node.id() {
            self.nodes
                .borrow_mut()
                .entry(id.to_string())
                .or_insert_with(|| node.clone());
            return id.to_string();
        }
        let id = format!("n{}", self.next_id.get());
        self.next_id.set(self.next_id.get() + 1);
        node.set_id(&id);
        self.nodes.borrow_mut().insert(id.clone(), node.clone());
        id
    }

    fn node_by_id(&self, id: &str) -> Option<HostNode> {
        self.nodes.borrow().get(id).cloned()
    }

    fn locale(&self) -> &str {
        &self.locale
    }
}
