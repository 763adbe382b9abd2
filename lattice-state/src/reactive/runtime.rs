//! Reactive Runtime
//!
//! The runtime connects writes to the consumers they affect. It owns no
//! state: every cell carries a reference to the container it belongs to, and
//! the container decides when scheduled work runs.
//!
//! # How It Works
//!
//! 1. A write that changes a cell collects the cell's edges.
//!
//! 2. A [`SchedulePass`] walks the edges breadth-first:
//!    a. Derived cells are marked invalid and their own edges are queued.
//!    b. Tasks are marked dirty and collected as `Task` chores.
//!    c. Host nodes are marked dirty and collected as render chores.
//!    d. Async derived cells are marked invalid and collected for restart.
//!
//! 3. After the walk, chores are handed to the container and observed async
//!    cells restart.
//!
//! Every consumer is visited at most once per pass, so a task that reads two
//! cells changed by the same write is queued once. Marking the whole
//! invalidation frontier before anything runs means no consumer can observe
//! a half-updated graph. Derived cells recompute lazily, on their next read.

use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use tracing::{trace, warn};

use super::subscriber::{Consumer, EffectProperty};
use super::{AsyncComputed, EffectSubscription};
use crate::container::HostNode;

/// Kinds of work a container can be asked to do for a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChoreKind {
    /// Re-run a task.
    Task,
    /// Re-render one attribute of a host node.
    NodeProp,
    /// Re-render a component rooted at a host node.
    Component,
}

/// The environment cells live in.
///
/// A container schedules work, hands out ids for host nodes so they can be
/// referenced from serialized state, and looks nodes up again on resume.
pub trait Container {
    /// Enqueue `consumer` for `kind` work. Deciding when it runs is up to the
    /// container.
    fn schedule(&self, kind: ChoreKind, consumer: &Consumer);

    /// The id of `node`, allocating one if the node has none.
    fn node_id(&self, node: &HostNode) -> String;

    /// Look up a node by id.
    fn node_by_id(&self, id: &str) -> Option<HostNode>;

    fn locale(&self) -> &str;
}

/// Shared handle to a container.
pub type ContainerRef = Rc<dyn Container>;

/// One batch of effect propagation.
#[derive(Default)]
pub struct SchedulePass {
    visited: HashSet<usize>,
    chores: Vec<(ChoreKind, Consumer)>,
    restarts: Vec<AsyncComputed>,
}

impl SchedulePass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk `effects` and everything they invalidate.
    pub fn propagate(&mut self, effects: Vec<EffectSubscription>) {
        let mut queue: VecDeque<EffectSubscription> = effects.into();

        while let Some(edge) = queue.pop_front() {
            let Some(consumer) = edge.consumer() else {
                continue;
            };
            if !self.visited.insert(consumer.key()) {
                continue;
            }
            trace!(consumer = ?consumer, property = ?edge.property(), "effect triggered");

            match &consumer {
                Consumer::Task(task) => {
                    task.mark_dirty();
                    self.chores.push((ChoreKind::Task, consumer.clone()));
                }
                Consumer::Node(node) => {
                    node.mark_dirty();
                    let kind = match edge.property() {
                        Some(EffectProperty::Component) => ChoreKind::Component,
                        _ => ChoreKind::NodeProp,
                    };
                    self.chores.push((kind, consumer.clone()));
                }
                Consumer::Computed(computed) => {
                    computed.mark_invalid();
                    queue.extend(computed.effects());
                }
                Consumer::Wrapped(wrapped) => {
                    wrapped.mark_invalid();
                    queue.extend(wrapped.effects());
                }
                Consumer::AsyncComputed(cell) => {
                    cell.mark_invalid();
                    self.restarts.push(cell.clone());
                }
            }
        }
    }

    /// Hand collected chores to a container and restart async cells.
    ///
    /// Tasks prefer their own container; everything else uses `container`,
    /// the container of the cell that was written.
    pub fn finish(self, container: Option<&ContainerRef>) {
        for (kind, consumer) in &self.chores {
            let own = match consumer {
                Consumer::Task(task) => task.container(),
                _ => None,
            };
            match own.as_ref().or(container) {
                Some(container) => container.schedule(*kind, consumer),
                None => warn!(consumer = ?consumer, ?kind, "no container to schedule effect"),
            }
        }
        for cell in self.restarts {
            cell.restart_if_observed();
        }
    }
}

/// Propagate a change to `effects` in a single pass.
pub(crate) fn trigger_effects(container: Option<&ContainerRef>, effects: Vec<EffectSubscription>) {
    if effects.is_empty() {
        return;
    }
    let mut pass = SchedulePass::new();
    pass.propagate(effects);
    pass.finish(container);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::LocalContainer;
    use crate::reactive::{ComputedSignal, Signal, Task};
    use crate::value::{LazyRef, Value};
    use std::cell::Cell;

    #[test]
    fn consumer_is_scheduled_once_per_pass() {
        let container = LocalContainer::new();
        let a = Signal::new_in(container.clone(), 1);
        let b = Signal::new_in(container.clone(), 2);
        let (a2, b2) = (a.clone(), b.clone());
        let task = Task::new_in(
            container.clone(),
            LazyRef::new("sum", move |_| {
                let sum = a2.value().as_number().unwrap_or(0.0) + b2.value().as_number().unwrap_or(0.0);
                Ok(Value::from(sum))
            }),
        );
        task.run().unwrap();

        let mut effects = a.effects();
        effects.extend(b.effects());
        let mut pass = SchedulePass::new();
        pass.propagate(effects);
        let dyn_container: ContainerRef = container.clone();
        pass.finish(Some(&dyn_container));

        assert_eq!(container.pending(), 1);
        assert!(task.is_dirty());
    }

    #[test]
    fn diamond_reads_fresh_values() {
        let container = LocalContainer::new();
        let root = Signal::new_in(container.clone(), 1);
        let r1 = root.clone();
        let left = ComputedSignal::new(LazyRef::new("left", move |_| {
            Ok(Value::from(r1.value().as_number().unwrap_or(0.0) + 1.0))
        }));
        let r2 = root.clone();
        let right = ComputedSignal::new(LazyRef::new("right", move |_| {
            Ok(Value::from(r2.value().as_number().unwrap_or(0.0) * 10.0))
        }));

        let seen = Rc::new(Cell::new(0.0));
        let seen_clone = seen.clone();
        let (l, r) = (left.clone(), right.clone());
        let task = Task::new_in(
            container.clone(),
            LazyRef::new("join", move |_| {
                let total = l.value()?.as_number().unwrap_or(0.0) + r.value()?.as_number().unwrap_or(0.0);
                seen_clone.set(total);
                Ok(Value::Undefined)
            }),
        );
        task.run().unwrap();
        assert_eq!(seen.get(), 12.0);

        root.set(2);
        container.flush().unwrap();
        assert_eq!(seen.get(), 23.0);
        assert_eq!(task.run_count(), 2);
    }
}
