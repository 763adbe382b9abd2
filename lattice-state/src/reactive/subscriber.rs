//! Consumers and producers.
//!
//! A consumer is anything that reads reactive values and must be told when
//! they change: tasks, derived cells, and host nodes. A producer is anything
//! that can be read with tracking: cells and stores. Derived cells are both.
//!
//! Both sides are closed enumerations so cleanup, scheduling and
//! serialization dispatch on the variant once instead of probing types.

use std::borrow::Cow;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::subscription::BackRefLedger;
use super::{AsyncComputed, ComputedSignal, EffectSubscription, Signal, Store, Task, WrappedSignal};
use crate::container::HostNode;
use crate::value::Value;

/// Unique identifier for a cell, store or task.
///
/// Only used for diagnostics; identity in the graph is by reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId(u64);

impl CellId {
    /// Generate a new unique id.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for CellId {
    fn default() -> Self {
        Self::new()
    }
}

/// What a consumer was doing when it read a producer.
///
/// A consumer owns one edge per property, so a host node bound to both
/// `class` and `title` holds two independent edges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EffectProperty {
    /// The consumer's own value or body.
    Value,
    /// A component render.
    Component,
    /// A named attribute of a host node.
    Attr(Rc<str>),
}

const VALUE_MARK: &str = ".";
const COMPONENT_MARK: &str = ":";
const ESCAPE: char = '\\';

fn needs_escape(name: &str) -> bool {
    name == VALUE_MARK || name == COMPONENT_MARK || name.starts_with(ESCAPE)
}

impl EffectProperty {
    pub fn attr(name: &str) -> Self {
        Self::Attr(Rc::from(name))
    }

    /// Wire form of the property.
    ///
    /// `.` and `:` mark the value and component properties. An attribute
    /// whose name would read as one of those, or that starts with the escape
    /// character, is written with a leading `\`.
    pub fn to_wire(&self) -> Cow<'_, str> {
        match self {
            Self::Value => Cow::Borrowed(VALUE_MARK),
            Self::Component => Cow::Borrowed(COMPONENT_MARK),
            Self::Attr(name) if needs_escape(name) => Cow::Owned(format!("{ESCAPE}{name}")),
            Self::Attr(name) => Cow::Borrowed(&**name),
        }
    }

    pub fn from_wire(s: &str) -> Self {
        match s {
            VALUE_MARK => Self::Value,
            COMPONENT_MARK => Self::Component,
            other => Self::attr(other.strip_prefix(ESCAPE).unwrap_or(other)),
        }
    }
}

/// A computation that subscribes to producers.
#[derive(Clone)]
pub enum Consumer {
    Task(Task),
    Computed(ComputedSignal),
    Wrapped(WrappedSignal),
    AsyncComputed(AsyncComputed),
    Node(HostNode),
}

impl Consumer {
    /// The consumer's back-reference ledger.
    pub fn ledger(&self) -> &BackRefLedger {
        match self {
            Consumer::Task(t) => t.ledger(),
            Consumer::Computed(c) => c.ledger(),
            Consumer::Wrapped(w) => w.ledger(),
            Consumer::AsyncComputed(a) => a.ledger(),
            Consumer::Node(n) => n.ledger(),
        }
    }

    pub(crate) fn key(&self) -> usize {
        match self {
            Consumer::Task(t) => t.addr(),
            Consumer::Computed(c) => c.addr(),
            Consumer::Wrapped(w) => w.addr(),
            Consumer::AsyncComputed(a) => a.addr(),
            Consumer::Node(n) => n.addr(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Consumer::Task(t) => Value::Task(t.clone()),
            Consumer::Computed(c) => Value::Computed(c.clone()),
            Consumer::Wrapped(w) => Value::Wrapped(w.clone()),
            Consumer::AsyncComputed(a) => Value::AsyncComputed(a.clone()),
            Consumer::Node(n) => Value::Node(n.clone()),
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Task(t) => Consumer::Task(t.clone()),
            Value::Computed(c) => Consumer::Computed(c.clone()),
            Value::Wrapped(w) => Consumer::Wrapped(w.clone()),
            Value::AsyncComputed(a) => Consumer::AsyncComputed(a.clone()),
            Value::Node(n) => Consumer::Node(n.clone()),
            _ => return None,
        })
    }
}

impl PartialEq for Consumer {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Consumer {}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.to_value(), f)
    }
}

/// A value that can be read with tracking.
#[derive(Clone)]
pub enum Producer {
    Signal(Signal),
    Computed(ComputedSignal),
    Wrapped(WrappedSignal),
    AsyncComputed(AsyncComputed),
    Store(Store),
}

impl Producer {
    pub(crate) fn key(&self) -> usize {
        match self {
            Producer::Signal(s) => s.addr(),
            Producer::Computed(c) => c.addr(),
            Producer::Wrapped(w) => w.addr(),
            Producer::AsyncComputed(a) => a.addr(),
            Producer::Store(s) => s.addr(),
        }
    }

    /// Remove `edge` from every effect set of this producer.
    pub(crate) fn remove_effect(&self, edge: &EffectSubscription) {
        match self {
            Producer::Signal(s) => s.remove_effect(edge),
            Producer::Computed(c) => c.remove_effect(edge),
            Producer::Wrapped(w) => w.remove_effect(edge),
            Producer::AsyncComputed(a) => a.remove_effect(edge),
            Producer::Store(s) => s.remove_effect(edge),
        }
    }

    /// Whether `edge` is in any effect set of this producer.
    pub fn has_effect(&self, edge: &EffectSubscription) -> bool {
        match self {
            Producer::Signal(s) => s.has_effect(edge),
            Producer::Computed(c) => c.has_effect(edge),
            Producer::Wrapped(w) => w.has_effect(edge),
            Producer::AsyncComputed(a) => a.has_effect(edge),
            Producer::Store(s) => s.has_effect(edge),
        }
    }

    /// Every edge subscribed to this producer, across all of its effect sets.
    pub fn effects(&self) -> Vec<EffectSubscription> {
        match self {
            Producer::Signal(s) => s.effects(),
            Producer::Computed(c) => c.effects(),
            Producer::Wrapped(w) => w.effects(),
            Producer::AsyncComputed(a) => a.all_effects(),
            Producer::Store(s) => s.all_effects(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        match self {
            Producer::Signal(s) => s.subscriber_count(),
            Producer::Computed(c) => c.subscriber_count(),
            Producer::Wrapped(w) => w.subscriber_count(),
            Producer::AsyncComputed(a) => a.subscriber_count(),
            Producer::Store(s) => s.subscriber_count(),
        }
    }

    /// Called when the last subscriber went away. Derived producers drop
    /// their own edges and host node; plain cells and stores have nothing to
    /// release.
    pub(crate) fn release(&self) {
        match self {
            Producer::Computed(c) => c.release(),
            Producer::Wrapped(w) => w.release(),
            Producer::AsyncComputed(a) => a.release(),
            Producer::Signal(_) | Producer::Store(_) => {}
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Producer::Signal(s) => Value::Signal(s.clone()),
            Producer::Computed(c) => Value::Computed(c.clone()),
            Producer::Wrapped(w) => Value::Wrapped(w.clone()),
            Producer::AsyncComputed(a) => Value::AsyncComputed(a.clone()),
            Producer::Store(s) => Value::Store(s.clone()),
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Signal(s) => Producer::Signal(s.clone()),
            Value::Computed(c) => Producer::Computed(c.clone()),
            Value::Wrapped(w) => Producer::Wrapped(w.clone()),
            Value::AsyncComputed(a) => Producer::AsyncComputed(a.clone()),
            Value::Store(s) => Producer::Store(s.clone()),
            _ => return None,
        })
    }
}

impl PartialEq for Producer {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Producer {}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.to_value(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_ids_are_unique() {
        let id1 = CellId::new();
        let id2 = CellId::new();
        let id3 = CellId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn effect_property_wire_form() {
        for prop in [
            EffectProperty::Value,
            EffectProperty::Component,
            EffectProperty::attr("class"),
        ] {
            assert_eq!(EffectProperty::from_wire(&prop.to_wire()), prop);
        }
    }

    #[test]
    fn attributes_named_like_markers_are_escaped() {
        for name in [".", ":", "\\", "\\.", "\\\\x"] {
            let prop = EffectProperty::attr(name);
            let wire = prop.to_wire();
            assert!(wire.starts_with('\\'), "{name} written as {wire}");
            assert_eq!(EffectProperty::from_wire(&wire), prop);
        }
        assert_eq!(EffectProperty::attr("class").to_wire(), "class");
        assert_eq!(EffectProperty::Value.to_wire(), ".");
        assert_eq!(EffectProperty::from_wire("\\:"), EffectProperty::attr(":"));
    }

    #[test]
    fn producers_compare_by_reference() {
        let a = Signal::new(1);
        let b = Signal::new(1);
        assert_eq!(Producer::Signal(a.clone()), Producer::Signal(a));
        assert_ne!(Producer::Signal(b), Producer::Signal(Signal::new(1)));
    }
}
