//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! tracks which edges depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read within a reactive context (task, derived cell,
//!    host node binding), the context's edge is subscribed to the signal and
//!    the signal is recorded on the edge.
//!
//! 2. When a signal is written with a value that is not identical to the
//!    current one, every subscribed edge is triggered in a single pass.
//!
//! 3. Writing an identical value does nothing at all.
//!
//! # Memory Layout
//!
//! Each signal consists of:
//! - A unique ID (8 bytes)
//! - The value
//! - The effect set (grows with number of dependents)
//! - An optional container reference used to schedule effects

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::runtime::{trigger_effects, ContainerRef};
use super::subscriber::{CellId, Producer};
use super::subscription::{track_read, EffectSet};
use super::EffectSubscription;
use crate::error::ReactiveResult;
use crate::value::Value;

/// Uniform read/write access to a reactive value.
///
/// Implemented by every cell variant so code that receives "some cell" can
/// read it with tracking and attempt writes without matching on the variant.
pub trait ReactiveCell {
    /// Read with tracking.
    fn get(&self) -> ReactiveResult<Value>;

    /// Read without tracking and without recomputing.
    fn peek(&self) -> Value;

    /// Write a value. Derived cells refuse.
    fn put(&self, value: Value) -> ReactiveResult<()>;
}

struct SignalInner {
    id: CellId,
    value: RefCell<Value>,
    effects: RefCell<EffectSet>,
    container: RefCell<Option<ContainerRef>>,
}

/// A reactive cell holding a single value.
///
/// # Example
///
/// ```rust
/// use lattice_state::reactive::Signal;
///
/// let count = Signal::new(0);
///
/// // Read the value
/// let value = count.value();
///
/// // Update the value (notifies subscribers)
/// count.set(5);
/// ```
#[derive(Clone)]
pub struct Signal(Rc<SignalInner>);

impl Signal {
    /// Create a new signal with the given initial value.
    pub fn new(value: impl Into<Value>) -> Self {
        Self(Rc::new(SignalInner {
            id: CellId::new(),
            value: RefCell::new(value.into()),
            effects: RefCell::new(EffectSet::new()),
            container: RefCell::new(None),
        }))
    }

    /// Create a signal whose effects are scheduled on `container`.
    pub fn new_in(container: ContainerRef, value: impl Into<Value>) -> Self {
        let signal = Self::new(value);
        signal.set_container(Some(container));
        signal
    }

    pub(crate) fn shell() -> Self {
        Self::new(Value::Undefined)
    }

    pub fn id(&self) -> CellId {
        self.0.id
    }

    /// Get the current value.
    ///
    /// If called within a reactive context, this also subscribes the
    /// context's edge.
    pub fn value(&self) -> Value {
        track_read(&self.0.effects, || Producer::Signal(self.clone()));
        self.untracked_value()
    }

    /// Get the current value without tracking dependencies.
    pub fn untracked_value(&self) -> Value {
        self.0.value.borrow().clone()
    }

    /// Set a new value and trigger subscribers if it changed.
    pub fn set(&self, value: impl Into<Value>) {
        let value = value.into();
        if self.0.value.borrow().is_identical(&value) {
            return;
        }
        *self.0.value.borrow_mut() = value;
        trigger_effects(self.container().as_ref(), self.effects());
    }

    /// Replace the value with `f(current)`.
    pub fn update(&self, f: impl FnOnce(&Value) -> Value) {
        let next = f(&self.untracked_value());
        self.set(next);
    }

    /// Store a value without triggering anything. Used on resume.
    pub(crate) fn fill(&self, value: Value) {
        *self.0.value.borrow_mut() = value;
    }

    pub fn container(&self) -> Option<ContainerRef> {
        self.0.container.borrow().clone()
    }

    pub fn set_container(&self, container: Option<ContainerRef>) {
        *self.0.container.borrow_mut() = container;
    }

    /// The subscribed edges, in subscription order.
    pub fn effects(&self) -> Vec<EffectSubscription> {
        self.0.effects.borrow().iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.0.effects.borrow().len()
    }

    pub(crate) fn effect_set(&self) -> &RefCell<EffectSet> {
        &self.0.effects
    }

    pub(crate) fn has_effect(&self, edge: &EffectSubscription) -> bool {
        self.0.effects.borrow().contains(edge)
    }

    pub(crate) fn remove_effect(&self, edge: &EffectSubscription) {
        self.0.effects.borrow_mut().shift_remove(edge);
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn ptr_eq(&self, other: &Signal) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl ReactiveCell for Signal {
    fn get(&self) -> ReactiveResult<Value> {
        Ok(self.value())
    }

    fn peek(&self) -> Value {
        self.untracked_value()
    }

    fn put(&self, value: Value) -> ReactiveResult<()> {
        self.set(value);
        Ok(())
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.0.id.raw())
            .field("value", &*self.0.value.borrow())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
