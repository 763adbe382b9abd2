//! Derived Cells
//!
//! A derived cell caches a value computed from other cells and recomputes it
//! only when one of its inputs changed.
//!
//! # How Derived Cells Work
//!
//! 1. A new derived cell starts invalid. Nothing runs until it is read.
//!
//! 2. Reading an invalid cell recomputes it: the cell's own edge is cleared
//!    (its dependencies may have changed), the compute function runs inside a
//!    tracking context bound to that edge, and the result replaces the cache.
//!
//! 3. When an input changes, the cell is marked invalid and the change is
//!    propagated to its own subscribers. The cell itself does not recompute
//!    until somebody reads it.
//!
//! 4. A recompute that produces a value identical to the cached one clears
//!    the run-effects flag; a different value sets it.
//!
//! Two variants share the machinery here:
//!
//! - [`ComputedSignal`] runs a lazy reference.
//! - [`WrappedSignal`] forwards one property of another value (a store key or
//!   a cell), so bindings like `props.title` become trackable cells.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::trace;

use super::context::ReactiveContext;
use super::runtime::{trigger_effects, ContainerRef};
use super::signal::ReactiveCell;
use super::subscriber::{CellId, Consumer, EffectProperty, Producer};
use super::subscription::{
    clear_all_edges_of, clear_edge, get_or_create_edge, track_read, BackRefLedger, EffectSet,
};
use super::EffectSubscription;
use crate::container::HostNode;
use crate::error::{ReactiveError, ReactiveResult};
use crate::value::{LazyRef, Value};

/// Derived cell flag bits, shared by every derived variant and written to
/// the wire as is.
pub mod flags {
    /// The cached value is stale.
    pub const INVALID: u8 = 1;
    /// The last recompute produced a new value.
    pub const RUN_EFFECTS: u8 = 1 << 1;
    /// Never serialize the cached value.
    pub const SERIALIZE_NEVER: u8 = 1 << 2;
    /// Reserved for an automatic serialization policy. Not implemented.
    pub const SERIALIZE_AUTO: u8 = 1 << 3;

    /// Bits a decoder accepts.
    pub const KNOWN: u8 = INVALID | RUN_EFFECTS | SERIALIZE_NEVER;
}

/// Whether a derived cell's cached value is written when serializing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationStrategy {
    /// Write the cached value when it is valid.
    #[default]
    Always,
    /// Never write it; the cell recomputes after resume.
    Never,
}

pub(crate) enum DerivedSource {
    Lazy(LazyRef),
    Property { target: Value, prop: Rc<str> },
}

pub(crate) struct DerivedInner {
    id: CellId,
    source: RefCell<DerivedSource>,
    value: RefCell<Value>,
    flags: Cell<u8>,
    computing: Cell<bool>,
    effects: RefCell<EffectSet>,
    ledger: BackRefLedger,
    host: RefCell<Option<HostNode>>,
    container: RefCell<Option<ContainerRef>>,
}

impl DerivedInner {
    fn new(source: DerivedSource) -> Self {
        Self {
            id: CellId::new(),
            source: RefCell::new(source),
            value: RefCell::new(Value::Undefined),
            flags: Cell::new(flags::INVALID),
            computing: Cell::new(false),
            effects: RefCell::new(EffectSet::new()),
            ledger: BackRefLedger::new(),
            host: RefCell::new(None),
            container: RefCell::new(None),
        }
    }

    fn has_flag(&self, flag: u8) -> bool {
        self.flags.get() & flag != 0
    }

    fn set_flag(&self, flag: u8, on: bool) {
        let current = self.flags.get();
        self.flags.set(if on { current | flag } else { current & !flag });
    }

    fn compute(&self) -> ReactiveResult<Value> {
        // Clone out so the compute function may touch this cell's source.
        let source = match &*self.source.borrow() {
            DerivedSource::Lazy(qrl) => DerivedSource::Lazy(qrl.clone()),
            DerivedSource::Property { target, prop } => DerivedSource::Property {
                target: target.clone(),
                prop: prop.clone(),
            },
        };
        match source {
            DerivedSource::Lazy(qrl) => qrl.call(),
            DerivedSource::Property { target, prop } => {
                let value = target.get_property(&prop)?;
                value.read()
            }
        }
    }

    /// Run the recompute protocol. Returns whether the value changed.
    fn recompute(&self, consumer: Consumer) -> ReactiveResult<bool> {
        if self.computing.get() {
            return Err(ReactiveError::CircularComputation);
        }
        let edge = get_or_create_edge(&consumer, EffectProperty::Value);
        clear_edge(&edge);

        self.computing.set(true);
        let result = {
            let _ctx = ReactiveContext::enter(edge);
            self.compute()
        };
        self.computing.set(false);

        let value = match result? {
            Value::Promise(_) => return Err(ReactiveError::PromiseInSyncComputed),
            value => value,
        };
        let changed = !self.value.borrow().is_identical(&value);
        *self.value.borrow_mut() = value;
        self.set_flag(flags::INVALID, false);
        self.set_flag(flags::RUN_EFFECTS, changed);
        trace!(id = self.id.raw(), changed, "derived cell recomputed");
        Ok(changed)
    }

    fn read(&self, consumer: Consumer, producer: Producer) -> ReactiveResult<Value> {
        if self.computing.get() {
            return Err(ReactiveError::CircularComputation);
        }
        track_read(&self.effects, || producer);
        if self.has_flag(flags::INVALID) {
            self.recompute(consumer)?;
        }
        Ok(self.value.borrow().clone())
    }

    fn release(&self, consumer: Consumer) {
        clear_all_edges_of(&consumer);
        *self.host.borrow_mut() = None;
        self.set_flag(flags::INVALID, true);
    }

    fn effects(&self) -> Vec<EffectSubscription> {
        self.effects.borrow().iter().cloned().collect()
    }

    fn strategy(&self) -> SerializationStrategy {
        if self.has_flag(flags::SERIALIZE_NEVER) {
            SerializationStrategy::Never
        } else {
            SerializationStrategy::Always
        }
    }
}

macro_rules! derived_handle {
    ($name:ident, $variant:ident, $label:literal) => {
        impl $name {
            pub fn id(&self) -> CellId {
                self.0.id
            }

            /// Read the value with tracking, recomputing if invalid.
            pub fn value(&self) -> ReactiveResult<Value> {
                self.0.read(self.as_consumer(), Producer::$variant(self.clone()))
            }

            /// Writing to a derived cell is always an error.
            pub fn set(&self, _value: impl Into<Value>) -> ReactiveResult<()> {
                Err(ReactiveError::ReadOnly($label))
            }

            /// The cached value, whatever its validity. Never recomputes.
            pub fn cached_value(&self) -> Value {
                self.0.value.borrow().clone()
            }

            pub fn is_invalid(&self) -> bool {
                self.0.has_flag(flags::INVALID)
            }

            /// Whether the last recompute produced a new value.
            pub fn changed(&self) -> bool {
                self.0.has_flag(flags::RUN_EFFECTS)
            }

            pub fn flags(&self) -> u8 {
                self.0.flags.get()
            }

            /// Mark invalid and propagate to subscribers.
            pub fn invalidate(&self) {
                self.mark_invalid();
                trigger_effects(self.container().as_ref(), self.effects());
            }

            pub(crate) fn mark_invalid(&self) {
                self.0.set_flag(flags::INVALID, true);
            }

            pub fn strategy(&self) -> SerializationStrategy {
                self.0.strategy()
            }

            pub fn with_strategy(self, strategy: SerializationStrategy) -> Self {
                self.0
                    .set_flag(flags::SERIALIZE_NEVER, strategy == SerializationStrategy::Never);
                self
            }

            /// The host node this cell renders into, if any.
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

            pub fn effects(&self) -> Vec<EffectSubscription> {
                self.0.effects()
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

            pub(crate) fn release(&self) {
                self.0.release(self.as_consumer());
            }

            /// Restore state on resume.
            pub(crate) fn fill_state(&self, flag_bits: u8, value: Option<Value>) {
                self.0.flags.set(flag_bits);
                match value {
                    Some(value) => *self.0.value.borrow_mut() = value,
                    None => self.0.set_flag(flags::INVALID, true),
                }
            }

            fn as_consumer(&self) -> Consumer {
                Consumer::$variant(self.clone())
            }

            pub(crate) fn addr(&self) -> usize {
                Rc::as_ptr(&self.0) as usize
            }

            pub fn ptr_eq(&self, other: &Self) -> bool {
                Rc::ptr_eq(&self.0, &other.0)
            }
        }

        impl ReactiveCell for $name {
            fn get(&self) -> ReactiveResult<Value> {
                self.value()
            }

            fn peek(&self) -> Value {
                self.cached_value()
            }

            fn put(&self, _value: Value) -> ReactiveResult<()> {
                Err(ReactiveError::ReadOnly($label))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("id", &self.0.id.raw())
                    .field("flags", &self.0.flags.get())
                    .field("subscriber_count", &self.subscriber_count())
                    .finish()
            }
        }
    };
}

/// A derived cell computed by a lazy reference.
#[derive(Clone)]
pub struct ComputedSignal(Rc<DerivedInner>);

derived_handle!(ComputedSignal, Computed, "computed signal");

impl ComputedSignal {
    /// Create a derived cell. The function runs on first read.
    pub fn new(qrl: LazyRef) -> Self {
        Self(Rc::new(DerivedInner::new(DerivedSource::Lazy(qrl))))
    }

    pub fn new_in(container: ContainerRef, qrl: LazyRef) -> Self {
        let cell = Self::new(qrl);
        cell.set_container(Some(container));
        cell
    }

    pub(crate) fn shell() -> Self {
        Self::new(LazyRef::unresolved("", None))
    }

    /// The computation, or `None` if the cell forwards a property instead.
    pub fn qrl(&self) -> Option<LazyRef> {
        match &*self.0.source.borrow() {
            DerivedSource::Lazy(qrl) => Some(qrl.clone()),
            DerivedSource::Property { .. } => None,
        }
    }

    pub(crate) fn set_qrl(&self, qrl: LazyRef) {
        *self.0.source.borrow_mut() = DerivedSource::Lazy(qrl);
    }
}

/// A derived cell that forwards one property of another value.
#[derive(Clone)]
pub struct WrappedSignal(Rc<DerivedInner>);

derived_handle!(WrappedSignal, Wrapped, "wrapped signal");

impl WrappedSignal {
    /// Forward `target[prop]`. Reading a store key tracks that key; reading
    /// `value` of a cell tracks the cell.
    pub fn new(target: impl Into<Value>, prop: &str) -> Self {
        Self(Rc::new(DerivedInner::new(DerivedSource::Property {
            target: target.into(),
            prop: Rc::from(prop),
        })))
    }

    pub(crate) fn shell() -> Self {
        Self::new(Value::Undefined, "")
    }

    pub fn target(&self) -> Value {
        match &*self.0.source.borrow() {
            DerivedSource::Property { target, .. } => target.clone(),
            DerivedSource::Lazy(_) => Value::Undefined,
        }
    }

    pub fn prop(&self) -> Rc<str> {
        match &*self.0.source.borrow() {
            DerivedSource::Property { prop, .. } => prop.clone(),
            DerivedSource::Lazy(_) => Rc::from(""),
        }
    }

    pub(crate) fn set_target(&self, target: Value, prop: Rc<str>) {
        *self.0.source.borrow_mut() = DerivedSource::Property { target, prop };
    }
}
