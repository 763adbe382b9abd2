//! Effect Subscriptions
//!
//! An effect subscription is the edge between one consumer and every producer
//! it read while running one property. The edge is owned by neither side:
//!
//! - the consumer finds it through its [`BackRefLedger`], keyed by property;
//! - each producer finds it in its effect set.
//!
//! The edge keeps the list of producers it was added to (its back
//! references), which is what makes teardown O(edges) instead of a scan over
//! every producer in the graph.
//!
//! # Symmetry
//!
//! For every producer `p` in `edge.producers()`, `edge` is in one of `p`'s
//! effect sets, and the other way around. [`subscribe`] and [`clear_edge`] are
//! the only places that touch both sides, and they always touch both.
//!
//! # Cascading teardown
//!
//! When clearing an edge leaves a derived producer with no subscribers, the
//! derived producer is released: its own edges are cleared, which may release
//! the producers it read, and so on up the graph.

use std::cell::{OnceCell, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;
use tracing::trace;

use super::context::ReactiveContext;
use super::subscriber::{Consumer, EffectProperty, Producer};
use crate::value::Value;

/// The set of edges subscribed to a producer, in subscription order.
pub type EffectSet = IndexSet<EffectSubscription>;

struct EdgeInner {
    consumer: OnceCell<Consumer>,
    property: OnceCell<EffectProperty>,
    back_refs: RefCell<SmallVec<[Producer; 2]>>,
    data: RefCell<Option<Value>>,
}

/// An edge from a consumer to the producers it read.
#[derive(Clone)]
pub struct EffectSubscription(Rc<EdgeInner>);

impl EffectSubscription {
    fn with(consumer: Option<Consumer>, property: Option<EffectProperty>) -> Self {
        let inner = EdgeInner {
            consumer: OnceCell::new(),
            property: OnceCell::new(),
            back_refs: RefCell::new(SmallVec::new()),
            data: RefCell::new(None),
        };
        if let Some(consumer) = consumer {
            let _ = inner.consumer.set(consumer);
        }
        if let Some(property) = property {
            let _ = inner.property.set(property);
        }
        Self(Rc::new(inner))
    }

    /// An edge with no consumer yet, filled in by the decoder.
    pub(crate) fn shell() -> Self {
        Self::with(None, None)
    }

    pub(crate) fn attach(&self, consumer: Consumer, property: EffectProperty) {
        let _ = self.0.consumer.set(consumer);
        let _ = self.0.property.set(property);
    }

    pub fn consumer(&self) -> Option<Consumer> {
        self.0.consumer.get().cloned()
    }

    pub fn property(&self) -> Option<EffectProperty> {
        self.0.property.get().cloned()
    }

    /// The producers this edge is subscribed to.
    pub fn producers(&self) -> Vec<Producer> {
        self.0.back_refs.borrow().to_vec()
    }

    pub fn producer_count(&self) -> usize {
        self.0.back_refs.borrow().len()
    }

    /// Auxiliary data attached by the consumer (for example, the element a
    /// binding renders into).
    pub fn data(&self) -> Option<Value> {
        self.0.data.borrow().clone()
    }

    pub fn set_data(&self, data: Option<Value>) {
        *self.0.data.borrow_mut() = data;
    }

    pub(crate) fn add_back_ref(&self, producer: Producer) {
        let mut back_refs = self.0.back_refs.borrow_mut();
        if !back_refs.contains(&producer) {
            back_refs.push(producer);
        }
    }

    fn take_back_refs(&self) -> SmallVec<[Producer; 2]> {
        std::mem::take(&mut *self.0.back_refs.borrow_mut())
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for EffectSubscription {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for EffectSubscription {}

impl Hash for EffectSubscription {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for EffectSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectSubscription")
            .field("property", &self.property())
            .field("producers", &self.producer_count())
            .finish()
    }
}

/// Per-consumer index of the edges it owns, one per property.
#[derive(Default)]
pub struct BackRefLedger(RefCell<IndexMap<EffectProperty, EffectSubscription>>);

impl BackRefLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, property: &EffectProperty) -> Option<EffectSubscription> {
        self.0.borrow().get(property).cloned()
    }

    pub(crate) fn insert(&self, property: EffectProperty, edge: EffectSubscription) {
        self.0.borrow_mut().insert(property, edge);
    }

    /// The owned edges in creation order.
    pub fn edges(&self) -> Vec<EffectSubscription> {
        self.0.borrow().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    fn take(&self) -> IndexMap<EffectProperty, EffectSubscription> {
        std::mem::take(&mut *self.0.borrow_mut())
    }
}

/// Return the consumer's edge for `property`, creating it if needed.
pub fn get_or_create_edge(consumer: &Consumer, property: EffectProperty) -> EffectSubscription {
    let ledger = consumer.ledger();
    if let Some(edge) = ledger.get(&property) {
        return edge;
    }
    let edge = EffectSubscription::with(Some(consumer.clone()), Some(property.clone()));
    ledger.insert(property, edge.clone());
    edge
}

/// Subscribe `edge` to `producer`, whose effect set for this read is
/// `effects`. Both sides are updated.
pub(crate) fn subscribe(edge: &EffectSubscription, producer: Producer, effects: &RefCell<EffectSet>) {
    if effects.borrow_mut().insert(edge.clone()) {
        trace!(producer = ?producer, property = ?edge.property(), "subscribed");
    }
    edge.add_back_ref(producer);
}

/// Subscribe the active edge, if any, to a producer being read.
pub(crate) fn track_read(effects: &RefCell<EffectSet>, producer: impl FnOnce() -> Producer) {
    if let Some(edge) = ReactiveContext::current_subscription() {
        subscribe(&edge, producer(), effects);
    }
}

/// Detach `edge` from every producer it is subscribed to.
///
/// Derived producers left without subscribers are released, which clears
/// their own edges in turn. Clearing an edge with no producers does nothing.
pub fn clear_edge(edge: &EffectSubscription) {
    let producers = edge.take_back_refs();
    for producer in producers {
        producer.remove_effect(edge);
        debug_assert!(!producer.has_effect(edge), "edge still subscribed after removal");
        trace!(producer = ?producer, "unsubscribed");
        if producer.subscriber_count() == 0 {
            producer.release();
        }
    }
}

/// Clear every edge owned by `consumer` and empty its ledger.
///
/// Safe to call any number of times.
pub fn clear_all_edges_of(consumer: &Consumer) {
    let edges = consumer.ledger().take();
    for edge in edges.values() {
        clear_edge(edge);
    }
}

/// Clear every edge owned by `consumer` but keep the ledger entries, so the
/// next run reuses the same edges.
pub(crate) fn detach_all(consumer: &Consumer) {
    for edge in consumer.ledger().edges() {
        clear_edge(&edge);
    }
}

/// Whether the edge and its producers agree with each other.
pub fn is_symmetric(edge: &EffectSubscription) -> bool {
    edge.producers().iter().all(|p| p.has_effect(edge))
}

/// Whether every edge subscribed to `producer` lists it as a producer.
pub fn producer_is_symmetric(producer: &Producer) -> bool {
    producer
        .effects()
        .iter()
        .all(|edge| edge.producers().contains(producer))
}
