//! Keyed Stores
//!
//! A store wraps a plain object or array and tracks effects per key. Reading
//! a key inside a tracking context subscribes the active edge to that key
//! only; writing a key triggers exactly the edges subscribed to it, plus the
//! edges subscribed to every key.
//!
//! Access goes through explicit methods (`get`, `set`, `delete`, `has`,
//! `keys`) rather than property interception, so every access path triggers
//! tracking the same way.
//!
//! # Arrays
//!
//! Any key read on an array target subscribes to the whole array. Index and
//! length writes notify every subscriber.
//!
//! # Recursive stores
//!
//! With the recursive flag, nested plain objects and arrays are wrapped as
//! stores on first access. Wrappers are memoized per target within one store
//! family, so reading the same nested object twice yields the same wrapper.
//! The serializer relies on this to keep nested subscriptions attached to the
//! right wrapper.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use super::context::ReactiveContext;
use super::runtime::{trigger_effects, ContainerRef};
use super::subscriber::{CellId, Producer};
use super::subscription::EffectSet;
use super::EffectSubscription;
use crate::error::{ReactiveError, ReactiveResult};
use crate::value::{parse_array_index, PropKey, Value, MAX_ARRAY_LEN};

/// What a store edge is subscribed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    /// One own property.
    Prop(PropKey),
    /// Any index or the length of an array target.
    WholeArray,
    /// Every own key. Used by enumeration.
    AnyKey,
}

impl StoreKey {
    pub fn prop(key: &str) -> Self {
        Self::Prop(Rc::from(key))
    }
}

/// Store behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreFlags {
    /// Wrap nested plain objects and arrays on access.
    pub recursive: bool,
    /// Reject writes.
    pub immutable: bool,
}

impl StoreFlags {
    pub const RECURSIVE: u8 = 1;
    pub const IMMUTABLE: u8 = 1 << 1;

    pub fn recursive() -> Self {
        Self {
            recursive: true,
            immutable: false,
        }
    }

    pub fn bits(&self) -> u8 {
        let mut bits = 0;
        if self.recursive {
            bits |= Self::RECURSIVE;
        }
        if self.immutable {
            bits |= Self::IMMUTABLE;
        }
        bits
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            recursive: bits & Self::RECURSIVE != 0,
            immutable: bits & Self::IMMUTABLE != 0,
        }
    }
}

/// Length written through `length` on an array store.
fn array_length(value: &Value) -> ReactiveResult<usize> {
    let len = value.as_number().unwrap_or(f64::NAN);
    if len.fract() != 0.0 || !(0.0..=MAX_ARRAY_LEN as f64).contains(&len) {
        return Err(ReactiveError::InvalidArrayLength(len));
    }
    Ok(len as usize)
}

/// Wrappers created from one root store, by target address.
#[derive(Default)]
struct StoreFamily {
    wrappers: RefCell<HashMap<usize, Weak<StoreInner>>>,
    /// Live entries after the last prune.
    live: Cell<usize>,
}

impl StoreFamily {
    fn lookup(&self, addr: usize) -> Option<Rc<StoreInner>> {
        self.wrappers.borrow().get(&addr).and_then(Weak::upgrade)
    }

    fn insert(&self, addr: usize, wrapper: Weak<StoreInner>) {
        let mut wrappers = self.wrappers.borrow_mut();
        // Prune once the map doubles past its live size.
        if wrappers.len() >= 2 * self.live.get().max(8) {
            wrappers.retain(|_, weak| weak.strong_count() > 0);
            self.live.set(wrappers.len());
        }
        wrappers.insert(addr, wrapper);
    }

    fn len(&self) -> usize {
        self.wrappers.borrow().len()
    }
}

struct StoreInner {
    id: CellId,
    target: RefCell<Value>,
    flags: Cell<StoreFlags>,
    effects: RefCell<IndexMap<StoreKey, EffectSet>>,
    container: RefCell<Option<ContainerRef>>,
    family: RefCell<Rc<StoreFamily>>,
}

/// A reactive wrapper around a plain object or array.
#[derive(Clone)]
pub struct Store(Rc<StoreInner>);

fn target_addr(target: &Value) -> Option<usize> {
    match target {
        Value::Object(obj) => Some(obj.addr()),
        Value::Array(arr) => Some(arr.addr()),
        _ => None,
    }
}

impl Store {
    /// Wrap `target`, which must be a plain object or array.
    pub fn new(target: impl Into<Value>, flags: StoreFlags) -> ReactiveResult<Self> {
        let target = target.into();
        if target_addr(&target).is_none() {
            return Err(ReactiveError::InvalidStoreTarget(target.type_name()));
        }
        let store = Self::with_family(target, flags, Rc::new(StoreFamily::default()));
        store.register();
        Ok(store)
    }

    pub fn new_in(container: ContainerRef, target: impl Into<Value>, flags: StoreFlags) -> ReactiveResult<Self> {
        let store = Self::new(target, flags)?;
        store.set_container(Some(container));
        Ok(store)
    }

    fn with_family(target: Value, flags: StoreFlags, family: Rc<StoreFamily>) -> Self {
        Self(Rc::new(StoreInner {
            id: CellId::new(),
            target: RefCell::new(target),
            flags: Cell::new(flags),
            effects: RefCell::new(IndexMap::new()),
            container: RefCell::new(None),
            family: RefCell::new(family),
        }))
    }

    pub(crate) fn shell() -> Self {
        Self::with_family(Value::Undefined, StoreFlags::default(), Rc::new(StoreFamily::default()))
    }

    /// Restore the target and flags on resume.
    pub(crate) fn fill(&self, target: Value, flags: StoreFlags) {
        *self.0.target.borrow_mut() = target;
        self.0.flags.set(flags);
        self.register();
    }

    fn register(&self) {
        if let Some(addr) = target_addr(&self.0.target.borrow()) {
            let family = self.0.family.borrow().clone();
            family.insert(addr, Rc::downgrade(&self.0));
        }
    }

    /// Make `nested` part of this store's family so that accessing its target
    /// through this store returns `nested`.
    pub fn adopt(&self, nested: &Store) {
        let family = self.0.family.borrow().clone();
        *nested.0.family.borrow_mut() = family;
        nested.register();
    }

    pub fn id(&self) -> CellId {
        self.0.id
    }

    pub fn flags(&self) -> StoreFlags {
        self.0.flags.get()
    }

    /// The wrapped object, untracked.
    pub fn target(&self) -> Value {
        self.0.target.borrow().clone()
    }

    fn is_array(&self) -> bool {
        matches!(&*self.0.target.borrow(), Value::Array(_))
    }

    fn key_for(&self, key: &str) -> StoreKey {
        if self.is_array() {
            StoreKey::WholeArray
        } else {
            StoreKey::prop(key)
        }
    }

    fn track(&self, key: StoreKey) {
        if let Some(edge) = ReactiveContext::current_subscription() {
            let inserted = self
                .0
                .effects
                .borrow_mut()
                .entry(key)
                .or_default()
                .insert(edge.clone());
            if inserted {
                tracing::trace!(store = self.0.id.raw(), "store key subscribed");
            }
            edge.add_back_ref(Producer::Store(self.clone()));
        }
    }

    fn trigger(&self, key: StoreKey) {
        let effects: Vec<EffectSubscription> = {
            let map = self.0.effects.borrow();
            let mut set = EffectSet::new();
            if let Some(edges) = map.get(&key) {
                set.extend(edges.iter().cloned());
            }
            if let Some(edges) = map.get(&StoreKey::AnyKey) {
                set.extend(edges.iter().cloned());
            }
            set.into_iter().collect()
        };
        trigger_effects(self.container().as_ref(), effects);
    }

    /// Wrap nested composites of a recursive store, reusing memoized wrappers.
    fn wrap_nested(&self, value: Value) -> Value {
        if !self.flags().recursive {
            return value;
        }
        let Some(addr) = target_addr(&value) else {
            return value;
        };
        if matches!(&value, Value::Array(a) if a.is_empty_shared())
            || matches!(&value, Value::Object(o) if o.is_empty_shared())
        {
            return value;
        }
        let family = self.0.family.borrow().clone();
        if let Some(existing) = family.lookup(addr) {
            return Value::Store(Store(existing));
        }
        let nested = Self::with_family(value, self.flags(), family.clone());
        nested.set_container(self.container());
        family.insert(addr, Rc::downgrade(&nested.0));
        Value::Store(nested)
    }

    /// Read a property with tracking.
    pub fn get(&self, key: &str) -> Value {
        self.track(self.key_for(key));
        let value = self.target().get_property(key).unwrap_or_default();
        self.wrap_nested(value)
    }

    /// Write a property. Triggers the key's edges and the every-key edges if
    /// the value changed.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> ReactiveResult<()> {
        if self.flags().immutable {
            return Err(ReactiveError::ImmutableStore(Rc::from(key)));
        }
        // Stores hold raw targets, never wrappers.
        let value = match value.into() {
            Value::Store(store) => store.target(),
            other => other,
        };
        let changed = match self.target() {
            Value::Object(obj) => {
                let old = obj.insert(key, value.clone());
                old.map_or(true, |old| !old.is_identical(&value))
            }
            Value::Array(arr) => {
                if key == "length" {
                    let len = array_length(&value)?;
                    let changed = len != arr.len();
                    arr.set_len(len)?;
                    changed
                } else {
                    let index = parse_array_index(key)
                        .ok_or_else(|| ReactiveError::InvalidArrayIndex(Rc::from(key)))?;
                    let old = arr.set(index, value.clone())?;
                    !old.is_identical(&value)
                }
            }
            _ => false,
        };
        if changed {
            self.trigger(self.key_for(key));
        }
        Ok(())
    }

    /// Delete a property. Behaves like a write for scheduling.
    pub fn delete(&self, key: &str) -> ReactiveResult<bool> {
        if self.flags().immutable {
            return Err(ReactiveError::ImmutableStore(Rc::from(key)));
        }
        let existed = match self.target() {
            Value::Object(obj) => obj.remove(key).is_some(),
            Value::Array(arr) => match parse_array_index(key) {
                Some(index) if index < arr.len() => {
                    arr.set(index, Value::Undefined)?;
                    true
                }
                _ => false,
            },
            _ => false,
        };
        if existed {
            self.trigger(self.key_for(key));
        }
        Ok(existed)
    }

    /// Whether the key exists. Tracked like a read.
    pub fn has(&self, key: &str) -> bool {
        self.track(self.key_for(key));
        match self.target() {
            Value::Object(obj) => obj.contains_key(key),
            Value::Array(arr) => parse_array_index(key).is_some_and(|i| i < arr.len()),
            _ => false,
        }
    }

    /// Own keys. Subscribes to every key.
    pub fn keys(&self) -> Vec<PropKey> {
        self.track(StoreKey::AnyKey);
        match self.target() {
            Value::Object(obj) => obj.keys(),
            Value::Array(arr) => (0..arr.len()).map(|i| Rc::from(i.to_string())).collect(),
            _ => Vec::new(),
        }
    }

    /// Number of own keys. Subscribes to every key.
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append to an array target.
    pub fn push(&self, value: impl Into<Value>) -> ReactiveResult<()> {
        let len = match self.target() {
            Value::Array(arr) => arr.len(),
            other => return Err(ReactiveError::InvalidStoreTarget(other.type_name())),
        };
        self.set(&len.to_string(), value)
    }

    /// Wrappers of this store's direct children that currently exist.
    pub fn nested_stores(&self) -> Vec<Store> {
        if !self.flags().recursive {
            return Vec::new();
        }
        let children = match self.target() {
            Value::Object(obj) => obj.entries().into_iter().map(|(_, v)| v).collect(),
            Value::Array(arr) => arr.to_vec(),
            _ => Vec::new(),
        };
        let family = self.0.family.borrow().clone();
        let mut nested: Vec<Store> = Vec::new();
        for child in children {
            let Some(addr) = target_addr(&child) else {
                continue;
            };
            if let Some(inner) = family.lookup(addr) {
                let store = Store(inner);
                if !store.ptr_eq(self) && !nested.iter().any(|s| s.ptr_eq(&store)) {
                    nested.push(store);
                }
            }
        }
        nested
    }

    pub fn container(&self) -> Option<ContainerRef> {
        self.0.container.borrow().clone()
    }

    pub fn set_container(&self, container: Option<ContainerRef>) {
        *self.0.container.borrow_mut() = container;
    }

    /// Edges subscribed to `key`.
    pub fn effects_for(&self, key: &StoreKey) -> Vec<EffectSubscription> {
        self.0
            .effects
            .borrow()
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every key with its subscribed edges, in first-subscription order.
    pub fn effects_by_key(&self) -> Vec<(StoreKey, Vec<EffectSubscription>)> {
        self.0
            .effects
            .borrow()
            .iter()
            .map(|(key, set)| (key.clone(), set.iter().cloned().collect()))
            .collect()
    }

    pub fn all_effects(&self) -> Vec<EffectSubscription> {
        let mut all = EffectSet::new();
        for set in self.0.effects.borrow().values() {
            all.extend(set.iter().cloned());
        }
        all.into_iter().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.all_effects().len()
    }

    /// Re-link a decoded edge under `key`.
    pub(crate) fn restore_edge(&self, key: StoreKey, edge: &EffectSubscription) {
        self.0
            .effects
            .borrow_mut()
            .entry(key)
            .or_default()
            .insert(edge.clone());
        edge.add_back_ref(Producer::Store(self.clone()));
    }

    pub(crate) fn has_effect(&self, edge: &EffectSubscription) -> bool {
        self.0.effects.borrow().values().any(|set| set.contains(edge))
    }

    pub(crate) fn remove_effect(&self, edge: &EffectSubscription) {
        let mut effects = self.0.effects.borrow_mut();
        for set in effects.values_mut() {
            set.shift_remove(edge);
        }
        effects.retain(|_, set| !set.is_empty());
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn ptr_eq(&self, other: &Store) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.0.id.raw())
            .field("target", &*self.0.target.borrow())
            .field("flags", &self.0.flags.get())
            .field("keys", &self.0.effects.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::LocalContainer;
    use crate::reactive::Task;
    use crate::value::{Array, LazyRef, Object};

    fn reader(store: &Store, key: &'static str, container: &Rc<LocalContainer>) -> Task {
        let store = store.clone();
        let task = Task::new_in(container.clone(), LazyRef::new(key, move |_| Ok(store.get(key))));
        task.run().unwrap();
        task
    }

    #[test]
    fn rejects_non_object_targets() {
        assert!(matches!(
            Store::new(1, StoreFlags::default()),
            Err(ReactiveError::InvalidStoreTarget("number"))
        ));
    }

    #[test]
    fn writes_trigger_only_their_key() {
        let container = LocalContainer::new();
        let store = Store::new(Object::new().with("a", 1).with("b", 2), StoreFlags::default()).unwrap();
        let reads_a = reader(&store, "a", &container);
        let reads_b = reader(&store, "b", &container);

        store.set("a", 10).unwrap();
        assert!(reads_a.is_dirty());
        assert!(!reads_b.is_dirty());

        store.set("a", 10).unwrap();
        assert_eq!(container.pending(), 1);
    }

    #[test]
    fn enumeration_sees_every_write() {
        let container = LocalContainer::new();
        let store = Store::new(Object::new().with("a", 1), StoreFlags::default()).unwrap();
        let s = store.clone();
        let task = Task::new_in(container.clone(), LazyRef::new("keys", move |_| Ok(Value::from(s.len()))));
        task.run().unwrap();

        store.set("brand_new", true).unwrap();
        assert!(task.is_dirty());
        assert_eq!(store.effects_for(&StoreKey::AnyKey).len(), 1);
    }

    #[test]
    fn delete_schedules_like_write() {
        let container = LocalContainer::new();
        let store = Store::new(Object::new().with("a", 1), StoreFlags::default()).unwrap();
        let task = reader(&store, "a", &container);
        assert!(store.delete("a").unwrap());
        assert!(task.is_dirty());
        assert!(!store.delete("a").unwrap());
    }

    #[test]
    fn array_keys_subscribe_whole_array() {
        let container = LocalContainer::new();
        let store = Store::new(Array::from_vec(vec![Value::from(1), Value::from(2)]), StoreFlags::default()).unwrap();
        let task = reader(&store, "0", &container);
        assert_eq!(store.effects_for(&StoreKey::WholeArray).len(), 1);

        store.push(3).unwrap();
        assert!(task.is_dirty());
        assert_eq!(store.target().as_array().unwrap().len(), 3);
    }

    #[test]
    fn immutable_store_rejects_writes() {
        let flags = StoreFlags {
            recursive: false,
            immutable: true,
        };
        let store = Store::new(Object::new(), flags).unwrap();
        assert!(matches!(store.set("x", 1), Err(ReactiveError::ImmutableStore(_))));
        assert!(store.delete("x").is_err());
    }

    #[test]
    fn recursive_wrappers_are_memoized() {
        let inner = Object::new().with("n", 1);
        let store = Store::new(Object::new().with("inner", inner.clone()), StoreFlags::recursive()).unwrap();

        let first = store.get("inner");
        let second = store.get("inner");
        let (Value::Store(a), Value::Store(b)) = (&first, &second) else {
            panic!("nested object should be wrapped");
        };
        assert!(a.ptr_eq(b));
        assert!(a.target().as_object().unwrap().ptr_eq(&inner));
        assert_eq!(store.nested_stores().len(), 1);
    }

    #[test]
    fn array_writes_are_bounded() {
        let store = Store::new(Array::new(), StoreFlags::default()).unwrap();
        assert!(matches!(
            store.set("18446744073709551615", 2),
            Err(ReactiveError::InvalidArrayIndex(_))
        ));
        assert!(matches!(
            store.set("4294967295", 2),
            Err(ReactiveError::InvalidArrayIndex(_))
        ));
        assert!(matches!(store.set("label", 2), Err(ReactiveError::InvalidArrayIndex(_))));
        assert!(matches!(
            store.set("length", 1e300),
            Err(ReactiveError::InvalidArrayLength(_))
        ));
        assert!(matches!(
            store.set("length", -1),
            Err(ReactiveError::InvalidArrayLength(_))
        ));
        assert!(matches!(
            store.set("length", 1.5),
            Err(ReactiveError::InvalidArrayLength(_))
        ));
        assert!(store.target().as_array().unwrap().is_empty());

        store.set("length", 2).unwrap();
        store.set("1", "b").unwrap();
        assert_eq!(store.target().as_array().unwrap().len(), 2);
        assert!(!store.delete("01").unwrap());
    }

    #[test]
    fn dead_wrappers_are_pruned() {
        let target = Object::new();
        for i in 0..100 {
            target.insert(&format!("k{i}"), Value::from(Object::new()));
        }
        let store = Store::new(target, StoreFlags::recursive()).unwrap();
        for i in 0..100 {
            // Each wrapper is dropped right away.
            store.get(&format!("k{i}"));
        }
        let family = store.0.family.borrow().clone();
        assert!(family.len() < 40, "family kept {} entries", family.len());

        let kept = store.get("k0");
        assert!(kept.is_identical(&store.get("k0")));
    }

    #[test]
    fn flag_bits_round_trip() {
        for flags in [
            StoreFlags::default(),
            StoreFlags::recursive(),
            StoreFlags {
                recursive: true,
                immutable: true,
            },
        ] {
            assert_eq!(StoreFlags::from_bits(flags.bits()), flags);
        }
    }
}
