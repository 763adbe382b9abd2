//! Value Model
//!
//! Every cell, store and the resumable codec speak one dynamic value type.
//! Application state is an arbitrary, possibly cyclic graph: objects point at
//! arrays that point at signals whose subscriptions point back at tasks. A
//! closed enum lets each traversal dispatch once per variant instead of
//! inspecting types at runtime.
//!
//! # Identity
//!
//! Composite variants are reference-counted handles. Cloning a handle clones
//! the reference, not the contents, so two handles to the same object compare
//! identical and the serializer can deduplicate them. Scalars (numbers,
//! strings, booleans) compare by value.

mod lazy_ref;
mod promise;

pub use lazy_ref::{LazyFn, LazyRef, SymbolResolver};
pub use promise::{Promise, PromiseResolver, PromiseStatus, Settlement};

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::container::HostNode;
use crate::error::{ReactiveError, ReactiveResult};
use crate::reactive::{
    AsyncComputed, ComputedSignal, EffectSubscription, Signal, Store, Task, WrappedSignal,
};

/// Property key of a plain object.
pub type PropKey = Rc<str>;

/// Identity of a value for deduplication purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Identity {
    /// Reference-counted handle, keyed by allocation address.
    Ptr(usize),
    /// Long string, keyed by content.
    Str(Rc<str>),
}

fn addr_of<T: ?Sized>(rc: &Rc<T>) -> usize {
    Rc::as_ptr(rc) as *const () as usize
}

thread_local! {
    static EMPTY_ARRAY: Array = Array::default();
    static EMPTY_OBJECT: Object = Object::default();
}

/// A dynamic value.
#[derive(Clone, Default)]
pub enum Value {
    /// Absence of a value.
    #[default]
    Undefined,
    /// Explicit null.
    Null,
    Bool(bool),
    Number(f64),
    /// Arbitrary precision integer, kept as its decimal digits.
    BigInt(Rc<str>),
    String(Rc<str>),
    Array(Array),
    Object(Object),
    Date(Date),
    Regex(Regex),
    Url(Url),
    Map(MapValue),
    Set(SetValue),
    Bytes(Bytes),
    Error(ErrorValue),
    Promise(Promise),
    LazyRef(LazyRef),
    Signal(Signal),
    Computed(ComputedSignal),
    Wrapped(WrappedSignal),
    AsyncComputed(AsyncComputed),
    Store(Store),
    Task(Task),
    Subscription(EffectSubscription),
    /// A host (view) node owned by the container.
    Node(HostNode),
    /// A value that is replaced by its conversion when serialized.
    Custom(CustomValue),
    /// A native callable. Never serializable.
    Function(NativeFn),
}

impl Value {
    /// Build a string value.
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::String(Rc::from(s.as_ref()))
    }

    /// Short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::BigInt(_) => "bigint",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Date(_) => "date",
            Value::Regex(_) => "regex",
            Value::Url(_) => "url",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
            Value::Bytes(_) => "bytes",
            Value::Error(_) => "error",
            Value::Promise(_) => "promise",
            Value::LazyRef(_) => "lazy reference",
            Value::Signal(_) => "signal",
            Value::Computed(_) => "computed signal",
            Value::Wrapped(_) => "wrapped signal",
            Value::AsyncComputed(_) => "async computed signal",
            Value::Store(_) => "store",
            Value::Task(_) => "task",
            Value::Subscription(_) => "effect subscription",
            Value::Node(_) => "host node",
            Value::Custom(_) => "custom value",
            Value::Function(_) => "function",
        }
    }

    pub(crate) fn identity(&self) -> Option<Identity> {
        let ptr = match self {
            Value::Array(v) => v.addr(),
            Value::Object(v) => v.addr(),
            Value::Date(v) => addr_of(&v.0),
            Value::Regex(v) => addr_of(&v.0),
            Value::Url(v) => addr_of(&v.0),
            Value::Map(v) => addr_of(&v.0),
            Value::Set(v) => addr_of(&v.0),
            Value::Bytes(v) => addr_of(&v.0),
            Value::Error(v) => addr_of(&v.0),
            Value::Promise(v) => v.addr(),
            Value::LazyRef(v) => v.addr(),
            Value::Signal(v) => v.addr(),
            Value::Computed(v) => v.addr(),
            Value::Wrapped(v) => v.addr(),
            Value::AsyncComputed(v) => v.addr(),
            Value::Store(v) => v.addr(),
            Value::Task(v) => v.addr(),
            Value::Subscription(v) => v.addr(),
            Value::Node(v) => v.addr(),
            Value::Custom(v) => addr_of(&v.0),
            Value::Function(v) => addr_of(&v.0),
            _ => return None,
        };
        Some(Identity::Ptr(ptr))
    }

    /// Write-time equality.
    ///
    /// Scalars compare by value, handles by reference. `NaN` is identical to
    /// itself so that repeatedly writing `NaN` does not reschedule effects.
    pub fn is_identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) | (Value::BigInt(a), Value::BigInt(b)) => a == b,
            _ => match (self.identity(), other.identity()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Structural comparison that tolerates cycles.
    ///
    /// Reactive cells compare by their current untracked value, lazy
    /// references by symbol, host nodes by id.
    pub fn deep_eq(&self, other: &Value) -> bool {
        let mut visiting = HashSet::new();
        deep_eq_inner(self, other, &mut visiting)
    }

    /// Unwrap a reactive cell to its current value, registering a dependency
    /// when called inside a tracking context. Non-cell values are returned
    /// unchanged.
    pub fn read(&self) -> ReactiveResult<Value> {
        match self {
            Value::Signal(s) => Ok(s.value()),
            Value::Computed(c) => c.value(),
            Value::Wrapped(w) => w.value(),
            Value::AsyncComputed(a) => a.value(),
            other => Ok(other.clone()),
        }
    }

    /// Read a property, forwarding through stores and cells.
    ///
    /// Store reads are tracked per key. Reading `value` on a cell reads the
    /// cell. Anything else yields `Undefined`.
    pub fn get_property(&self, key: &str) -> ReactiveResult<Value> {
        match self {
            Value::Store(store) => Ok(store.get(key)),
            Value::Object(obj) => Ok(obj.get(key).unwrap_or_default()),
            Value::Array(arr) => Ok(array_property(arr, key)),
            Value::Signal(_) | Value::Computed(_) | Value::Wrapped(_) | Value::AsyncComputed(_)
                if key == "value" =>
            {
                self.read()
            }
            _ => Ok(Value::Undefined),
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_signal(&self) -> Option<&Signal> {
        match self {
            Value::Signal(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_store(&self) -> Option<&Store> {
        match self {
            Value::Store(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&Promise> {
        match self {
            Value::Promise(p) => Some(p),
            _ => None,
        }
    }
}

fn array_property(arr: &Array, key: &str) -> Value {
    if key == "length" {
        return Value::Number(arr.len() as f64);
    }
    parse_array_index(key)
        .and_then(|i| arr.get(i))
        .unwrap_or_default()
}

fn deep_eq_inner(a: &Value, b: &Value, visiting: &mut HashSet<(usize, usize)>) -> bool {
    if let (Some(Identity::Ptr(pa)), Some(Identity::Ptr(pb))) = (a.identity(), b.identity()) {
        if pa == pb || !visiting.insert((pa, pb)) {
            return true;
        }
    }
    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            let (x, y) = (x.to_vec(), y.to_vec());
            x.len() == y.len() && x.iter().zip(&y).all(|(l, r)| deep_eq_inner(l, r, visiting))
        }
        (Value::Object(x), Value::Object(y)) => {
            let (x, y) = (x.entries(), y.entries());
            x.len() == y.len()
                && x.iter().all(|(k, l)| {
                    y.iter()
                        .find(|(k2, _)| k2 == k)
                        .is_some_and(|(_, r)| deep_eq_inner(l, r, visiting))
                })
        }
        (Value::Map(x), Value::Map(y)) => {
            let (x, y) = (x.entries(), y.entries());
            x.len() == y.len()
                && x.iter().zip(&y).all(|((k1, v1), (k2, v2))| {
                    deep_eq_inner(k1, k2, visiting) && deep_eq_inner(v1, v2, visiting)
                })
        }
        (Value::Set(x), Value::Set(y)) => {
            let (x, y) = (x.values(), y.values());
            x.len() == y.len() && x.iter().zip(&y).all(|(l, r)| deep_eq_inner(l, r, visiting))
        }
        (Value::Date(x), Value::Date(y)) => {
            let (x, y) = (x.millis(), y.millis());
            x == y || (x.is_nan() && y.is_nan())
        }
        (Value::Regex(x), Value::Regex(y)) => x.source() == y.source() && x.flags() == y.flags(),
        (Value::Url(x), Value::Url(y)) => x.href() == y.href(),
        (Value::Bytes(x), Value::Bytes(y)) => x.to_vec() == y.to_vec(),
        (Value::Error(x), Value::Error(y)) => {
            x.message() == y.message()
                && deep_eq_inner(
                    &Value::Object(x.props().clone()),
                    &Value::Object(y.props().clone()),
                    visiting,
                )
        }
        (Value::Promise(x), Value::Promise(y)) => match (x.settlement(), y.settlement()) {
            (Some(Ok(l)), Some(Ok(r))) | (Some(Err(l)), Some(Err(r))) => {
                deep_eq_inner(&l, &r, visiting)
            }
            (None, None) => x.status() == y.status(),
            _ => false,
        },
        (Value::LazyRef(x), Value::LazyRef(y)) => x.symbol() == y.symbol(),
        (Value::Signal(x), Value::Signal(y)) => {
            deep_eq_inner(&x.untracked_value(), &y.untracked_value(), visiting)
        }
        (Value::Store(x), Value::Store(y)) => deep_eq_inner(&x.target(), &y.target(), visiting),
        (Value::Computed(x), Value::Computed(y)) => {
            x.is_invalid() == y.is_invalid()
                && deep_eq_inner(&x.cached_value(), &y.cached_value(), visiting)
        }
        (Value::Node(x), Value::Node(y)) => x.id().is_some() && x.id() == y.id(),
        _ => a.is_identical(b),
    }
}

impl fmt::Debug for Value {
    // Shallow on purpose: graphs may be cyclic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::BigInt(d) => write!(f, "{d}n"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Array(a) => write!(f, "Array(len={})", a.len()),
            Value::Object(o) => write!(f, "Object(keys={:?})", o.keys()),
            Value::Date(d) => write!(f, "Date({})", d.millis()),
            Value::Regex(r) => write!(f, "/{}/{}", r.source(), r.flags()),
            Value::Url(u) => write!(f, "Url({})", u.href()),
            Value::Map(m) => write!(f, "Map(len={})", m.len()),
            Value::Set(s) => write!(f, "Set(len={})", s.len()),
            Value::Bytes(b) => write!(f, "Bytes(len={})", b.len()),
            Value::Error(e) => write!(f, "Error({:?})", e.message()),
            Value::Promise(p) => write!(f, "Promise({:?})", p.status()),
            Value::LazyRef(r) => write!(f, "LazyRef({})", r.symbol()),
            Value::Signal(s) => write!(f, "{s:?}"),
            Value::Computed(c) => write!(f, "{c:?}"),
            Value::Wrapped(w) => write!(f, "{w:?}"),
            Value::AsyncComputed(a) => write!(f, "{a:?}"),
            Value::Store(s) => write!(f, "{s:?}"),
            Value::Task(t) => write!(f, "{t:?}"),
            Value::Subscription(e) => write!(f, "{e:?}"),
            Value::Node(n) => write!(f, "{n:?}"),
            Value::Custom(_) => write!(f, "Custom"),
            Value::Function(_) => write!(f, "Function"),
        }
    }
}

// ----------------------------------------------------------------------------
// Conversions
// ----------------------------------------------------------------------------

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s))
    }
}

macro_rules! impl_from_handle {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        })*
    };
}

impl_from_handle! {
    Array => Array,
    Object => Object,
    Date => Date,
    Regex => Regex,
    Url => Url,
    MapValue => Map,
    SetValue => Set,
    Bytes => Bytes,
    ErrorValue => Error,
    Promise => Promise,
    LazyRef => LazyRef,
    Signal => Signal,
    ComputedSignal => Computed,
    WrappedSignal => Wrapped,
    AsyncComputed => AsyncComputed,
    Store => Store,
    Task => Task,
    EffectSubscription => Subscription,
    HostNode => Node,
    CustomValue => Custom,
    NativeFn => Function,
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(Array::from_vec(items.into_iter().map(Into::into).collect()))
    }
}

// ----------------------------------------------------------------------------
// Composite handles
// ----------------------------------------------------------------------------

/// Largest array length, and one past the largest index: 2^32 - 1.
pub const MAX_ARRAY_LEN: usize = u32::MAX as usize;

/// Parse `key` as a canonical array index (`"0"`, `"17"`, never `"017"` or
/// `"+1"`) below [`MAX_ARRAY_LEN`].
pub fn parse_array_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse::<usize>().ok().filter(|&index| index < MAX_ARRAY_LEN)
}

/// Fill that runs the first time a decoded shell's contents are touched.
#[derive(Default)]
struct PendingFill(RefCell<Option<Box<dyn FnOnce()>>>);

impl PendingFill {
    fn run(&self) {
        // Released before the call: the fill writes through the same handle.
        let fill = self.0.borrow_mut().take();
        if let Some(fill) = fill {
            fill();
        }
    }

    fn set(&self, fill: Box<dyn FnOnce()>) {
        *self.0.borrow_mut() = Some(fill);
    }

    fn cancel(&self) -> bool {
        self.0.borrow_mut().take().is_some()
    }
}

#[derive(Default)]
pub(crate) struct ArrayInner {
    items: RefCell<Vec<Value>>,
    pending: PendingFill,
}

/// A shared, mutable array.
#[derive(Clone, Default)]
pub struct Array(Rc<ArrayInner>);

impl Array {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        Self(Rc::new(ArrayInner {
            items: RefCell::new(items),
            pending: PendingFill::default(),
        }))
    }

    /// The shared empty array. It encodes as a constant and decodes to the
    /// same instance. Must not be mutated.
    pub fn empty_shared() -> Self {
        EMPTY_ARRAY.with(Clone::clone)
    }

    pub fn is_empty_shared(&self) -> bool {
        EMPTY_ARRAY.with(|shared| Rc::ptr_eq(&shared.0, &self.0))
    }

    fn items(&self) -> &RefCell<Vec<Value>> {
        self.0.pending.run();
        &self.0.items
    }

    pub fn len(&self) -> usize {
        self.items().borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().borrow().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.items().borrow().get(index).cloned()
    }

    pub fn push(&self, value: impl Into<Value>) {
        debug_assert!(!self.is_empty_shared(), "shared empty array mutated");
        self.items().borrow_mut().push(value.into());
    }

    /// Set an element, padding with `Undefined` when writing past the end.
    /// Returns the previous element.
    pub fn set(&self, index: usize, value: Value) -> ReactiveResult<Value> {
        let len = index
            .checked_add(1)
            .filter(|&len| len <= MAX_ARRAY_LEN)
            .ok_or_else(|| ReactiveError::InvalidArrayIndex(Rc::from(index.to_string())))?;
        let mut items = self.items().borrow_mut();
        if index >= items.len() {
            grow(&mut items, len)?;
        }
        Ok(std::mem::replace(&mut items[index], value))
    }

    /// Resize to `len`, padding with `Undefined`.
    pub fn set_len(&self, len: usize) -> ReactiveResult<()> {
        if len > MAX_ARRAY_LEN {
            return Err(ReactiveError::InvalidArrayLength(len as f64));
        }
        let mut items = self.items().borrow_mut();
        if len > items.len() {
            grow(&mut items, len)
        } else {
            items.truncate(len);
            Ok(())
        }
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.items().borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Array) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> usize {
        addr_of(&self.0)
    }
}

fn grow(items: &mut Vec<Value>, len: usize) -> ReactiveResult<()> {
    items
        .try_reserve(len - items.len())
        .map_err(|_| ReactiveError::InvalidArrayLength(len as f64))?;
    items.resize(len, Value::Undefined);
    Ok(())
}

#[derive(Default)]
pub(crate) struct ObjectInner {
    props: RefCell<IndexMap<PropKey, Value>>,
    pending: PendingFill,
}

/// A shared, mutable plain object with insertion-ordered keys.
#[derive(Clone, Default)]
pub struct Object(Rc<ObjectInner>);

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared empty object. Encodes as a constant. Must not be mutated.
    pub fn empty_shared() -> Self {
        EMPTY_OBJECT.with(Clone::clone)
    }

    pub fn is_empty_shared(&self) -> bool {
        EMPTY_OBJECT.with(|shared| Rc::ptr_eq(&shared.0, &self.0))
    }

    fn props(&self) -> &RefCell<IndexMap<PropKey, Value>> {
        self.0.pending.run();
        &self.0.props
    }

    /// Builder-style insert.
    pub fn with(self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.props().borrow().get(key).cloned()
    }

    /// Insert a property, returning the previous value.
    pub fn insert(&self, key: &str, value: Value) -> Option<Value> {
        debug_assert!(!self.is_empty_shared(), "shared empty object mutated");
        self.props().borrow_mut().insert(Rc::from(key), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.props().borrow_mut().shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.props().borrow().contains_key(key)
    }

    pub fn keys(&self) -> Vec<PropKey> {
        self.props().borrow().keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(PropKey, Value)> {
        self.props()
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.props().borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.props().borrow().is_empty()
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> usize {
        addr_of(&self.0)
    }
}

/// Weak handle to a decoded array or object, used to hand out the same shell
/// again without keeping it alive.
#[derive(Clone)]
pub(crate) enum WeakShell {
    Array(Weak<ArrayInner>),
    Object(Weak<ObjectInner>),
}

impl WeakShell {
    pub(crate) fn upgrade(&self) -> Option<Value> {
        match self {
            WeakShell::Array(weak) => weak.upgrade().map(|inner| Value::Array(Array(inner))),
            WeakShell::Object(weak) => weak.upgrade().map(|inner| Value::Object(Object(inner))),
        }
    }
}

impl Value {
    /// Run `fill` the first time this array or object is read or written.
    ///
    /// Other variants cannot defer and return `None` without storing `fill`.
    pub(crate) fn defer_fill(&self, fill: Box<dyn FnOnce()>) -> Option<WeakShell> {
        match self {
            Value::Array(arr) => {
                arr.0.pending.set(fill);
                Some(WeakShell::Array(Rc::downgrade(&arr.0)))
            }
            Value::Object(obj) => {
                obj.0.pending.set(fill);
                Some(WeakShell::Object(Rc::downgrade(&obj.0)))
            }
            _ => None,
        }
    }

    /// Run a deferred fill now, if one is still set.
    pub(crate) fn run_pending_fill(&self) {
        match self {
            Value::Array(arr) => arr.0.pending.run(),
            Value::Object(obj) => obj.0.pending.run(),
            _ => {}
        }
    }

    /// Drop a deferred fill without running it. Returns whether one was set.
    pub(crate) fn cancel_fill(&self) -> bool {
        match self {
            Value::Array(arr) => arr.0.pending.cancel(),
            Value::Object(obj) => obj.0.pending.cancel(),
            _ => false,
        }
    }
}

/// A timestamp in milliseconds since the epoch. `NaN` is an invalid date.
#[derive(Clone)]
pub struct Date(Rc<Cell<f64>>);

impl Date {
    pub fn new(millis: f64) -> Self {
        Self(Rc::new(Cell::new(millis)))
    }

    pub fn millis(&self) -> f64 {
        self.0.get()
    }

    pub fn set_millis(&self, millis: f64) {
        self.0.set(millis);
    }
}

/// A regular expression, kept as source text and flags.
#[derive(Clone)]
pub struct Regex(Rc<(Rc<str>, Rc<str>)>);

impl Regex {
    pub fn new(source: &str, flags: &str) -> Self {
        Self(Rc::new((Rc::from(source), Rc::from(flags))))
    }

    pub fn source(&self) -> &str {
        &self.0 .0
    }

    pub fn flags(&self) -> &str {
        &self.0 .1
    }
}

/// A URL, kept as its serialized form.
#[derive(Clone)]
pub struct Url(Rc<str>);

impl Url {
    pub fn new(href: &str) -> Self {
        Self(Rc::from(href))
    }

    pub fn href(&self) -> &str {
        &self.0
    }
}

/// An insertion-ordered map with arbitrary keys compared by identity.
#[derive(Clone, Default)]
pub struct MapValue(Rc<RefCell<Vec<(Value, Value)>>>);

impl MapValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.0
            .borrow()
            .iter()
            .find(|(k, _)| k.is_identical(key))
            .map(|(_, v)| v.clone())
    }

    pub fn insert(&self, key: Value, value: Value) {
        let mut entries = self.0.borrow_mut();
        match entries.iter_mut().find(|(k, _)| k.is_identical(&key)) {
            Some(entry) => entry.1 = value,
            None => entries.push((key, value)),
        }
    }

    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.0.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

/// An insertion-ordered set with members compared by identity.
#[derive(Clone, Default)]
pub struct SetValue(Rc<RefCell<Vec<Value>>>);

impl SetValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a member; returns false if it was already present.
    pub fn insert(&self, value: Value) -> bool {
        if self.contains(&value) {
            return false;
        }
        self.0.borrow_mut().push(value);
        true
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.0.borrow().iter().any(|v| v.is_identical(value))
    }

    pub fn values(&self) -> Vec<Value> {
        self.0.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

/// A shared byte buffer.
#[derive(Clone, Default)]
pub struct Bytes(Rc<RefCell<Vec<u8>>>);

impl Bytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Rc::new(RefCell::new(bytes)))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub(crate) fn replace(&self, bytes: Vec<u8>) {
        *self.0.borrow_mut() = bytes;
    }
}

struct ErrorInner {
    message: RefCell<String>,
    props: Object,
}

/// An error object: a message plus arbitrary extra properties.
#[derive(Clone)]
pub struct ErrorValue(Rc<ErrorInner>);

impl ErrorValue {
    pub fn new(message: impl Into<String>) -> Self {
        Self(Rc::new(ErrorInner {
            message: RefCell::new(message.into()),
            props: Object::new(),
        }))
    }

    pub fn message(&self) -> String {
        self.0.message.borrow().clone()
    }

    pub(crate) fn set_message(&self, message: String) {
        *self.0.message.borrow_mut() = message;
    }

    /// Extra properties attached to the error.
    pub fn props(&self) -> &Object {
        &self.0.props
    }
}

/// A value that opts into custom serialization.
///
/// The serializer calls the conversion and encodes the result in place of the
/// original, so after a round trip the converted value is what comes back.
#[derive(Clone)]
pub struct CustomValue(Rc<dyn Fn() -> Value>);

impl CustomValue {
    pub fn new<F>(convert: F) -> Self
    where
        F: Fn() -> Value + 'static,
    {
        Self(Rc::new(convert))
    }

    pub fn convert(&self) -> Value {
        (self.0)()
    }
}

/// A native callable held in the graph.
#[derive(Clone)]
pub struct NativeFn(Rc<dyn Fn(&[Value]) -> ReactiveResult<Value>>);

impl NativeFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> ReactiveResult<Value> + 'static,
    {
        Self(Rc::new(f))
    }

    pub fn call(&self, args: &[Value]) -> ReactiveResult<Value> {
        (self.0)(args)
    }
}

/// Shorthand used by tests and examples to signal an application error.
pub fn throw<T>(value: impl Into<Value>) -> ReactiveResult<T> {
    Err(ReactiveError::thrown(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_compare_by_value() {
        assert!(Value::from(1).is_identical(&Value::from(1.0)));
        assert!(Value::from("a").is_identical(&Value::from("a")));
        assert!(Value::Number(f64::NAN).is_identical(&Value::Number(f64::NAN)));
        assert!(!Value::Null.is_identical(&Value::Undefined));
    }

    #[test]
    fn handles_compare_by_reference() {
        let a = Object::new();
        let b = Object::new();
        assert!(Value::from(a.clone()).is_identical(&Value::from(a.clone())));
        assert!(!Value::from(a).is_identical(&Value::from(b)));
    }

    #[test]
    fn shared_empties_are_singletons() {
        assert!(Array::empty_shared().ptr_eq(&Array::empty_shared()));
        assert!(!Array::new().is_empty_shared());
        assert!(Object::empty_shared().is_empty_shared());
    }

    #[test]
    fn deep_eq_handles_cycles() {
        let a = Object::new();
        a.insert("self", Value::from(a.clone()));
        let b = Object::new();
        b.insert("self", Value::from(b.clone()));
        assert!(Value::from(a).deep_eq(&Value::from(b)));
    }

    #[test]
    fn deep_eq_detects_differences() {
        let a = Value::from(vec![Value::from(1), Value::from("x")]);
        let b = Value::from(vec![Value::from(1), Value::from("y")]);
        assert!(!a.deep_eq(&b));
    }

    #[test]
    fn array_set_pads_with_undefined() {
        let arr = Array::new();
        arr.set(2, Value::from(7)).unwrap();
        assert_eq!(arr.len(), 3);
        assert!(arr.get(0).unwrap().is_undefined());
    }

    #[test]
    fn array_writes_past_the_index_limit_fail() {
        let arr = Array::new();
        assert!(matches!(
            arr.set(usize::MAX, Value::from(1)),
            Err(ReactiveError::InvalidArrayIndex(_))
        ));
        assert!(matches!(
            arr.set(MAX_ARRAY_LEN, Value::from(1)),
            Err(ReactiveError::InvalidArrayIndex(_))
        ));
        assert!(matches!(
            arr.set_len(MAX_ARRAY_LEN + 1),
            Err(ReactiveError::InvalidArrayLength(_))
        ));
        assert!(arr.is_empty());

        arr.set_len(3).unwrap();
        arr.set_len(1).unwrap();
        assert_eq!(arr.len(), 1);
    }

    #[test]
    fn array_indices_must_be_canonical() {
        assert_eq!(parse_array_index("0"), Some(0));
        assert_eq!(parse_array_index("42"), Some(42));
        assert_eq!(parse_array_index("042"), None);
        assert_eq!(parse_array_index("+1"), None);
        assert_eq!(parse_array_index("length"), None);
        assert_eq!(parse_array_index("4294967295"), None);
        assert_eq!(parse_array_index("18446744073709551615"), None);
    }

    #[test]
    fn deferred_fill_runs_once_on_first_touch() {
        let runs = Rc::new(Cell::new(0));
        let object = Object::new();
        let (target, r) = (object.clone(), runs.clone());
        let shell = Value::from(object.clone());
        assert!(shell
            .defer_fill(Box::new(move || {
                r.set(r.get() + 1);
                target.insert("filled", Value::from(true));
            }))
            .is_some());

        assert_eq!(runs.get(), 0);
        assert_eq!(object.get("filled").unwrap().as_bool(), Some(true));
        assert_eq!(object.len(), 1);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn array_property_reads_length_and_indices() {
        let arr = Value::from(vec![10, 20]);
        assert_eq!(arr.get_property("length").unwrap().as_number(), Some(2.0));
        assert_eq!(arr.get_property("1").unwrap().as_number(), Some(20.0));
        assert!(arr.get_property("5").unwrap().is_undefined());
    }

    #[test]
    fn map_keys_use_identity() {
        let key = Object::new();
        let map = MapValue::new();
        map.insert(Value::from(key.clone()), Value::from(1));
        map.insert(Value::from(Object::new()), Value::from(2));
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&Value::from(key)).unwrap().as_number(), Some(1.0));
    }
}
