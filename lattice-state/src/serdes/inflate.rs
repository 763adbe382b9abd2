//! Allocate and Inflate
//!
//! Decoding a value happens in two steps:
//!
//! 1. [`allocate`] builds an empty shell of the right type from the tag
//!    alone. Scalars come out complete.
//! 2. [`inflate`] fills the shell in from its payload, decoding children as
//!    it goes.
//!
//! Root references only ever resolve to a shell. A child that refers back to
//! a root still being inflated receives that root's shell, which is how
//! cycles close on decode, and a reference never inflates its target from
//! inside the referring payload.

use std::rc::Rc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value as Json;

use super::deserializer::Roots;
use super::tags::{Constant, TypeTag, MAX_SAFE_INTEGER};
use crate::container::HostNode;
use crate::error::{DeserializeError, DeserializeResult};
use crate::reactive::{
    flags, subscribe, task_flags, AsyncComputed, ComputedSignal, Consumer, EffectProperty,
    EffectSubscription, Producer, Signal, Store, StoreFlags, StoreKey, Task, WrappedSignal,
};
use crate::value::{
    Array, Bytes, Date, ErrorValue, LazyRef, MapValue, Object, Promise, Regex, SetValue, Url,
    Value,
};

pub(crate) fn parse_tag(json: &Json) -> DeserializeResult<TypeTag> {
    let raw = json
        .as_u64()
        .ok_or_else(|| DeserializeError::malformed(format!("expected a type tag, got {json}")))?;
    u8::try_from(raw)
        .ok()
        .and_then(TypeTag::from_u8)
        .ok_or(DeserializeError::UnknownTag(raw))
}

/// Decode one slot: resolve references, or allocate and inflate in place.
pub(crate) fn decode(roots: &Rc<Roots>, tag: TypeTag, payload: &Json) -> DeserializeResult<Value> {
    let shell = allocate(roots, tag, payload)?;
    inflate(roots, &shell, tag, payload)?;
    Ok(shell)
}

/// Build the shell for `tag` without touching nested references.
pub(crate) fn allocate(roots: &Rc<Roots>, tag: TypeTag, payload: &Json) -> DeserializeResult<Value> {
    let container = roots.options().container.clone();
    let value = match tag {
        TypeTag::RootRef => roots.resolve(index(payload)?)?,
        TypeTag::ForwardRef => roots.forward(index(payload)?)?,
        TypeTag::ForwardRefs => {
            return Err(DeserializeError::malformed("forward-reference table used as a value"))
        }
        TypeTag::Constant => constant(payload)?,
        TypeTag::Plain => match payload {
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Value::string(s),
            other => return Err(DeserializeError::malformed(format!("bad plain payload {other}"))),
        },
        TypeTag::BigInt => Value::BigInt(Rc::from(text(payload)?)),
        TypeTag::Url => Value::Url(Url::new(text(payload)?)),
        TypeTag::Date => Value::Date(Date::new(payload.as_f64().unwrap_or(f64::NAN))),
        TypeTag::Regex => {
            let (source, flags) = text(payload)?
                .strip_prefix('/')
                .and_then(|body| body.rsplit_once('/'))
                .ok_or_else(|| DeserializeError::malformed("regex payload is not /source/flags"))?;
            Value::Regex(Regex::new(source, flags))
        }
        TypeTag::Array => Value::Array(Array::new()),
        TypeTag::Object => Value::Object(Object::new()),
        TypeTag::Map => Value::Map(MapValue::new()),
        TypeTag::Set => Value::Set(SetValue::new()),
        TypeTag::Bytes => Value::Bytes(Bytes::new(Vec::new())),
        TypeTag::Error => Value::Error(ErrorValue::new("")),
        TypeTag::Promise => Value::Promise(Promise::shell()),
        TypeTag::LazyRef => Value::LazyRef(LazyRef::unresolved("", roots.options().resolver.clone())),
        TypeTag::Node => Value::Node(host_node(roots, text(payload)?)?),
        TypeTag::Signal => {
            let signal = Signal::shell();
            signal.set_container(container);
            Value::Signal(signal)
        }
        TypeTag::Computed => {
            let cell = ComputedSignal::shell();
            cell.set_container(container);
            Value::Computed(cell)
        }
        TypeTag::Wrapped => {
            let cell = WrappedSignal::shell();
            cell.set_container(container);
            Value::Wrapped(cell)
        }
        TypeTag::AsyncComputed => {
            let cell = AsyncComputed::shell();
            cell.set_container(container);
            Value::AsyncComputed(cell)
        }
        TypeTag::Store => {
            let store = Store::shell();
            store.set_container(container);
            Value::Store(store)
        }
        TypeTag::Task => {
            let task = Task::shell();
            task.set_container(container);
            Value::Task(task)
        }
        TypeTag::Subscription => Value::Subscription(EffectSubscription::shell()),
    };
    Ok(value)
}

/// Fill a shell produced by [`allocate`] from its payload.
pub(crate) fn inflate(roots: &Rc<Roots>, shell: &Value, tag: TypeTag, payload: &Json) -> DeserializeResult<()> {
    match (tag, shell) {
        (TypeTag::Array, Value::Array(array)) => {
            let mut reader = Reader::new(roots, payload)?;
            while reader.has_more() {
                array.push(reader.value()?);
            }
        }
        (TypeTag::Object, Value::Object(object)) => {
            let mut reader = Reader::new(roots, payload)?;
            while reader.has_more() {
                let key = reader.text()?;
                object.insert(key, reader.value()?);
            }
        }
        (TypeTag::Map, Value::Map(map)) => {
            let mut reader = Reader::new(roots, payload)?;
            while reader.has_more() {
                let key = reader.value()?;
                map.insert(key, reader.value()?);
            }
        }
        (TypeTag::Set, Value::Set(set)) => {
            let mut reader = Reader::new(roots, payload)?;
            while reader.has_more() {
                set.insert(reader.value()?);
            }
        }
        (TypeTag::Bytes, Value::Bytes(bytes)) => {
            let decoded = BASE64
                .decode(text(payload)?)
                .map_err(|err| DeserializeError::malformed(format!("bad base64: {err}")))?;
            bytes.replace(decoded);
        }
        (TypeTag::Error, Value::Error(err)) => {
            let mut reader = Reader::new(roots, payload)?;
            err.set_message(reader.text()?.to_string());
            while reader.has_more() {
                let key = reader.text()?;
                err.props().insert(key, reader.value()?);
            }
        }
        (TypeTag::Promise, Value::Promise(promise)) => {
            let mut reader = Reader::new(roots, payload)?;
            let resolved = reader
                .raw()?
                .as_bool()
                .ok_or_else(|| DeserializeError::malformed("promise state is not a bool"))?;
            let outcome = reader.value()?;
            promise.settle(if resolved { Ok(outcome) } else { Err(outcome) });
        }
        (TypeTag::LazyRef, Value::LazyRef(qrl)) => {
            let mut reader = Reader::new(roots, payload)?;
            let symbol = Rc::from(reader.text()?);
            let captures = reader.rest()?;
            qrl.fill(symbol, captures);
        }
        (TypeTag::Signal, Value::Signal(signal)) => {
            let mut reader = Reader::new(roots, payload)?;
            signal.fill(reader.value()?);
            for edge in edges(reader.rest()?)? {
                subscribe(&edge, Producer::Signal(signal.clone()), signal.effect_set());
            }
        }
        (TypeTag::Computed, Value::Computed(cell)) => {
            let mut reader = Reader::new(roots, payload)?;
            let qrl = lazy_ref(reader.value()?)?;
            let bits = check_flags(reader.byte()?, flags::KNOWN)?;
            let subscribed = edges(reader.list()?.rest()?)?;
            let host = host(reader.value()?)?;
            let value = reader.optional()?;
            cell.set_qrl(qrl);
            cell.set_host(host);
            cell.fill_state(bits, value);
            for edge in subscribed {
                subscribe(&edge, Producer::Computed(cell.clone()), cell.effect_set());
            }
        }
        (TypeTag::Wrapped, Value::Wrapped(cell)) => {
            let mut reader = Reader::new(roots, payload)?;
            let target = reader.value()?;
            let prop = Rc::from(reader.text()?);
            let bits = check_flags(reader.byte()?, flags::KNOWN)?;
            let subscribed = edges(reader.list()?.rest()?)?;
            let host = host(reader.value()?)?;
            let value = reader.optional()?;
            cell.set_target(target, prop);
            cell.set_host(host);
            cell.fill_state(bits, value);
            for edge in subscribed {
                subscribe(&edge, Producer::Wrapped(cell.clone()), cell.effect_set());
            }
        }
        (TypeTag::AsyncComputed, Value::AsyncComputed(cell)) => {
            let mut reader = Reader::new(roots, payload)?;
            let qrl = lazy_ref(reader.value()?)?;
            let bits = check_flags(reader.byte()?, flags::KNOWN)?;
            let poll_ms = reader
                .raw()?
                .as_u64()
                .ok_or_else(|| DeserializeError::malformed("poll interval is not an integer"))?;
            let value_edges = edges(reader.list()?.rest()?)?;
            let loading_edges = edges(reader.list()?.rest()?)?;
            let error_edges = edges(reader.list()?.rest()?)?;
            let error = match reader.value()? {
                Value::Undefined => None,
                error => Some(error),
            };
            let value = reader.optional()?;
            let poll = (poll_ms > 0).then(|| Duration::from_millis(poll_ms));

            cell.set_qrl(qrl);
            cell.fill_state(bits, poll, error, value);
            let sets = cell.effect_sets();
            for (set, subscribed) in sets.into_iter().zip([value_edges, loading_edges, error_edges]) {
                for edge in subscribed {
                    subscribe(&edge, Producer::AsyncComputed(cell.clone()), set);
                }
            }
        }
        (TypeTag::Store, Value::Store(store)) => {
            let mut reader = Reader::new(roots, payload)?;
            let target = reader.value()?;
            let bits = check_flags(reader.byte()?, StoreFlags::RECURSIVE | StoreFlags::IMMUTABLE)?;
            store.fill(target, StoreFlags::from_bits(bits));

            let mut keyed = reader.list()?;
            while keyed.has_more() {
                let key = store_key(keyed.raw()?)?;
                for edge in edges(keyed.list()?.rest()?)? {
                    store.restore_edge(key.clone(), &edge);
                }
            }
            for nested in reader.rest()? {
                match nested {
                    Value::Store(nested) => store.adopt(&nested),
                    other => {
                        return Err(DeserializeError::malformed(format!(
                            "expected a nested store, got {}",
                            other.type_name()
                        )))
                    }
                }
            }
        }
        (TypeTag::Task, Value::Task(task)) => {
            let mut reader = Reader::new(roots, payload)?;
            let qrl = lazy_ref(reader.value()?)?;
            let bits = check_flags(reader.byte()?, task_flags::DIRTY | task_flags::DISPOSED)?;
            let host = host(reader.value()?)?;
            task.fill(qrl, bits, host);
        }
        (TypeTag::Subscription, Value::Subscription(edge)) => {
            let mut reader = Reader::new(roots, payload)?;
            let consumer_value = reader.value()?;
            let consumer = Consumer::from_value(&consumer_value).ok_or_else(|| {
                DeserializeError::malformed(format!(
                    "{} cannot own a subscription",
                    consumer_value.type_name()
                ))
            })?;
            let property = EffectProperty::from_wire(reader.text()?);
            edge.attach(consumer.clone(), property.clone());
            consumer.ledger().insert(property, edge.clone());

            // Producers fill their own effect sets when they inflate; this
            // side only needs the back references.
            for producer_value in reader.list()?.rest()? {
                let producer = Producer::from_value(&producer_value).ok_or_else(|| {
                    DeserializeError::malformed(format!(
                        "{} cannot produce effects",
                        producer_value.type_name()
                    ))
                })?;
                edge.add_back_ref(producer);
            }
            edge.set_data(reader.optional()?);
        }
        // Scalars and references come out of `allocate` complete.
        _ => {}
    }
    Ok(())
}

/// Cursor over a payload array.
pub(crate) struct Reader<'a> {
    roots: &'a Rc<Roots>,
    items: &'a [Json],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(roots: &'a Rc<Roots>, payload: &'a Json) -> DeserializeResult<Self> {
        let items = payload
            .as_array()
            .ok_or_else(|| DeserializeError::malformed(format!("expected an array payload, got {payload}")))?;
        Ok(Self {
            roots,
            items,
            pos: 0,
        })
    }

    pub fn has_more(&self) -> bool {
        self.pos < self.items.len()
    }

    pub fn raw(&mut self) -> DeserializeResult<&'a Json> {
        let item = self
            .items
            .get(self.pos)
            .ok_or_else(|| DeserializeError::malformed("payload ended early"))?;
        self.pos += 1;
        Ok(item)
    }

    pub fn text(&mut self) -> DeserializeResult<&'a str> {
        text(self.raw()?)
    }

    pub fn byte(&mut self) -> DeserializeResult<u8> {
        let raw = self.raw()?;
        raw.as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .ok_or_else(|| DeserializeError::malformed(format!("expected flag bits, got {raw}")))
    }

    /// The next tag/payload pair, decoded.
    pub fn value(&mut self) -> DeserializeResult<Value> {
        let tag = parse_tag(self.raw()?)?;
        let payload = self.raw()?;
        decode(self.roots, tag, payload)
    }

    pub fn optional(&mut self) -> DeserializeResult<Option<Value>> {
        if self.has_more() {
            self.value().map(Some)
        } else {
            Ok(None)
        }
    }

    /// A nested list of slots.
    pub fn list(&mut self) -> DeserializeResult<Reader<'a>> {
        let raw = self.raw()?;
        Reader::new(self.roots, raw)
    }

    /// Decode every remaining slot.
    pub fn rest(mut self) -> DeserializeResult<Vec<Value>> {
        let mut values = Vec::new();
        while self.has_more() {
            values.push(self.value()?);
        }
        Ok(values)
    }
}

fn text(json: &Json) -> DeserializeResult<&str> {
    json.as_str()
        .ok_or_else(|| DeserializeError::malformed(format!("expected a string, got {json}")))
}

fn index(json: &Json) -> DeserializeResult<usize> {
    json.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| DeserializeError::malformed(format!("expected an index, got {json}")))
}

fn constant(json: &Json) -> DeserializeResult<Value> {
    let raw = json.as_u64().unwrap_or(u64::MAX);
    let constant = u8::try_from(raw)
        .ok()
        .and_then(Constant::from_u8)
        .ok_or_else(|| DeserializeError::malformed(format!("unknown constant {json}")))?;
    Ok(match constant {
        Constant::Undefined => Value::Undefined,
        Constant::Null => Value::Null,
        Constant::True => Value::Bool(true),
        Constant::False => Value::Bool(false),
        Constant::EmptyString => Value::string(""),
        Constant::EmptyArray => Value::Array(Array::empty_shared()),
        Constant::EmptyObject => Value::Object(Object::empty_shared()),
        Constant::NaN => Value::Number(f64::NAN),
        Constant::PositiveInfinity => Value::Number(f64::INFINITY),
        Constant::NegativeInfinity => Value::Number(f64::NEG_INFINITY),
        Constant::MaxSafeInt => Value::Number(MAX_SAFE_INTEGER),
        Constant::AlmostMaxSafeInt => Value::Number(MAX_SAFE_INTEGER - 1.0),
        Constant::MinSafeInt => Value::Number(-MAX_SAFE_INTEGER),
        Constant::NegativeZero => Value::Number(-0.0),
    })
}

fn check_flags(bits: u8, known: u8) -> DeserializeResult<u8> {
    if bits & !known != 0 {
        return Err(DeserializeError::ReservedFlags(bits & !known));
    }
    Ok(bits)
}

fn host_node(roots: &Rc<Roots>, id: &str) -> DeserializeResult<HostNode> {
    match &roots.options().container {
        Some(container) => container
            .node_by_id(id)
            .ok_or_else(|| DeserializeError::UnknownNode(id.to_string())),
        None => {
            let node = HostNode::new("");
            node.set_id(id);
            Ok(node)
        }
    }
}

fn host(value: Value) -> DeserializeResult<Option<HostNode>> {
    match value {
        Value::Node(node) => Ok(Some(node)),
        Value::Undefined => Ok(None),
        other => Err(DeserializeError::malformed(format!(
            "expected a host node, got {}",
            other.type_name()
        ))),
    }
}

fn lazy_ref(value: Value) -> DeserializeResult<LazyRef> {
    match value {
        Value::LazyRef(qrl) => Ok(qrl),
        other => Err(DeserializeError::malformed(format!(
            "expected a lazy reference, got {}",
            other.type_name()
        ))),
    }
}

fn edges(values: Vec<Value>) -> DeserializeResult<Vec<EffectSubscription>> {
    values
        .into_iter()
        .map(|value| match value {
            Value::Subscription(edge) => Ok(edge),
            other => Err(DeserializeError::malformed(format!(
                "expected an effect subscription, got {}",
                other.type_name()
            ))),
        })
        .collect()
}

fn store_key(json: &Json) -> DeserializeResult<StoreKey> {
    match json {
        Json::String(name) => Ok(StoreKey::prop(name)),
        Json::Number(n) if n.as_u64() == Some(1) => Ok(StoreKey::WholeArray),
        Json::Number(n) if n.as_u64() == Some(0) => Ok(StoreKey::AnyKey),
        other => Err(DeserializeError::malformed(format!("bad store key {other}"))),
    }
}
