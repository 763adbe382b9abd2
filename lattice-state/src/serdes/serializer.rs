//! Serializer
//!
//! Encodes a set of root values, and everything reachable from them, into
//! the wire format.
//!
//! # Algorithm
//!
//! 1. Walk every known root depth-first. Primitives and short strings are
//!    inlined. Every other value is looked up in the seen index: the first
//!    encounter is encoded in place, a repeat encounter promotes the value
//!    to a root and becomes a back-reference.
//! 2. Pending promises get a forward reference instead of a payload.
//! 3. Once every root is walked, wait for all pending promises together.
//!    Each settled promise becomes a new root and its forward reference
//!    points at it. Go back to step 1 for the new roots.
//! 4. When nothing is pending, append the forward-reference table as the
//!    last root and render.
//!
//! A pass that fails leaves no usable output.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::future::join_all;
use serde_json::{Number, Value as Json};
use tracing::{debug, error, trace};

use super::config::SerdesConfig;
use super::context::{identity_of, NodeId, SerializationContext, Slot};
use super::tags::{Constant, TypeTag, MAX_SAFE_INTEGER};
use crate::container::HostNode;
use crate::error::{SerializeError, SerializeResult};
use crate::reactive::{flags, ContainerRef, EffectSubscription, SerializationStrategy, StoreKey};
use crate::value::{CustomValue, Identity, PromiseStatus, Value};

/// Where an encoded value is placed.
#[derive(Clone, Copy)]
enum Site {
    Root(usize),
    Child { parent: NodeId, index: usize },
}

/// A single encoding pass.
///
/// ```
/// use lattice_state::serdes::Serializer;
/// use lattice_state::value::Value;
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let mut serializer = Serializer::new();
/// serializer.add_root(Value::from(vec![0, 1]));
/// let wire = serializer.serialize().await.unwrap();
/// assert_eq!(wire, "[9,[4,0,4,1]]");
/// # });
/// ```
pub struct Serializer {
    ctx: SerializationContext,
    // Conversion result per custom value, so each converts once per pass.
    converted: HashMap<Identity, Value>,
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer {
    pub fn new() -> Self {
        Self::with_config(SerdesConfig::default())
    }

    pub fn with_config(config: SerdesConfig) -> Self {
        Self {
            ctx: SerializationContext::new(config, None),
            converted: HashMap::new(),
        }
    }

    /// Use `container` to allocate host node ids.
    pub fn with_container(mut self, container: ContainerRef) -> Self {
        self.ctx.set_container(Some(container));
        self
    }

    /// Register a root and return its index. Adding the same value twice
    /// returns the same index.
    pub fn add_root(&mut self, value: impl Into<Value>) -> usize {
        self.ctx.add_root(value.into())
    }

    /// Root index a value was written under. Only meaningful after
    /// [`serialize`](Self::serialize).
    pub fn root_id(&self, value: &Value) -> SerializeResult<usize> {
        identity_of(value, self.ctx.config())
            .and_then(|identity| self.ctx.root_of(&identity))
            .ok_or(SerializeError::MissingRootId)
    }

    /// Run the pass and return the wire text.
    pub async fn serialize(&mut self) -> SerializeResult<String> {
        loop {
            while let Some(root) = self.ctx.next_unwalked() {
                self.walk_root(root)?;
            }

            let pending = self.ctx.take_pending();
            if pending.is_empty() {
                break;
            }
            debug!(count = pending.len(), "waiting for pending promises");
            let outcomes = join_all(pending.iter().map(|(_, promise)| promise.settled())).await;
            for ((forward_ref, promise), outcome) in pending.into_iter().zip(outcomes) {
                if outcome.is_none() {
                    error!(forward_ref, "promise was abandoned while serializing");
                    return Err(SerializeError::AbandonedPromise { forward_ref });
                }
                self.ctx.resolve_forward(forward_ref, promise);
            }
        }

        trace!(roots = self.ctx.root_count(), "serialization complete");
        Ok(serde_json::to_string(&self.ctx.render())?)
    }

    fn walk_root(&mut self, root: usize) -> SerializeResult<()> {
        let value = self.ctx.root_value(root);
        // Encoding never yields a raw slot for a whole value.
        if let Slot::Node(node) = self.encode(&value, Site::Root(root), 0)? {
            self.ctx.set_root_node(root, node);
        }
        Ok(())
    }

    fn encode(&mut self, value: &Value, site: Site, depth: usize) -> SerializeResult<Slot> {
        if let Value::Custom(custom) = value {
            let converted = self.convert(custom);
            if let Site::Root(root) = site {
                if let Some(existing) = self.claim_root(&converted, root)? {
                    return Ok(self.ctx.root_ref(existing));
                }
            }
            return self.encode(&converted, site, depth);
        }
        if let Value::Function(_) = value {
            return Err(SerializeError::Unserializable("function"));
        }
        if let Some((tag, payload)) = self.scalar_pair(value) {
            return Ok(self.ctx.scalar(tag, payload));
        }
        if let Value::Promise(promise) = value {
            match promise.status() {
                PromiseStatus::Pending => {
                    let forward_ref = self.ctx.forward_ref(promise);
                    return Ok(self.ctx.scalar(TypeTag::ForwardRef, Json::from(forward_ref)));
                }
                PromiseStatus::Abandoned => {
                    let forward_ref = self.ctx.forward_ref(promise);
                    error!(forward_ref, "promise was abandoned while serializing");
                    return Err(SerializeError::AbandonedPromise { forward_ref });
                }
                PromiseStatus::Resolved | PromiseStatus::Rejected => {}
            }
        }

        let Some(identity) = identity_of(value, self.ctx.config()) else {
            return Err(SerializeError::Unserializable(value.type_name()));
        };

        if let Site::Child { parent, index } = site {
            if self.ctx.is_seen(&identity) {
                let root = self
                    .ctx
                    .ensure_root(&identity)
                    .ok_or(SerializeError::MissingRootId)?;
                return Ok(self.ctx.root_ref(root));
            }
            if depth > self.ctx.config().max_inline_depth && !matches!(value, Value::String(_)) {
                let root = self.ctx.push_root(value.clone());
                trace!(root, depth, "deep value moved to a root");
                return Ok(self.ctx.root_ref(root));
            }
            let node = self.ctx.open(tag_of(value));
            self.ctx.record(identity.clone(), value, parent, index, node);
            self.fill(node, value, depth)?;
            // Promoted while its own children were encoded.
            if let Some(root) = self.ctx.root_of(&identity) {
                return Ok(self.ctx.root_ref(root));
            }
            return Ok(Slot::Node(node));
        }

        let node = self.ctx.open(tag_of(value));
        self.fill(node, value, depth)?;
        Ok(Slot::Node(node))
    }

    fn convert(&mut self, custom: &CustomValue) -> Value {
        let Some(identity) = Value::Custom(custom.clone()).identity() else {
            return custom.convert();
        };
        self.converted
            .entry(identity)
            .or_insert_with(|| custom.convert())
            .clone()
    }

    /// Record the converted form of a custom root under that root. If the
    /// converted value was already written elsewhere, return the root it
    /// lives under instead.
    fn claim_root(&mut self, converted: &Value, root: usize) -> SerializeResult<Option<usize>> {
        let Some(identity) = identity_of(converted, self.ctx.config()) else {
            return Ok(None);
        };
        if !self.ctx.is_seen(&identity) {
            self.ctx.record_root(identity, converted, root);
            return Ok(None);
        }
        let existing = self
            .ctx
            .ensure_root(&identity)
            .ok_or(SerializeError::MissingRootId)?;
        Ok((existing != root).then_some(existing))
    }

    fn scalar_pair(&self, value: &Value) -> Option<(TypeTag, Json)> {
        let constant = |c: Constant| Some((TypeTag::Constant, Json::from(c as u8)));
        match value {
            Value::Undefined => constant(Constant::Undefined),
            Value::Null => constant(Constant::Null),
            Value::Bool(true) => constant(Constant::True),
            Value::Bool(false) => constant(Constant::False),
            Value::Number(n) => match Constant::for_number(*n) {
                Some(c) => constant(c),
                None => Some((TypeTag::Plain, number_json(*n))),
            },
            Value::BigInt(digits) => Some((TypeTag::BigInt, Json::String(digits.to_string()))),
            Value::String(s) if s.is_empty() => constant(Constant::EmptyString),
            Value::String(s) if s.chars().count() < self.ctx.config().min_shared_string_len => {
                Some((TypeTag::Plain, Json::String(s.to_string())))
            }
            Value::Array(a) if a.is_empty_shared() => constant(Constant::EmptyArray),
            Value::Object(o) if o.is_empty_shared() => constant(Constant::EmptyObject),
            _ => None,
        }
    }

    fn child(&mut self, parent: NodeId, value: &Value, depth: usize) -> SerializeResult<()> {
        let index = self.ctx.reserve(parent);
        let slot = self.encode(value, Site::Child { parent, index }, depth + 1)?;
        self.ctx.set(parent, index, slot);
        Ok(())
    }

    fn raw(&mut self, parent: NodeId, json: impl Into<Json>) {
        self.ctx.push(parent, Slot::Raw(json.into()));
    }

    fn list(&mut self, parent: NodeId, values: &[Value], depth: usize) -> SerializeResult<()> {
        let list = self.ctx.open_list();
        self.ctx.push(parent, Slot::Node(list));
        for value in values {
            self.child(list, value, depth)?;
        }
        Ok(())
    }

    fn host_or_undefined(host: Option<HostNode>) -> Value {
        host.map(Value::Node).unwrap_or_default()
    }

    fn fill(&mut self, node: NodeId, value: &Value, depth: usize) -> SerializeResult<()> {
        match value {
            Value::String(s) => self.ctx.set_scalar(node, Json::String(s.to_string())),
            Value::Array(array) => {
                for item in array.to_vec() {
                    self.child(node, &item, depth)?;
                }
            }
            Value::Object(object) => {
                for (key, item) in object.entries() {
                    self.raw(node, key.to_string());
                    self.child(node, &item, depth)?;
                }
            }
            Value::Date(date) => {
                let millis = date.millis();
                let json = if millis.is_nan() { Json::Null } else { number_json(millis) };
                self.ctx.set_scalar(node, json);
            }
            Value::Regex(regex) => {
                let text = format!("/{}/{}", regex.source(), regex.flags());
                self.ctx.set_scalar(node, Json::from(text));
            }
            Value::Url(url) => self.ctx.set_scalar(node, Json::from(url.href())),
            Value::Map(map) => {
                for (key, item) in map.entries() {
                    self.child(node, &key, depth)?;
                    self.child(node, &item, depth)?;
                }
            }
            Value::Set(set) => {
                for item in set.values() {
                    self.child(node, &item, depth)?;
                }
            }
            Value::Bytes(bytes) => {
                self.ctx.set_scalar(node, Json::from(BASE64.encode(bytes.to_vec())));
            }
            Value::Error(err) => {
                self.raw(node, err.message());
                for (key, item) in err.props().entries() {
                    self.raw(node, key.to_string());
                    self.child(node, &item, depth)?;
                }
            }
            Value::Promise(promise) => {
                let (resolved, outcome) = match promise.settlement() {
                    Some(Ok(v)) => (true, v),
                    Some(Err(e)) => (false, e),
                    None => return Err(SerializeError::Unserializable("pending promise")),
                };
                self.raw(node, resolved);
                self.child(node, &outcome, depth)?;
            }
            Value::LazyRef(qrl) => {
                self.raw(node, qrl.symbol().to_string());
                for capture in qrl.captures() {
                    self.child(node, &capture, depth)?;
                }
            }
            Value::Node(host) => {
                let id = self.node_id(host)?;
                self.ctx.set_scalar(node, Json::from(id));
            }
            Value::Signal(signal) => {
                self.child(node, &signal.untracked_value(), depth)?;
                for edge in signal.effects() {
                    self.child(node, &Value::Subscription(edge), depth)?;
                }
            }
            Value::Computed(cell) => {
                let keep = cell.strategy() == SerializationStrategy::Always && !cell.is_invalid();
                let qrl = cell
                    .qrl()
                    .ok_or(SerializeError::Unserializable("derived cell without a computation"))?;
                self.child(node, &Value::LazyRef(qrl), depth)?;
                self.raw(node, derived_flags(cell.flags(), keep));
                self.list(node, &edge_values(cell.effects()), depth)?;
                self.child(node, &Self::host_or_undefined(cell.host()), depth)?;
                if keep {
                    self.child(node, &cell.cached_value(), depth)?;
                }
            }
            Value::Wrapped(cell) => {
                let keep = cell.strategy() == SerializationStrategy::Always && !cell.is_invalid();
                self.child(node, &cell.target(), depth)?;
                self.raw(node, cell.prop().to_string());
                self.raw(node, derived_flags(cell.flags(), keep));
                self.list(node, &edge_values(cell.effects()), depth)?;
                self.child(node, &Self::host_or_undefined(cell.host()), depth)?;
                if keep {
                    self.child(node, &cell.cached_value(), depth)?;
                }
            }
            Value::AsyncComputed(cell) => {
                let value = cell
                    .untracked_value()
                    .filter(|_| cell.strategy() == SerializationStrategy::Always);
                let poll_ms = cell.poll_interval().map_or(0, |d| d.as_millis() as u64);
                self.child(node, &Value::LazyRef(cell.qrl()), depth)?;
                self.raw(node, derived_flags(cell.flags(), value.is_some()));
                self.raw(node, poll_ms);
                self.list(node, &edge_values(cell.value_effects()), depth)?;
                self.list(node, &edge_values(cell.loading_effects()), depth)?;
                self.list(node, &edge_values(cell.error_effects()), depth)?;
                self.child(node, &cell.untracked_error().unwrap_or_default(), depth)?;
                if let Some(value) = value {
                    self.child(node, &value, depth)?;
                }
            }
            Value::Store(store) => {
                self.child(node, &store.target(), depth)?;
                self.raw(node, store.flags().bits());
                let by_key = self.ctx.open_list();
                self.ctx.push(node, Slot::Node(by_key));
                for (key, edges) in store.effects_by_key() {
                    self.raw(by_key, store_key_json(&key));
                    self.list(by_key, &edge_values(edges), depth)?;
                }
                for nested in store.nested_stores() {
                    self.child(node, &Value::Store(nested), depth)?;
                }
            }
            Value::Task(task) => {
                self.child(node, &Value::LazyRef(task.qrl()), depth)?;
                self.raw(node, task.flags());
                self.child(node, &Self::host_or_undefined(task.host()), depth)?;
            }
            Value::Subscription(edge) => {
                let consumer = edge.consumer().ok_or(SerializeError::DetachedSubscription)?;
                let property = edge.property().ok_or(SerializeError::DetachedSubscription)?;
                self.child(node, &consumer.to_value(), depth)?;
                self.raw(node, property.to_wire());
                let producers: Vec<Value> = edge.producers().iter().map(|p| p.to_value()).collect();
                self.list(node, &producers, depth)?;
                if let Some(data) = edge.data() {
                    self.child(node, &data, depth)?;
                }
            }
            other => return Err(SerializeError::Unserializable(other.type_name())),
        }
        Ok(())
    }

    fn node_id(&self, host: &HostNode) -> SerializeResult<String> {
        match self.ctx.container() {
            Some(container) => Ok(container.node_id(host)),
            None => host
                .id()
                .map(|id| id.to_string())
                .ok_or_else(|| SerializeError::MissingContainer(host.name())),
        }
    }
}

/// Serialize `roots` with the default configuration.
pub async fn serialize(roots: &[Value]) -> SerializeResult<String> {
    let mut serializer = Serializer::new();
    for root in roots {
        serializer.add_root(root.clone());
    }
    serializer.serialize().await
}

fn tag_of(value: &Value) -> TypeTag {
    match value {
        Value::String(_) | Value::Number(_) => TypeTag::Plain,
        Value::BigInt(_) => TypeTag::BigInt,
        Value::Array(_) => TypeTag::Array,
        Value::Object(_) => TypeTag::Object,
        Value::Date(_) => TypeTag::Date,
        Value::Regex(_) => TypeTag::Regex,
        Value::Url(_) => TypeTag::Url,
        Value::Map(_) => TypeTag::Map,
        Value::Set(_) => TypeTag::Set,
        Value::Bytes(_) => TypeTag::Bytes,
        Value::Error(_) => TypeTag::Error,
        Value::Promise(_) => TypeTag::Promise,
        Value::LazyRef(_) => TypeTag::LazyRef,
        Value::Node(_) => TypeTag::Node,
        Value::Signal(_) => TypeTag::Signal,
        Value::Computed(_) => TypeTag::Computed,
        Value::Wrapped(_) => TypeTag::Wrapped,
        Value::AsyncComputed(_) => TypeTag::AsyncComputed,
        Value::Store(_) => TypeTag::Store,
        Value::Task(_) => TypeTag::Task,
        Value::Subscription(_) => TypeTag::Subscription,
        _ => TypeTag::Constant,
    }
}

/// Integers in the safe range are written without a fraction.
fn number_json(n: f64) -> Json {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        Json::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Json::Null, Json::Number)
    }
}

/// Flags as written: known bits only, invalid whenever the value is left out.
fn derived_flags(bits: u8, keep_value: bool) -> u8 {
    let bits = bits & flags::KNOWN;
    if keep_value {
        bits
    } else {
        bits | flags::INVALID
    }
}

fn edge_values(edges: Vec<EffectSubscription>) -> Vec<Value> {
    edges.into_iter().map(Value::Subscription).collect()
}

fn store_key_json(key: &StoreKey) -> Json {
    match key {
        StoreKey::Prop(name) => Json::String(name.to_string()),
        StoreKey::WholeArray => Json::from(1),
        StoreKey::AnyKey => Json::from(0),
    }
}
