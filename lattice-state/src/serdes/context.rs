//! Serialization Context
//!
//! Owns the state of one encoding pass: the node arena, the seen index, the
//! root list and the forward-reference table.
//!
//! # How Encoding Works
//!
//! Output is built as a tree of arena nodes before it is rendered to JSON.
//! A value's node is allocated and recorded in the seen index *before* its
//! children are encoded, together with the slot it occupies in its parent.
//!
//! When a recorded value is reached again it is promoted: its node becomes a
//! new root and the parent slot is rewritten to a root reference. Because the
//! node is shared rather than copied, promotion works even while the value is
//! still being encoded, which is what makes cycles terminate.
//!
//! Pending promises are not encoded in place. They get a forward-reference
//! index right away and are appended as roots once they settle.

use std::collections::HashMap;

use serde_json::Value as Json;
use tracing::debug;

use super::config::SerdesConfig;
use super::tags::TypeTag;
use crate::reactive::ContainerRef;
use crate::value::{Identity, Promise, Value};

pub(crate) type NodeId = usize;

/// One entry of a payload.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    /// A bare JSON value.
    Raw(Json),
    /// A tag/payload pair or a list, depending on the node.
    Node(NodeId),
}

#[derive(Debug)]
pub(crate) enum Payload {
    Scalar(Json),
    Items(Vec<Slot>),
}

#[derive(Debug)]
pub(crate) enum EncNode {
    /// Renders as `tag, payload`.
    Pair { tag: TypeTag, payload: Payload },
    /// Renders as one JSON array of its slots.
    List(Vec<Slot>),
}

#[derive(Debug, Clone, Copy)]
enum Placement {
    Inline {
        parent: NodeId,
        index: usize,
        node: NodeId,
    },
    Root(usize),
}

struct SeenEntry {
    // Held so the address behind the identity stays allocated for the pass.
    value: Value,
    placement: Placement,
}

struct RootEntry {
    value: Value,
    node: Option<NodeId>,
}

pub(crate) struct SerializationContext {
    config: SerdesConfig,
    container: Option<ContainerRef>,
    nodes: Vec<EncNode>,
    seen: HashMap<Identity, SeenEntry>,
    roots: Vec<RootEntry>,
    cursor: usize,
    forward_refs: Vec<Option<usize>>,
    forward_by_promise: HashMap<usize, usize>,
    pending: Vec<(usize, Promise)>,
}

impl SerializationContext {
    pub fn new(config: SerdesConfig, container: Option<ContainerRef>) -> Self {
        Self {
            config,
            container,
            nodes: Vec::new(),
            seen: HashMap::new(),
            roots: Vec::new(),
            cursor: 0,
            forward_refs: Vec::new(),
            forward_by_promise: HashMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn config(&self) -> &SerdesConfig {
        &self.config
    }

    pub fn container(&self) -> Option<&ContainerRef> {
        self.container.as_ref()
    }

    pub fn set_container(&mut self, container: Option<ContainerRef>) {
        self.container = container;
    }

    // ---- arena ----

    fn alloc(&mut self, node: EncNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// A complete scalar pair.
    pub fn scalar(&mut self, tag: TypeTag, payload: Json) -> Slot {
        Slot::Node(self.alloc(EncNode::Pair {
            tag,
            payload: Payload::Scalar(payload),
        }))
    }

    /// A pair whose items are pushed afterwards.
    pub fn open(&mut self, tag: TypeTag) -> NodeId {
        self.alloc(EncNode::Pair {
            tag,
            payload: Payload::Items(Vec::new()),
        })
    }

    pub fn open_list(&mut self) -> NodeId {
        self.alloc(EncNode::List(Vec::new()))
    }

    pub fn set_scalar(&mut self, node: NodeId, json: Json) {
        if let EncNode::Pair { payload, .. } = &mut self.nodes[node] {
            *payload = Payload::Scalar(json);
        }
    }

    fn items_mut(&mut self, node: NodeId) -> Option<&mut Vec<Slot>> {
        match &mut self.nodes[node] {
            EncNode::Pair {
                payload: Payload::Items(items),
                ..
            } => Some(items),
            EncNode::List(items) => Some(items),
            EncNode::Pair { .. } => None,
        }
    }

    pub fn push(&mut self, node: NodeId, slot: Slot) {
        if let Some(items) = self.items_mut(node) {
            items.push(slot);
        }
    }

    /// Reserve the next slot of `node` and return its index.
    pub fn reserve(&mut self, node: NodeId) -> usize {
        match self.items_mut(node) {
            Some(items) => {
                items.push(Slot::Raw(Json::Null));
                items.len() - 1
            }
            None => 0,
        }
    }

    pub fn set(&mut self, node: NodeId, index: usize, slot: Slot) {
        if let Some(entry) = self.items_mut(node).and_then(|items| items.get_mut(index)) {
            *entry = slot;
        }
    }

    pub fn root_ref(&mut self, root: usize) -> Slot {
        self.scalar(TypeTag::RootRef, Json::from(root))
    }

    // ---- seen index and roots ----

    /// Record the first inline encounter of a value.
    pub fn record(&mut self, identity: Identity, value: &Value, parent: NodeId, index: usize, node: NodeId) {
        self.seen.insert(
            identity,
            SeenEntry {
                value: value.clone(),
                placement: Placement::Inline {
                    parent,
                    index,
                    node,
                },
            },
        );
    }

    /// Record a value written as the body of `root`.
    pub fn record_root(&mut self, identity: Identity, value: &Value, root: usize) {
        self.seen.insert(
            identity,
            SeenEntry {
                value: value.clone(),
                placement: Placement::Root(root),
            },
        );
    }

    pub fn is_seen(&self, identity: &Identity) -> bool {
        self.seen.contains_key(identity)
    }

    pub fn root_of(&self, identity: &Identity) -> Option<usize> {
        match self.seen.get(identity)?.placement {
            Placement::Root(root) => Some(root),
            Placement::Inline { .. } => None,
        }
    }

    /// Root index of a seen value, promoting it first if it is still inline.
    pub fn ensure_root(&mut self, identity: &Identity) -> Option<usize> {
        let (value, placement) = {
            let entry = self.seen.get(identity)?;
            (entry.value.clone(), entry.placement)
        };
        match placement {
            Placement::Root(root) => Some(root),
            Placement::Inline {
                parent,
                index,
                node,
            } => {
                let root = self.roots.len();
                self.roots.push(RootEntry {
                    value,
                    node: Some(node),
                });
                if let Some(entry) = self.seen.get_mut(identity) {
                    entry.placement = Placement::Root(root);
                }
                let reference = self.root_ref(root);
                self.set(parent, index, reference);
                debug!(root, "value promoted to root");
                Some(root)
            }
        }
    }

    /// Append a root that still has to be walked. Identity-bearing values
    /// are recorded so later references point at it.
    pub fn push_root(&mut self, value: Value) -> usize {
        let root = self.roots.len();
        if let Some(identity) = identity_of(&value, &self.config) {
            self.seen.insert(
                identity,
                SeenEntry {
                    value: value.clone(),
                    placement: Placement::Root(root),
                },
            );
        }
        self.roots.push(RootEntry { value, node: None });
        root
    }

    /// Register a root, reusing the existing index of a value already seen.
    pub fn add_root(&mut self, value: Value) -> usize {
        if let Some(identity) = identity_of(&value, &self.config) {
            if let Some(root) = self.ensure_root(&identity) {
                return root;
            }
        }
        self.push_root(value)
    }

    /// Next root that has not been walked yet.
    pub fn next_unwalked(&mut self) -> Option<usize> {
        while self.cursor < self.roots.len() {
            if self.roots[self.cursor].node.is_none() {
                return Some(self.cursor);
            }
            self.cursor += 1;
        }
        None
    }

    pub fn root_value(&self, root: usize) -> Value {
        self.roots[root].value.clone()
    }

    pub fn set_root_node(&mut self, root: usize, node: NodeId) {
        self.roots[root].node = Some(node);
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    // ---- forward references ----

    /// Forward-reference index of a pending promise, registering it on first
    /// sight.
    pub fn forward_ref(&mut self, promise: &Promise) -> usize {
        if let Some(&index) = self.forward_by_promise.get(&promise.addr()) {
            return index;
        }
        let index = self.forward_refs.len();
        self.forward_refs.push(None);
        self.forward_by_promise.insert(promise.addr(), index);
        self.pending.push((index, promise.clone()));
        index
    }

    pub fn take_pending(&mut self) -> Vec<(usize, Promise)> {
        std::mem::take(&mut self.pending)
    }

    /// Append a settled promise as a new root and point its forward
    /// reference at it.
    pub fn resolve_forward(&mut self, index: usize, promise: Promise) -> usize {
        let root = self.push_root(Value::Promise(promise));
        self.forward_refs[index] = Some(root);
        debug!(forward_ref = index, root, "forward reference resolved");
        root
    }

    // ---- rendering ----

    pub fn render(&self) -> Json {
        let mut out = Vec::with_capacity(self.roots.len() * 2 + 2);
        for root in &self.roots {
            match root.node {
                Some(node) => self.render_slot(&Slot::Node(node), &mut out),
                None => {
                    out.push(Json::from(TypeTag::Constant as u8));
                    out.push(Json::from(0));
                }
            }
        }
        if !self.forward_refs.is_empty() {
            out.push(Json::from(TypeTag::ForwardRefs as u8));
            out.push(Json::Array(
                self.forward_refs
                    .iter()
                    .map(|root| root.map_or(Json::from(-1), Json::from))
                    .collect(),
            ));
        }
        Json::Array(out)
    }

    fn render_slot(&self, slot: &Slot, out: &mut Vec<Json>) {
        match slot {
            Slot::Raw(json) => out.push(json.clone()),
            Slot::Node(node) => match &self.nodes[*node] {
                EncNode::Pair { tag, payload } => {
                    out.push(Json::from(*tag as u8));
                    out.push(match payload {
                        Payload::Scalar(json) => json.clone(),
                        Payload::Items(items) => self.render_items(items),
                    });
                }
                EncNode::List(items) => out.push(self.render_items(items)),
            },
        }
    }

    fn render_items(&self, items: &[Slot]) -> Json {
        let mut out = Vec::with_capacity(items.len() * 2);
        for slot in items {
            self.render_slot(slot, &mut out);
        }
        Json::Array(out)
    }
}

/// Identity used for deduplication, if the value has one. Strings are keyed
/// by content once they are long enough to be worth sharing.
pub(crate) fn identity_of(value: &Value, config: &SerdesConfig) -> Option<Identity> {
    match value {
        Value::String(s) if s.chars().count() >= config.min_shared_string_len => {
            Some(Identity::Str(s.clone()))
        }
        other => other.identity(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Object;

    #[test]
    fn promotion_rewrites_the_parent_slot() {
        let mut ctx = SerializationContext::new(SerdesConfig::default(), None);
        let shared = Value::Object(Object::new());
        let identity = shared.identity().unwrap();

        let parent = ctx.open(TypeTag::Array);
        let index = ctx.reserve(parent);
        let node = ctx.open(TypeTag::Object);
        ctx.set(parent, index, Slot::Node(node));
        ctx.record(identity.clone(), &shared, parent, index, node);
        let root = ctx.push_root(Value::Undefined);
        ctx.set_root_node(root, parent);

        assert_eq!(ctx.root_of(&identity), None);
        assert_eq!(ctx.ensure_root(&identity), Some(1));
        assert_eq!(ctx.root_of(&identity), Some(1));

        let rendered = ctx.render();
        assert_eq!(rendered, serde_json::json!([9, [0, 1], 10, []]));
    }

    #[test]
    fn short_strings_have_no_identity() {
        let config = SerdesConfig::default();
        assert!(identity_of(&Value::from("hello"), &config).is_none());
        assert!(identity_of(&Value::from("a long shared string"), &config).is_some());
    }

    #[test]
    fn forward_refs_are_shared_per_promise() {
        let mut ctx = SerializationContext::new(SerdesConfig::default(), None);
        let (promise, _resolver) = Promise::pending();
        assert_eq!(ctx.forward_ref(&promise), 0);
        assert_eq!(ctx.forward_ref(&promise), 0);
        assert_eq!(ctx.take_pending().len(), 1);
    }
}
