//! Host Nodes
//!
//! A host node stands in for a view-tree element owned by the renderer. The
//! reactive graph only needs three things from it: an identity that survives
//! serialization (its id), a dirty state, and a ledger of the edges its
//! bindings own. Each bound attribute gets its own edge, so changing the cell
//! behind `class` does not re-render `title`.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::ReactiveResult;
use crate::reactive::{
    clear_all_edges_of, clear_edge, get_or_create_edge, BackRefLedger, Consumer, EffectProperty,
    ReactiveContext,
};
use crate::value::Value;

/// Dirty state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// Every binding reflects the current state.
    Clean,

    /// A cell behind one of the bindings changed.
    Dirty,
}

type Binding = Rc<dyn Fn() -> ReactiveResult<Value>>;

struct NodeInner {
    name: Rc<str>,
    id: RefCell<Option<Rc<str>>>,
    dirty: Cell<DirtyState>,
    ledger: BackRefLedger,
    bindings: RefCell<IndexMap<EffectProperty, Binding>>,
    rendered: RefCell<IndexMap<EffectProperty, Value>>,
}

/// A view node that can consume reactive values.
#[derive(Clone)]
pub struct HostNode(Rc<NodeInner>);

impl HostNode {
    /// Create a node with no id. The container assigns one when the node
    /// needs to be referenced.
    pub fn new(name: &str) -> Self {
        Self(Rc::new(NodeInner {
            name: Rc::from(name),
            id: RefCell::new(None),
            dirty: Cell::new(DirtyState::Clean),
            ledger: BackRefLedger::new(),
            bindings: RefCell::new(IndexMap::new()),
            rendered: RefCell::new(IndexMap::new()),
        }))
    }

    pub fn name(&self) -> Rc<str> {
        self.0.name.clone()
    }

    pub fn id(&self) -> Option<Rc<str>> {
        self.0.id.borrow().clone()
    }

    pub(crate) fn set_id(&self, id: &str) {
        *self.0.id.borrow_mut() = Some(Rc::from(id));
    }

    pub fn dirty_state(&self) -> DirtyState {
        self.0.dirty.get()
    }

    pub fn is_dirty(&self) -> bool {
        self.0.dirty.get() == DirtyState::Dirty
    }

    pub(crate) fn mark_dirty(&self) {
        self.0.dirty.set(DirtyState::Dirty);
    }

    pub fn ledger(&self) -> &BackRefLedger {
        &self.0.ledger
    }

    /// Bind an attribute to a computation. The computation runs now, inside
    /// a tracking context owned by this node and attribute, and again on
    /// every [`HostNode::refresh`].
    pub fn bind<F>(&self, attr: &str, f: F) -> ReactiveResult<Value>
    where
        F: Fn() -> ReactiveResult<Value> + 'static,
    {
        self.bind_property(EffectProperty::attr(attr), Rc::new(f))
    }

    /// Bind the node's component render.
    pub fn render<F>(&self, f: F) -> ReactiveResult<Value>
    where
        F: Fn() -> ReactiveResult<Value> + 'static,
    {
        self.bind_property(EffectProperty::Component, Rc::new(f))
    }

    fn bind_property(&self, property: EffectProperty, binding: Binding) -> ReactiveResult<Value> {
        self.0
            .bindings
            .borrow_mut()
            .insert(property.clone(), binding.clone());
        self.evaluate(property, &binding)
    }

    fn evaluate(&self, property: EffectProperty, binding: &Binding) -> ReactiveResult<Value> {
        let edge = get_or_create_edge(&Consumer::Node(self.clone()), property.clone());
        clear_edge(&edge);
        let value = {
            let _ctx = ReactiveContext::enter(edge);
            binding()?
        };
        self.0.rendered.borrow_mut().insert(property, value.clone());
        Ok(value)
    }

    /// Re-run every binding and mark the node clean.
    pub fn refresh(&self) -> ReactiveResult<()> {
        let bindings: Vec<(EffectProperty, Binding)> = self
            .0
            .bindings
            .borrow()
            .iter()
            .map(|(p, b)| (p.clone(), b.clone()))
            .collect();
        for (property, binding) in bindings {
            self.evaluate(property, &binding)?;
        }
        self.0.dirty.set(DirtyState::Clean);
        Ok(())
    }

    /// The last rendered value of an attribute.
    pub fn attr(&self, name: &str) -> Option<Value> {
        self.0.rendered.borrow().get(&EffectProperty::attr(name)).cloned()
    }

    /// Drop every binding and sever all edges.
    pub fn dispose(&self) {
        self.0.bindings.borrow_mut().clear();
        clear_all_edges_of(&Consumer::Node(self.clone()));
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn ptr_eq(&self, other: &HostNode) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for HostNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostNode")
            .field("name", &self.0.name)
            .field("id", &self.id())
            .field("dirty", &self.0.dirty.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Signal;

    #[test]
    fn bindings_own_separate_edges() {
        let class = Signal::new("a");
        let title = Signal::new("t");
        let node = HostNode::new("div");

        let c = class.clone();
        node.bind("class", move || Ok(c.value())).unwrap();
        let t = title.clone();
        node.bind("title", move || Ok(t.value())).unwrap();

        assert_eq!(node.ledger().len(), 2);
        assert_eq!(class.subscriber_count(), 1);
        assert_eq!(title.subscriber_count(), 1);
    }

    #[test]
    fn write_marks_node_dirty_and_refresh_rerenders() {
        let class = Signal::new("a");
        let node = HostNode::new("div");
        let c = class.clone();
        node.bind("class", move || Ok(c.value())).unwrap();
        assert!(!node.is_dirty());

        class.set("b");
        assert_eq!(node.dirty_state(), DirtyState::Dirty);

        node.refresh().unwrap();
        assert!(!node.is_dirty());
        assert_eq!(node.attr("class").unwrap().as_str(), Some("b"));
    }

    #[test]
    fn dispose_severs_edges() {
        let class = Signal::new("a");
        let node = HostNode::new("div");
        let c = class.clone();
        node.bind("class", move || Ok(c.value())).unwrap();
        node.dispose();
        node.dispose();
        assert_eq!(class.subscriber_count(), 0);
    }
}
