//! Deserializer
//!
//! Parses the wire text into raw root entries and hands out a [`LazyRoots`]
//! accessor. A root stays raw until it is read, directly or through a
//! reference from another root. A referenced array or object root is handed
//! out as an empty shell and fills itself the first time it is touched.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde_json::Value as Json;
use tracing::{debug, error};

use super::inflate::{allocate, inflate, parse_tag};
use super::tags::TypeTag;
use crate::error::{DeserializeError, DeserializeResult};
use crate::reactive::ContainerRef;
use crate::value::{SymbolResolver, Value, WeakShell};

/// Collaborators used while decoding.
#[derive(Clone, Default)]
pub struct DeserializeOptions {
    /// Resolves host node ids and is attached to every decoded cell.
    pub container: Option<ContainerRef>,
    /// Turns lazy-reference symbols back into functions.
    pub resolver: Option<Rc<dyn SymbolResolver>>,
}

#[derive(Clone)]
enum RootState {
    Raw,
    /// Allocation in progress. Seeing this again means a reference loop
    /// with no shell to break it.
    Allocating,
    /// Array or object shell handed out; filled when first touched.
    Deferred(WeakShell),
    /// Shell handed out, waiting in the fill queue.
    Queued(Value),
    /// Contents are being filled in.
    Filling(Value),
    Ready(Value),
    Failed(Rc<str>),
}

/// Decoding state shared by the accessor and the deferred fills it hands out.
pub(crate) struct Roots {
    raw: Vec<(TypeTag, Json)>,
    states: RefCell<Vec<RootState>>,
    queue: RefCell<VecDeque<usize>>,
    forward_refs: Vec<Option<usize>>,
    options: DeserializeOptions,
}

impl Roots {
    fn state(&self, index: usize) -> DeserializeResult<RootState> {
        self.states
            .borrow()
            .get(index)
            .cloned()
            .ok_or(DeserializeError::RootOutOfRange {
                index,
                len: self.raw.len(),
            })
    }

    fn set_state(&self, index: usize, state: RootState) {
        self.states.borrow_mut()[index] = state;
    }

    pub(crate) fn options(&self) -> &DeserializeOptions {
        &self.options
    }

    /// The shell of root `index`, allocating it if needed. Never fills it.
    ///
    /// Array and object roots fill themselves on first touch. Other roots
    /// are queued and filled before the current [`LazyRoots::get`] returns.
    pub(crate) fn resolve(self: &Rc<Self>, index: usize) -> DeserializeResult<Value> {
        match self.state(index)? {
            RootState::Queued(value) | RootState::Filling(value) | RootState::Ready(value) => {
                return Ok(value)
            }
            RootState::Deferred(shell) => {
                if let Some(value) = shell.upgrade() {
                    return Ok(value);
                }
                // Nobody kept the shell, so a fresh one is indistinguishable.
            }
            RootState::Allocating => {
                return Err(DeserializeError::malformed(format!(
                    "root {index} refers to itself through references only"
                )))
            }
            RootState::Failed(reason) => {
                return Err(DeserializeError::malformed(format!(
                    "root {index} failed to decode: {reason}"
                )))
            }
            RootState::Raw => {}
        }

        let (tag, payload) = &self.raw[index];
        self.set_state(index, RootState::Allocating);
        let shell = match allocate(self, *tag, payload) {
            Ok(shell) => shell,
            Err(err) => {
                self.set_state(index, RootState::Failed(Rc::from(err.to_string())));
                return Err(err);
            }
        };
        debug!(index, tag = %tag, "root allocated");

        let deferred = if matches!(tag, TypeTag::Array | TypeTag::Object) {
            let roots = Rc::clone(self);
            shell.defer_fill(Box::new(move || roots.fill_deferred(index)))
        } else {
            None
        };
        match deferred {
            Some(weak) => self.set_state(index, RootState::Deferred(weak)),
            None => {
                self.set_state(index, RootState::Queued(shell.clone()));
                self.queue.borrow_mut().push_back(index);
            }
        }
        Ok(shell)
    }

    pub(crate) fn forward(self: &Rc<Self>, forward_ref: usize) -> DeserializeResult<Value> {
        let root = self
            .forward_refs
            .get(forward_ref)
            .copied()
            .flatten()
            .ok_or(DeserializeError::UnknownForwardRef(forward_ref))?;
        self.resolve(root)
    }

    fn get(self: &Rc<Self>, index: usize) -> DeserializeResult<Value> {
        let shell = self.resolve(index)?;
        match self.state(index)? {
            RootState::Deferred(_) => {
                shell.cancel_fill();
                self.fill(index, &shell)?;
            }
            RootState::Queued(_) => self.fill(index, &shell)?,
            _ => {}
        }
        self.drain()?;
        Ok(shell)
    }

    fn fill(self: &Rc<Self>, index: usize, shell: &Value) -> DeserializeResult<()> {
        self.set_state(index, RootState::Filling(shell.clone()));
        let (tag, payload) = &self.raw[index];
        match inflate(self, shell, *tag, payload) {
            Ok(()) => {
                self.set_state(index, RootState::Ready(shell.clone()));
                Ok(())
            }
            Err(err) => {
                self.set_state(index, RootState::Failed(Rc::from(err.to_string())));
                Err(err)
            }
        }
    }

    /// Fill queued roots until none are left. Each fill may queue more.
    fn drain(self: &Rc<Self>) -> DeserializeResult<()> {
        loop {
            let next = self.queue.borrow_mut().pop_front();
            let Some(index) = next else {
                return Ok(());
            };
            if let RootState::Queued(shell) = self.state(index)? {
                self.fill(index, &shell)?;
            }
        }
    }

    /// Runs from inside the shell's own accessor, which already took the
    /// pending fill.
    fn fill_deferred(self: &Rc<Self>, index: usize) {
        let Ok(RootState::Deferred(weak)) = self.state(index) else {
            return;
        };
        let Some(shell) = weak.upgrade() else {
            return;
        };
        if let Err(err) = self.fill(index, &shell).and_then(|()| self.drain()) {
            error!(index, %err, "deferred root failed to decode");
        }
    }

    /// Fill every deferred shell that is still alive. Filling one may hand
    /// out more, so repeat until a pass finds none.
    fn finish(&self) {
        for _ in 0..=self.raw.len() {
            let pending: Vec<Value> = self
                .states
                .borrow()
                .iter()
                .filter_map(|state| match state {
                    RootState::Deferred(shell) => shell.upgrade(),
                    _ => None,
                })
                .collect();
            if pending.is_empty() {
                return;
            }
            for shell in pending {
                shell.run_pending_fill();
            }
        }
    }
}

/// Root accessor over a decoded stream.
///
/// Dropping the accessor fills any array or object root that was handed out
/// through a reference but never touched, so values kept by the caller stay
/// complete.
pub struct LazyRoots {
    roots: Rc<Roots>,
}

impl LazyRoots {
    /// Number of roots, not counting the forward-reference table.
    pub fn len(&self) -> usize {
        self.roots.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.raw.is_empty()
    }

    /// Whether root `index` has been decoded, or is being decoded.
    pub fn is_materialized(&self, index: usize) -> bool {
        matches!(
            self.roots.states.borrow().get(index),
            Some(RootState::Queued(_) | RootState::Filling(_) | RootState::Ready(_))
        )
    }

    /// Decode root `index` on first access and return it.
    ///
    /// Roots it refers to come back as shells. Arrays and objects among them
    /// are decoded when first touched; the rest are decoded before this
    /// returns, one at a time, so reference chains of any length decode
    /// without recursion.
    pub fn get(&self, index: usize) -> DeserializeResult<Value> {
        self.roots.get(index)
    }

    /// Decode every root.
    pub fn to_vec(&self) -> DeserializeResult<Vec<Value>> {
        (0..self.len()).map(|index| self.get(index)).collect()
    }

    pub fn options(&self) -> &DeserializeOptions {
        self.roots.options()
    }
}

impl Drop for LazyRoots {
    fn drop(&mut self) {
        // Deferred fills point back at the shared state; running them breaks
        // that cycle.
        self.roots.finish();
    }
}

/// Parse `text` with no container and no resolver.
pub fn deserialize(text: &str) -> DeserializeResult<LazyRoots> {
    deserialize_with(text, DeserializeOptions::default())
}

pub fn deserialize_with(text: &str, options: DeserializeOptions) -> DeserializeResult<LazyRoots> {
    let parsed: Json = serde_json::from_str(text)?;
    let Json::Array(items) = parsed else {
        return Err(DeserializeError::malformed("stream is not an array"));
    };
    if items.len() % 2 != 0 {
        return Err(DeserializeError::malformed("stream has an odd number of entries"));
    }

    let mut raw = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(tag), Some(payload)) = (iter.next(), iter.next()) {
        raw.push((parse_tag(&tag)?, payload));
    }

    let mut forward_refs = Vec::new();
    if let Some((TypeTag::ForwardRefs, _)) = raw.last() {
        if let Some((_, table)) = raw.pop() {
            let entries = table
                .as_array()
                .ok_or_else(|| DeserializeError::malformed("forward-reference table is not an array"))?;
            forward_refs = entries
                .iter()
                .map(|entry| entry.as_u64().map(|root| root as usize))
                .collect();
        }
    }
    if let Some(position) = raw.iter().position(|(tag, _)| *tag == TypeTag::ForwardRefs) {
        return Err(DeserializeError::malformed(format!(
            "forward-reference table at root {position} is not last"
        )));
    }

    debug!(roots = raw.len(), forward_refs = forward_refs.len(), "stream parsed");
    let states = RefCell::new(vec![RootState::Raw; raw.len()]);
    Ok(LazyRoots {
        roots: Rc::new(Roots {
            raw,
            states,
            queue: RefCell::new(VecDeque::new()),
            forward_refs,
            options,
        }),
    })
}
