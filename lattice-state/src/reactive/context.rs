//! Reactive Context
//!
//! The reactive context tracks which edge is currently collecting
//! dependencies. When a cell is read, it asks the context for the active edge
//! and, if there is one, subscribes that edge to itself.
//!
//! # Implementation
//!
//! We use a thread-local stack of frames. Entering a consumer (running a task,
//! recomputing a derived cell, rendering a host node attribute) pushes the
//! consumer's edge for that property. Entering an untracked scope pushes an
//! empty frame, which hides any outer edge. Frames are popped by a drop guard
//! so the stack stays balanced even when a computation returns early with an
//! error.
//!
//! Nested frames are how a derived cell that reads another derived cell
//! records its own dependencies without leaking them to the outer consumer.

use std::cell::RefCell;

use super::EffectSubscription;
use crate::error::{ReactiveError, ReactiveResult};
use crate::value::Value;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Option<EffectSubscription>>> = const { RefCell::new(Vec::new()) };
}

/// Guard that pops the context when dropped.
pub struct ReactiveContext {
    edge: Option<EffectSubscription>,
}

impl ReactiveContext {
    /// Enter a tracking context. Reads made until the guard drops subscribe
    /// `edge`.
    pub fn enter(edge: EffectSubscription) -> Self {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(Some(edge.clone())));
        Self { edge: Some(edge) }
    }

    /// Enter a scope where reads are not tracked.
    pub fn enter_untracked() -> Self {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(None));
        Self { edge: None }
    }

    /// Whether reads right now would be tracked.
    pub fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| matches!(stack.borrow().last(), Some(Some(_))))
    }

    /// The edge collecting dependencies, if any.
    pub fn current_subscription() -> Option<EffectSubscription> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().cloned().flatten())
    }

    pub fn depth() -> usize {
        CONTEXT_STACK.with(|stack| stack.borrow().len())
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert!(
                matches!((&popped, &self.edge), (Some(Some(a)), Some(b)) if a == b)
                    || matches!((&popped, &self.edge), (Some(None), None)),
                "ReactiveContext mismatch: expected {:?}, got {:?}",
                self.edge,
                popped
            );
        });
    }
}

/// Run `f` without tracking any reads.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _ctx = ReactiveContext::enter_untracked();
    f()
}

/// Read `value` with tracking.
///
/// Cells are read and their current value returned. A store with a key
/// subscribes to that key and returns the property; a store without a key
/// subscribes to every key and returns the store. Plain objects and arrays
/// need a key and return the property without tracking.
pub fn track(value: &Value, key: Option<&str>) -> ReactiveResult<Value> {
    match (value, key) {
        (Value::Signal(_), _)
        | (Value::Computed(_), _)
        | (Value::Wrapped(_), _)
        | (Value::AsyncComputed(_), _) => value.read(),
        (Value::Store(store), Some(key)) => Ok(store.get(key)),
        (Value::Store(store), None) => {
            store.keys();
            Ok(value.clone())
        }
        (Value::Object(_) | Value::Array(_), Some(key)) => value.get_property(key),
        (other, _) => Err(ReactiveError::TrackWithoutKey(other.type_name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{get_or_create_edge, Consumer, EffectProperty, Task};
    use crate::value::LazyRef;

    fn edge() -> EffectSubscription {
        let task = Task::new(LazyRef::new("noop", |_| Ok(Value::Undefined)));
        get_or_create_edge(&Consumer::Task(task), EffectProperty::Value)
    }

    #[test]
    fn context_tracks_edge() {
        let e = edge();

        assert!(!ReactiveContext::is_active());
        assert!(ReactiveContext::current_subscription().is_none());

        {
            let _ctx = ReactiveContext::enter(e.clone());

            assert!(ReactiveContext::is_active());
            assert_eq!(ReactiveContext::current_subscription(), Some(e.clone()));
        }

        // Context should be cleaned up after drop
        assert!(!ReactiveContext::is_active());
        assert!(ReactiveContext::current_subscription().is_none());
    }

    #[test]
    fn nested_contexts() {
        let e1 = edge();
        let e2 = edge();

        {
            let _ctx1 = ReactiveContext::enter(e1.clone());
            assert_eq!(ReactiveContext::current_subscription(), Some(e1.clone()));

            {
                let _ctx2 = ReactiveContext::enter(e2.clone());
                assert_eq!(ReactiveContext::current_subscription(), Some(e2));
            }

            // After inner context drops, outer should be current
            assert_eq!(ReactiveContext::current_subscription(), Some(e1));
        }

        assert!(ReactiveContext::current_subscription().is_none());
    }

    #[test]
    fn untracked_hides_outer_edge() {
        let _ctx = ReactiveContext::enter(edge());
        assert!(untracked(|| !ReactiveContext::is_active()));
        assert!(ReactiveContext::is_active());
    }

    #[test]
    fn track_plain_value_without_key_fails() {
        let err = track(&Value::from(3), None).unwrap_err();
        assert!(matches!(err, ReactiveError::TrackWithoutKey("number")));

        let obj = Value::from(crate::value::Object::new().with("a", 1));
        assert_eq!(track(&obj, Some("a")).unwrap().as_number(), Some(1.0));
        assert!(track(&obj, None).is_err());
    }
}
