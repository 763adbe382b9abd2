//! Reactive Primitives
//!
//! This module implements the reactive graph: cells, derived cells, stores,
//! tasks, and the edges between them. These primitives are what the
//! resumable serializer walks and rebuilds.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A [`Signal`] is a container for mutable state. When it is read within a
//! tracking context, the context's edge is subscribed to it. When it is
//! written with a different value, every subscribed edge is triggered.
//!
//! ## Derived cells
//!
//! A [`ComputedSignal`] caches a value computed from other cells and
//! recomputes lazily after an input changes. A [`WrappedSignal`] forwards a
//! single property of another value. An [`AsyncComputed`] runs computations
//! that return promises and exposes `value`, `loading` and `error`
//! separately.
//!
//! ## Stores
//!
//! A [`Store`] wraps a plain object or array and tracks effects per key.
//!
//! ## Tasks
//!
//! A [`Task`] is a side-effecting consumer that re-runs when its inputs
//! change. Host nodes (see [`crate::container`]) are consumers too.
//!
//! ## Edges
//!
//! Every consumer owns one [`EffectSubscription`] per property it tracks.
//! Edges are doubly linked: producers keep the edge in their effect sets and
//! the edge keeps its producers, so teardown never scans the graph.
//! Teardown is always explicit: [`clear_edge`] and [`clear_all_edges_of`].
//!
//! # Implementation Notes
//!
//! The graph is single-threaded. Handles are `Rc` based and interior
//! mutability uses `RefCell`/`Cell`. A thread-local tracking context stack
//! provides automatic dependency capture.

mod async_computed;
mod computed;
mod context;
mod local;
mod runtime;
mod signal;
mod store;
mod subscriber;
mod subscription;
mod task;

pub use async_computed::AsyncComputed;
pub use computed::{flags, ComputedSignal, SerializationStrategy, WrappedSignal};
pub use context::{track, untracked, ReactiveContext};
pub use local::{in_local_scope, run_local};
pub use runtime::{ChoreKind, Container, ContainerRef, SchedulePass};
pub use signal::{ReactiveCell, Signal};
pub use store::{Store, StoreFlags, StoreKey};
pub use subscriber::{CellId, Consumer, EffectProperty, Producer};
pub use subscription::{
    clear_all_edges_of, clear_edge, get_or_create_edge, is_symmetric, producer_is_symmetric,
    BackRefLedger, EffectSet, EffectSubscription,
};
pub use task::{task_flags, Task};

pub(crate) use subscription::subscribe;
