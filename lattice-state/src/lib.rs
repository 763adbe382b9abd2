//! Lattice State
//!
//! This crate provides reactive state for the Lattice UI framework and a
//! resumable serializer for it. It implements:
//!
//! - Reactive primitives (signals, derived cells, async derived cells,
//!   keyed stores, tasks)
//! - Symmetric subscription edges with explicit, idempotent teardown
//! - A local container that schedules chores and allocates host node ids
//! - Graph serialization that preserves identity, cycles and subscriptions,
//!   and a lazy decoder that resumes the graph
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `value`: The dynamic value model shared by cells and the codec
//! - `reactive`: Reactive primitives and dependency tracking
//! - `container`: Host nodes and the in-process scheduler
//! - `serdes`: Wire format encoder and decoder
//! - `error`: Error types
//!
//! # Example
//!
//! ```rust
//! use lattice_state::reactive::{ComputedSignal, Signal};
//! use lattice_state::value::{LazyRef, Value};
//!
//! // Create a signal
//! let count = Signal::new(2);
//!
//! // Create a derived value
//! let c = count.clone();
//! let doubled = ComputedSignal::new(LazyRef::new("doubled", move |_| {
//!     Ok(Value::from(c.value().as_number().unwrap_or(0.0) * 2.0))
//! }));
//! assert_eq!(doubled.value().unwrap().as_number(), Some(4.0));
//!
//! // Update the signal; the derived value recomputes on its next read
//! count.set(5);
//! assert_eq!(doubled.value().unwrap().as_number(), Some(10.0));
//! ```

pub mod container;
pub mod error;
pub mod reactive;
pub mod serdes;
pub mod value;

pub use error::{DeserializeError, ReactiveError, SerializeError};
pub use reactive::{AsyncComputed, ComputedSignal, Signal, Store, Task, WrappedSignal};
pub use serdes::{deserialize, serialize, LazyRoots, Serializer};
pub use value::Value;
