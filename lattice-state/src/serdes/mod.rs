//! Resumable Serialization
//!
//! Turns a live reactive graph into text and back, so that state built on
//! one side (a server render) can resume on the other without re-running
//! anything that already ran.
//!
//! # Wire Format
//!
//! The stream is a JSON array of `tag, payload` pairs, one pair per root.
//! Payloads of composite values nest further pairs. See [`TypeTag`] for the
//! payload layout of each tag.
//!
//! - A value referenced from more than one place is written once as a root
//!   and referenced by index everywhere else.
//! - Cycles are broken the same way.
//! - Promises still pending when reached are written as forward references.
//!   Their settled values are appended as roots, and the last root is a
//!   table mapping forward references to root indices.
//!
//! # Resuming
//!
//! [`deserialize`] returns a [`LazyRoots`] accessor. Each root is decoded on
//! first access, which rebuilds cells, stores and tasks with their
//! subscriptions linked in both directions, ready to propagate writes.

mod config;
mod context;
mod deserializer;
mod dump;
mod inflate;
mod serializer;
mod tags;

pub use config::SerdesConfig;
pub use deserializer::{deserialize, deserialize_with, DeserializeOptions, LazyRoots};
pub use dump::dump_state;
pub use serializer::{serialize, Serializer};
pub use tags::{Constant, TypeTag};
