//! Container
//!
//! The reactive graph hands work to a container and asks it for host node
//! ids. This module provides host nodes and an in-process container.
//!
//! # Overview
//!
//! - [`HostNode`] is a view node that consumes cells through attribute
//!   bindings.
//! - [`LocalContainer`] queues chores, runs them on `flush`, and keeps the
//!   node registry used to resolve node references on resume.
//!
//! Renderers that own a real view tree implement
//! [`Container`](crate::reactive::Container) themselves.

mod node;
mod scheduler;

pub use node::{DirtyState, HostNode};
pub use scheduler::LocalContainer;
