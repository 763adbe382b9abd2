//! Error types for the reactive graph and the resumable codec.
//!
//! Errors are split by the pass that produces them. Reactive errors are
//! recoverable at the call site; serialization and deserialization errors abort
//! the whole pass, and no partial output is considered valid.

use std::rc::Rc;

use thiserror::Error;

use crate::value::{Promise, Value};

/// Errors raised while reading or writing reactive state.
#[derive(Error, Debug)]
pub enum ReactiveError {
    /// A synchronous computed returned a promise instead of a value.
    #[error("computed function returned a promise; use an async computed for asynchronous work")]
    PromiseInSyncComputed,

    /// Attempted to write to a derived cell.
    #[error("cannot write to read-only {0}")]
    ReadOnly(&'static str),

    /// Attempted to write to a store created with the immutable flag.
    #[error("store is immutable; cannot write key `{0}`")]
    ImmutableStore(Rc<str>),

    /// `track` was given a plain value and no property key.
    #[error("cannot track a plain {0} without a property key")]
    TrackWithoutKey(&'static str),

    /// A store can only wrap plain objects and arrays.
    #[error("store target must be an object or an array, got {0}")]
    InvalidStoreTarget(&'static str),

    /// A key written to an array store is not a canonical index below
    /// 2^32 - 1.
    #[error("`{0}` is not a valid array index")]
    InvalidArrayIndex(Rc<str>),

    /// An array length that is not an integer in `0..=2^32 - 1`, or one that
    /// could not be allocated.
    #[error("invalid array length {0}")]
    InvalidArrayLength(f64),

    /// A lazy reference could not be resolved to a function.
    #[error("lazy reference `{0}` could not be resolved")]
    UnresolvedSymbol(Rc<str>),

    /// A derived cell read itself while computing.
    #[error("derived cell read its own value while computing")]
    CircularComputation,

    /// Attempted to run a task after it was disposed.
    #[error("task was disposed")]
    Disposed,

    /// Application code inside a computation threw.
    #[error("computation threw: {0:?}")]
    Thrown(Value),

    /// The value is not available yet. Await the promise and retry the read.
    #[error("value is still loading")]
    Suspended(Promise),
}

impl ReactiveError {
    /// Wrap an application-level error value.
    pub fn thrown(value: impl Into<Value>) -> Self {
        Self::Thrown(value.into())
    }

    /// Convert the error into the value observed on an async cell's `error`
    /// state.
    pub(crate) fn into_value(self) -> Value {
        match self {
            Self::Thrown(value) => value,
            other => Value::Error(crate::value::ErrorValue::new(other.to_string())),
        }
    }
}

/// Errors that abort a serialization pass.
#[derive(Error, Debug)]
pub enum SerializeError {
    /// The graph contains a value with no wire representation.
    #[error("cannot serialize {0}")]
    Unserializable(&'static str),

    /// A late lookup asked for the root index of a value that never became a
    /// root.
    #[error("value was not serialized as a root")]
    MissingRootId,

    /// A pending operation was dropped without settling.
    #[error("pending operation for forward reference {forward_ref} was abandoned before it settled")]
    AbandonedPromise {
        /// Index into the forward-reference table.
        forward_ref: usize,
    },

    /// A host node without an id was reached and no container can allocate one.
    #[error("host node `{0}` has no id and no container was configured")]
    MissingContainer(Rc<str>),

    /// An edge without a consumer was reached.
    #[error("effect subscription has no consumer")]
    DetachedSubscription,

    /// Writing the wire text failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that abort a deserialization pass.
#[derive(Error, Debug)]
pub enum DeserializeError {
    /// The stream is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The stream parsed but does not have the expected shape.
    #[error("malformed stream: {0}")]
    Malformed(String),

    /// A type tag outside the known vocabulary.
    #[error("unknown type tag {0}")]
    UnknownTag(u64),

    /// A back-reference pointed past the end of the root list.
    #[error("root index {index} out of range ({len} roots)")]
    RootOutOfRange {
        /// The requested root.
        index: usize,
        /// Number of roots in the stream.
        len: usize,
    },

    /// A forward reference with no entry in the forward-reference table.
    #[error("unknown forward reference {0}")]
    UnknownForwardRef(usize),

    /// A host node id the container does not know.
    #[error("unknown host node `{0}`")]
    UnknownNode(String),

    /// Flag bits that are reserved and not yet specified.
    #[error("reserved flag bits set: {0:#04x}")]
    ReservedFlags(u8),
}

impl DeserializeError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }
}

/// Result type for reactive operations.
pub type ReactiveResult<T> = std::result::Result<T, ReactiveError>;

/// Result type for serialization.
pub type SerializeResult<T> = std::result::Result<T, SerializeError>;

/// Result type for deserialization.
pub type DeserializeResult<T> = std::result::Result<T, DeserializeError>;
