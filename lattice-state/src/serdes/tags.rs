//! Type Tags
//!
//! Every slot in the stream is a type tag followed by a payload. The tag says
//! how to read the payload; payload layouts are documented on each variant.
//! "Slot" below means a nested tag/payload pair, "raw" means a bare JSON
//! value, and "list" means a JSON array of slots.

use std::fmt;

/// Type tag of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    /// Root index.
    RootRef = 0,
    /// Index into the forward-reference table.
    ForwardRef = 1,
    /// The forward-reference table: an array of root indices. Always the
    /// last root when present.
    ForwardRefs = 2,
    /// Index into the [`Constant`] table.
    Constant = 3,
    /// A JSON number or string, as is.
    Plain = 4,
    /// Decimal digits.
    BigInt = 5,
    /// The URL text.
    Url = 6,
    /// Milliseconds since the epoch, `null` for an invalid date.
    Date = 7,
    /// `/source/flags`.
    Regex = 8,
    /// `[slot...]`
    Array = 9,
    /// `[raw key, slot, ...]`
    Object = 10,
    /// `[key slot, value slot, ...]`
    Map = 11,
    /// `[slot...]`
    Set = 12,
    /// Base64 text.
    Bytes = 13,
    /// `[raw message, raw key, slot, ...]`
    Error = 14,
    /// `[raw resolved?, slot]`
    Promise = 15,
    /// `[raw symbol, capture slot...]`
    LazyRef = 16,
    /// Host node id.
    Node = 17,
    /// `[value slot, edge slot...]`
    Signal = 18,
    /// `[qrl slot, raw flags, list edges, host slot, value slot?]`
    Computed = 19,
    /// `[target slot, raw prop, raw flags, list edges, host slot, value slot?]`
    Wrapped = 20,
    /// `[qrl slot, raw flags, raw poll ms, list value edges, list loading
    /// edges, list error edges, error slot, value slot?]`
    AsyncComputed = 21,
    /// `[target slot, raw flags, list (raw key, list edges)..., nested store slot...]`
    Store = 22,
    /// `[qrl slot, raw flags, host slot]`
    Task = 23,
    /// `[consumer slot, raw property, list producers, data slot?]`
    Subscription = 24,
}

impl TypeTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        use TypeTag::*;
        Some(match tag {
            0 => RootRef,
            1 => ForwardRef,
            2 => ForwardRefs,
            3 => Constant,
            4 => Plain,
            5 => BigInt,
            6 => Url,
            7 => Date,
            8 => Regex,
            9 => Array,
            10 => Object,
            11 => Map,
            12 => Set,
            13 => Bytes,
            14 => Error,
            15 => Promise,
            16 => LazyRef,
            17 => Node,
            18 => Signal,
            19 => Computed,
            20 => Wrapped,
            21 => AsyncComputed,
            22 => Store,
            23 => Task,
            24 => Subscription,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            TypeTag::RootRef => "RootRef",
            TypeTag::ForwardRef => "ForwardRef",
            TypeTag::ForwardRefs => "ForwardRefs",
            TypeTag::Constant => "Constant",
            TypeTag::Plain => "Plain",
            TypeTag::BigInt => "BigInt",
            TypeTag::Url => "URL",
            TypeTag::Date => "Date",
            TypeTag::Regex => "Regex",
            TypeTag::Array => "Array",
            TypeTag::Object => "Object",
            TypeTag::Map => "Map",
            TypeTag::Set => "Set",
            TypeTag::Bytes => "Bytes",
            TypeTag::Error => "Error",
            TypeTag::Promise => "Promise",
            TypeTag::LazyRef => "LazyRef",
            TypeTag::Node => "Node",
            TypeTag::Signal => "Signal",
            TypeTag::Computed => "ComputedSignal",
            TypeTag::Wrapped => "WrappedSignal",
            TypeTag::AsyncComputed => "AsyncComputed",
            TypeTag::Store => "Store",
            TypeTag::Task => "Task",
            TypeTag::Subscription => "EffectSubscription",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared constants, encoded as their index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Constant {
    Undefined = 0,
    Null = 1,
    True = 2,
    False = 3,
    EmptyString = 4,
    EmptyArray = 5,
    EmptyObject = 6,
    NaN = 7,
    PositiveInfinity = 8,
    NegativeInfinity = 9,
    MaxSafeInt = 10,
    AlmostMaxSafeInt = 11,
    MinSafeInt = 12,
    NegativeZero = 13,
}

/// Largest integer an `f64` represents exactly along with all smaller ones.
pub const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

impl Constant {
    pub fn from_u8(index: u8) -> Option<Self> {
        use Constant::*;
        Some(match index {
            0 => Undefined,
            1 => Null,
            2 => True,
            3 => False,
            4 => EmptyString,
            5 => EmptyArray,
            6 => EmptyObject,
            7 => NaN,
            8 => PositiveInfinity,
            9 => NegativeInfinity,
            10 => MaxSafeInt,
            11 => AlmostMaxSafeInt,
            12 => MinSafeInt,
            13 => NegativeZero,
            _ => return None,
        })
    }

    /// The constant for a number that has one.
    pub fn for_number(n: f64) -> Option<Self> {
        if n.is_nan() {
            Some(Constant::NaN)
        } else if n == f64::INFINITY {
            Some(Constant::PositiveInfinity)
        } else if n == f64::NEG_INFINITY {
            Some(Constant::NegativeInfinity)
        } else if n == 0.0 && n.is_sign_negative() {
            Some(Constant::NegativeZero)
        } else if n == MAX_SAFE_INTEGER {
            Some(Constant::MaxSafeInt)
        } else if n == MAX_SAFE_INTEGER - 1.0 {
            Some(Constant::AlmostMaxSafeInt)
        } else if n == -MAX_SAFE_INTEGER {
            Some(Constant::MinSafeInt)
        } else {
            None
        }
    }
}
