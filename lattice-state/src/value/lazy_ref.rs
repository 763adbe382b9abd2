//! Lazy References
//!
//! Computations, tasks and derived cells do not hold closures directly: they
//! hold a lazy reference, an opaque handle made of a symbol and the values it
//! captured. The symbol is what gets serialized. On resume, a
//! [`SymbolResolver`] turns the symbol back into a function the first time the
//! reference is called.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::Value;
use crate::error::{ReactiveError, ReactiveResult};

/// The function behind a lazy reference. Receives the captured values.
pub type LazyFn = Rc<dyn Fn(&[Value]) -> ReactiveResult<Value>>;

/// Resolves symbols to functions on resume.
pub trait SymbolResolver {
    fn resolve(&self, symbol: &str) -> Option<LazyFn>;
}

struct LazyRefInner {
    symbol: RefCell<Rc<str>>,
    captures: RefCell<Vec<Value>>,
    resolved: RefCell<Option<LazyFn>>,
    resolver: RefCell<Option<Rc<dyn SymbolResolver>>>,
}

/// A serializable, lazily resolved function handle.
#[derive(Clone)]
pub struct LazyRef(Rc<LazyRefInner>);

impl LazyRef {
    /// A reference whose function is already known.
    pub fn new<F>(symbol: &str, f: F) -> Self
    where
        F: Fn(&[Value]) -> ReactiveResult<Value> + 'static,
    {
        Self(Rc::new(LazyRefInner {
            symbol: RefCell::new(Rc::from(symbol)),
            captures: RefCell::new(Vec::new()),
            resolved: RefCell::new(Some(Rc::new(f))),
            resolver: RefCell::new(None),
        }))
    }

    /// A reference that resolves through `resolver` on first call.
    pub fn unresolved(symbol: &str, resolver: Option<Rc<dyn SymbolResolver>>) -> Self {
        Self(Rc::new(LazyRefInner {
            symbol: RefCell::new(Rc::from(symbol)),
            captures: RefCell::new(Vec::new()),
            resolved: RefCell::new(None),
            resolver: RefCell::new(resolver),
        }))
    }

    /// Attach captured values.
    pub fn with_captures(self, captures: Vec<Value>) -> Self {
        *self.0.captures.borrow_mut() = captures;
        self
    }

    pub fn symbol(&self) -> Rc<str> {
        self.0.symbol.borrow().clone()
    }

    pub fn captures(&self) -> Vec<Value> {
        self.0.captures.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.0.resolved.borrow().is_some()
    }

    pub(crate) fn fill(&self, symbol: Rc<str>, captures: Vec<Value>) {
        *self.0.symbol.borrow_mut() = symbol;
        *self.0.captures.borrow_mut() = captures;
    }

    /// Resolve the function, consulting the resolver if needed.
    pub fn resolve(&self) -> ReactiveResult<LazyFn> {
        if let Some(f) = self.0.resolved.borrow().as_ref() {
            return Ok(f.clone());
        }
        let symbol = self.symbol();
        let resolved = self
            .0
            .resolver
            .borrow()
            .as_ref()
            .and_then(|resolver| resolver.resolve(&symbol))
            .ok_or(ReactiveError::UnresolvedSymbol(symbol))?;
        *self.0.resolved.borrow_mut() = Some(resolved.clone());
        Ok(resolved)
    }

    /// Resolve and invoke with the captured values.
    pub fn call(&self) -> ReactiveResult<Value> {
        let f = self.resolve()?;
        let captures = self.captures();
        f(&captures)
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
}

impl fmt::Debug for LazyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyRef")
            .field("symbol", &self.symbol())
            .field("captures", &self.0.captures.borrow().len())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Table(HashMap<&'static str, LazyFn>);

    impl SymbolResolver for Table {
        fn resolve(&self, symbol: &str) -> Option<LazyFn> {
            self.0.get(symbol).cloned()
        }
    }

    #[test]
    fn call_passes_captures() {
        let add = LazyRef::new("add", |caps| {
            let a = caps[0].as_number().unwrap_or(0.0);
            let b = caps[1].as_number().unwrap_or(0.0);
            Ok(Value::from(a + b))
        })
        .with_captures(vec![Value::from(2), Value::from(3)]);
        assert_eq!(add.call().unwrap().as_number(), Some(5.0));
    }

    #[test]
    fn unresolved_reference_uses_resolver_once() {
        let mut table = HashMap::new();
        let f: LazyFn = Rc::new(|_| Ok(Value::from("hi")));
        table.insert("greet", f);
        let resolver: Rc<dyn SymbolResolver> = Rc::new(Table(table));

        let lazy = LazyRef::unresolved("greet", Some(resolver));
        assert!(!lazy.is_resolved());
        assert_eq!(lazy.call().unwrap().as_str(), Some("hi"));
        assert!(lazy.is_resolved());
    }

    #[test]
    fn missing_symbol_is_an_error() {
        let lazy = LazyRef::unresolved("nowhere", None);
        assert!(matches!(lazy.call(), Err(ReactiveError::UnresolvedSymbol(s)) if &*s == "nowhere"));
    }
}
