//! Round-trip tests for the resumable serializer.
//!
//! Each test builds a graph, serializes it, decodes it and checks that
//! values, identity, cycles and subscriptions came back.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use lattice_state::container::{HostNode, LocalContainer};
use lattice_state::error::{DeserializeError, SerializeError};
use lattice_state::reactive::{
    is_symmetric, producer_is_symmetric, AsyncComputed, ComputedSignal, Consumer, ContainerRef,
    Producer, SerializationStrategy, Signal, Store, StoreFlags, StoreKey, Task,
};
use lattice_state::serdes::{
    deserialize, deserialize_with, dump_state, serialize, DeserializeOptions, SerdesConfig,
    Serializer,
};
use lattice_state::value::{
    Bytes, CustomValue, Date, ErrorValue, LazyFn, LazyRef, MapValue, Object, Promise, Regex,
    SetValue, SymbolResolver, Url, Value,
};

struct Symbols(HashMap<&'static str, LazyFn>);

impl SymbolResolver for Symbols {
    fn resolve(&self, symbol: &str) -> Option<LazyFn> {
        self.0.get(symbol).cloned()
    }
}

fn symbols(entries: Vec<(&'static str, LazyFn)>) -> Rc<dyn SymbolResolver> {
    Rc::new(Symbols(entries.into_iter().collect()))
}

fn double(captures: &[Value]) -> lattice_state::error::ReactiveResult<Value> {
    let n = captures[0].read()?.as_number().unwrap_or(0.0);
    Ok(Value::from(n * 2.0))
}

async fn round_trip(value: &Value) -> Value {
    let text = serialize(&[value.clone()]).await.unwrap();
    deserialize(&text).unwrap().get(0).unwrap()
}

/// Test that primitives are inlined and come back unchanged.
#[tokio::test]
async fn primitives_round_trip() {
    let value = Value::from(vec![Value::from(0), Value::Null, Value::from("hello")]);
    let text = serialize(&[value.clone()]).await.unwrap();
    assert_eq!(text, r#"[9,[4,0,3,1,4,"hello"]]"#);

    let decoded = deserialize(&text).unwrap().get(0).unwrap();
    assert!(decoded.deep_eq(&value));
}

/// Test that every composite kind survives a round trip.
#[tokio::test]
async fn rich_values_round_trip() {
    let error = ErrorValue::new("boom");
    error.props().insert("code", Value::from(7));
    let map = MapValue::new();
    map.insert(Value::from("k"), Value::from(1));
    let set = SetValue::new();
    set.insert(Value::from(2));

    let value = Value::from(vec![
        Value::from(Date::new(1_700_000_000_000.0)),
        Value::from(Date::new(f64::NAN)),
        Value::from(Regex::new("a+/b", "gi")),
        Value::from(Url::new("https://example.com/x?y=1")),
        Value::from(map),
        Value::from(set),
        Value::from(Bytes::new(vec![0, 1, 255])),
        Value::BigInt(Rc::from("123456789012345678901234567890")),
        Value::from(error),
        Value::from(f64::NAN),
        Value::from(2f64.powi(60)),
        Value::from(9_007_199_254_740_991.0),
        Value::from(""),
    ]);
    let decoded = round_trip(&value).await;
    assert!(decoded.deep_eq(&value));
}

/// Test that negative zero keeps its sign.
#[tokio::test]
async fn negative_zero_keeps_its_sign() {
    let decoded = round_trip(&Value::from(-0.0)).await;
    let n = decoded.as_number().unwrap();
    assert_eq!(n, 0.0);
    assert!(n.is_sign_negative());
}

/// Test that two references to one object decode to one object.
#[tokio::test]
async fn shared_object_keeps_identity() {
    let shared = Value::from(Object::new().with("n", 1));
    let value = Value::from(vec![shared.clone(), shared]);
    let decoded = round_trip(&value).await;

    let array = decoded.as_array().unwrap();
    assert!(array.get(0).unwrap().is_identical(&array.get(1).unwrap()));
    assert!(decoded.deep_eq(&value));
}

/// Test that identity is preserved across separate roots.
#[tokio::test]
async fn roots_share_a_child() {
    let shared = Value::from(Object::new().with("n", 1));
    let x = Value::from(Object::new().with("a", shared.clone()));
    let y = Value::from(Object::new().with("b", shared));

    let text = serialize(&[x, y]).await.unwrap();
    let roots = deserialize(&text).unwrap();
    let a = roots.get(0).unwrap().get_property("a").unwrap();
    let b = roots.get(1).unwrap().get_property("b").unwrap();
    assert!(a.is_identical(&b));
}

/// Test that a self-referencing object decodes to the same cycle.
#[tokio::test]
async fn self_cycle_round_trip() {
    let object = Object::new();
    object.insert("self", Value::from(object.clone()));
    let decoded = round_trip(&Value::from(object)).await;
    assert!(decoded.get_property("self").unwrap().is_identical(&decoded));
}

/// Test that a mutually-referencing pair decodes to the same cycle.
#[tokio::test]
async fn mutual_cycle_round_trip() {
    let a = Object::new();
    let b = Object::new();
    a.insert("b", Value::from(b.clone()));
    b.insert("a", Value::from(a.clone()));

    let decoded = round_trip(&Value::from(a)).await;
    let back = decoded.get_property("b").unwrap().get_property("a").unwrap();
    assert!(back.is_identical(&decoded));
}

/// Test that short strings are repeated rather than referenced.
#[tokio::test]
async fn short_strings_are_not_deduplicated() {
    let text = serialize(&[Value::from(vec!["abc", "abc"])]).await.unwrap();
    assert_eq!(text.matches("\"abc\"").count(), 2);

    let long = "a string that is long enough to share";
    let text = serialize(&[Value::from(vec![long, long])]).await.unwrap();
    assert_eq!(text.matches(long).count(), 1);
}

/// Test that a custom value is written as its converted form.
#[tokio::test]
async fn custom_value_is_converted_in_place() {
    let custom = CustomValue::new(|| Value::from(Object::new().with("kind", "point")));
    let decoded = round_trip(&Value::from(vec![Value::from(custom)])).await;
    let first = decoded.as_array().unwrap().get(0).unwrap();
    assert_eq!(first.get_property("kind").unwrap().as_str(), Some("point"));
}

/// Test that subscriptions resume linked on both sides and keep working.
#[tokio::test]
async fn subscriptions_resume_symmetrically() {
    let container = LocalContainer::new();
    let count = Signal::new_in(container.clone(), 1);
    let task = Task::new_in(
        container.clone(),
        LazyRef::new("log-count", |captures| captures[0].read())
            .with_captures(vec![Value::from(count.clone())]),
    );
    task.run().unwrap();

    let text = serialize(&[Value::from(count), Value::from(task)]).await.unwrap();

    let seen = Rc::new(Cell::new(0.0));
    let s = seen.clone();
    let log: LazyFn = Rc::new(move |captures: &[Value]| {
        s.set(captures[0].read()?.as_number().unwrap_or(-1.0));
        Ok(Value::Undefined)
    });
    let resumed = LocalContainer::new();
    let options = DeserializeOptions {
        container: Some(resumed.clone() as ContainerRef),
        resolver: Some(symbols(vec![("log-count", log)])),
    };
    let roots = deserialize_with(&text, options).unwrap();

    let Value::Signal(count) = roots.get(0).unwrap() else {
        panic!("expected a signal");
    };
    let Value::Task(task) = roots.get(1).unwrap() else {
        panic!("expected a task");
    };

    assert_eq!(count.subscriber_count(), 1);
    let edge = count.effects().remove(0);
    assert!(is_symmetric(&edge));
    assert!(producer_is_symmetric(&Producer::Signal(count.clone())));
    assert_eq!(edge.consumer(), Some(Consumer::Task(task.clone())));
    assert_eq!(task.ledger().len(), 1);

    count.set(7);
    assert!(task.is_dirty());
    assert_eq!(resumed.pending(), 1);
    resumed.flush().unwrap();
    assert_eq!(seen.get(), 7.0);
}

/// Test that a valid computed resumes without recomputing.
#[tokio::test]
async fn computed_resumes_with_cached_value() {
    let base = Signal::new(2);
    let doubled = ComputedSignal::new(
        LazyRef::new("double", double).with_captures(vec![Value::from(base.clone())]),
    );
    doubled.value().unwrap();
    let skipped = ComputedSignal::new(
        LazyRef::new("double", double).with_captures(vec![Value::from(base.clone())]),
    )
    .with_strategy(SerializationStrategy::Never);
    skipped.value().unwrap();

    let text = serialize(&[Value::from(doubled), Value::from(skipped), Value::from(base)])
        .await
        .unwrap();

    let runs = Rc::new(Cell::new(0));
    let r = runs.clone();
    let counted: LazyFn = Rc::new(move |captures: &[Value]| {
        r.set(r.get() + 1);
        double(captures)
    });
    let options = DeserializeOptions {
        container: None,
        resolver: Some(symbols(vec![("double", counted)])),
    };
    let roots = deserialize_with(&text, options).unwrap();
    let (Value::Computed(doubled), Value::Computed(skipped), Value::Signal(base)) =
        (roots.get(0).unwrap(), roots.get(1).unwrap(), roots.get(2).unwrap())
    else {
        panic!("unexpected root kinds");
    };

    assert!(!doubled.is_invalid());
    assert_eq!(doubled.value().unwrap().as_number(), Some(4.0));
    assert_eq!(runs.get(), 0);

    assert!(skipped.is_invalid());
    assert_eq!(skipped.value().unwrap().as_number(), Some(4.0));
    assert_eq!(runs.get(), 1);

    base.set(5);
    assert!(doubled.is_invalid());
    assert_eq!(doubled.value().unwrap().as_number(), Some(10.0));
    assert_eq!(runs.get(), 2);
}

/// Test that stores resume with keyed edges and their nested wrappers.
#[tokio::test]
async fn store_resumes_with_keyed_edges() {
    let target = Object::new()
        .with("count", 1)
        .with("nested", Object::new().with("x", 1));
    let store = Store::new(target, StoreFlags::recursive()).unwrap();
    let task = Task::new(
        LazyRef::new("read-store", |captures| {
            let store = &captures[0];
            store.get_property("count")?;
            store.get_property("nested")?.get_property("x")
        })
        .with_captures(vec![Value::from(store.clone())]),
    );
    task.run().unwrap();
    assert_eq!(store.nested_stores().len(), 1);

    let text = serialize(&[Value::from(store), Value::from(task)]).await.unwrap();
    let roots = deserialize(&text).unwrap();
    let Value::Store(store) = roots.get(0).unwrap() else {
        panic!("expected a store");
    };

    assert!(store.flags().recursive);
    assert_eq!(store.effects_for(&StoreKey::prop("count")).len(), 1);
    assert_eq!(store.effects_for(&StoreKey::prop("nested")).len(), 1);

    let Value::Store(nested) = store.get("nested") else {
        panic!("expected a nested store");
    };
    assert_eq!(nested.effects_for(&StoreKey::prop("x")).len(), 1);
    assert!(producer_is_symmetric(&Producer::Store(nested)));
}

/// Test that a pending promise is awaited and written as a forward reference.
#[tokio::test]
async fn pending_promise_resolves_into_forward_reference() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (promise, resolver) = Promise::pending();
            tokio::task::spawn_local(async move {
                tokio::task::yield_now().await;
                resolver.resolve("done");
            });

            let holder = Value::from(vec![Value::from(promise.clone()), Value::from(promise)]);
            let text = serialize(&[holder]).await.unwrap();
            assert_eq!(text, r#"[9,[1,0,1,0],15,[true,4,"done"],2,[1]]"#);

            let roots = deserialize(&text).unwrap();
            assert_eq!(roots.len(), 2);
            let array = roots.get(0).unwrap();
            let array = array.as_array().unwrap();
            let first = array.get(0).unwrap();
            assert!(first.is_identical(&array.get(1).unwrap()));
            let settled = first.as_promise().unwrap().settlement().unwrap();
            assert_eq!(settled.unwrap().as_str(), Some("done"));
        })
        .await;
}

/// Test that a rejection is kept as a rejected promise.
#[tokio::test]
async fn rejected_promise_round_trips() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (promise, resolver) = Promise::pending();
            tokio::task::spawn_local(async move {
                resolver.reject("nope");
            });
            let text = serialize(&[Value::from(promise)]).await.unwrap();
            let roots = deserialize(&text).unwrap();
            let decoded = roots.get(0).unwrap();
            let outcome = decoded.as_promise().unwrap().settlement().unwrap();
            assert_eq!(outcome.unwrap_err().as_str(), Some("nope"));
        })
        .await;
}

/// Test that a promise dropped mid-serialization fails the pass.
#[tokio::test]
async fn abandoned_promise_fails_serialization() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (promise, resolver) = Promise::pending();
            tokio::task::spawn_local(async move {
                drop(resolver);
            });
            let result = serialize(&[Value::from(promise)]).await;
            assert!(matches!(result, Err(SerializeError::AbandonedPromise { forward_ref: 0 })));
        })
        .await;
}

/// Test that a settled async cell resumes with its value and poll interval.
#[tokio::test]
async fn async_computed_resumes_settled() {
    let cell = AsyncComputed::new(LazyRef::new("answer", |_| Ok(Value::from(Promise::resolved(42)))))
        .with_poll(Duration::from_millis(250));
    assert_eq!(cell.value().unwrap().as_number(), Some(42.0));

    let decoded = round_trip(&Value::from(cell)).await;
    let Value::AsyncComputed(cell) = decoded else {
        panic!("expected an async computed");
    };
    assert!(!cell.is_invalid());
    assert!(!cell.is_loading());
    assert_eq!(cell.poll_interval(), Some(Duration::from_millis(250)));
    assert_eq!(cell.value().unwrap().as_number(), Some(42.0));
}

/// Test that host nodes are written by id and found again on resume.
#[tokio::test]
async fn host_nodes_resolve_through_the_container() {
    let container = LocalContainer::new();
    let node = HostNode::new("section");
    let mut serializer = Serializer::new().with_container(container.clone());
    serializer.add_root(Value::from(node.clone()));
    let text = serializer.serialize().await.unwrap();
    assert_eq!(text, r#"[17,"n0"]"#);

    let options = DeserializeOptions {
        container: Some(container.clone() as ContainerRef),
        resolver: None,
    };
    let roots = deserialize_with(&text, options).unwrap();
    let Value::Node(found) = roots.get(0).unwrap() else {
        panic!("expected a node");
    };
    assert!(found.ptr_eq(&node));

    let empty = DeserializeOptions {
        container: Some(LocalContainer::new() as ContainerRef),
        resolver: None,
    };
    let roots = deserialize_with(&text, empty).unwrap();
    assert!(matches!(roots.get(0), Err(DeserializeError::UnknownNode(id)) if id == "n0"));
}

/// Test that a node without an id needs a container.
#[tokio::test]
async fn node_without_container_is_an_error() {
    let result = serialize(&[Value::from(HostNode::new("div"))]).await;
    assert!(matches!(result, Err(SerializeError::MissingContainer(_))));
}

/// Test that roots are decoded only when read.
#[tokio::test]
async fn roots_decode_lazily() {
    let first = Value::from(Object::new().with("a", 1));
    let second = Value::from(Object::new().with("b", 2));
    let text = serialize(&[first, second]).await.unwrap();

    let roots = deserialize(&text).unwrap();
    assert!(!roots.is_materialized(0));
    roots.get(0).unwrap();
    assert!(roots.is_materialized(0));
    assert!(!roots.is_materialized(1));
    assert_eq!(roots.to_vec().unwrap().len(), 2);
    assert!(roots.is_materialized(1));
}

/// Test that a root reached only through a reference stays undecoded until
/// its contents are read.
#[tokio::test]
async fn referenced_roots_decode_on_first_touch() {
    let shared = Value::from(Object::new().with("n", 1));
    let text = serialize(&[Value::from(vec![shared.clone(), shared])]).await.unwrap();

    let roots = deserialize(&text).unwrap();
    assert_eq!(roots.len(), 2);
    let array = roots.get(0).unwrap();
    let array = array.as_array().unwrap();
    let first = array.get(0).unwrap();
    assert!(first.is_identical(&array.get(1).unwrap()));
    assert!(!roots.is_materialized(1));

    assert_eq!(first.get_property("n").unwrap().as_number(), Some(1.0));
    assert!(roots.is_materialized(1));
}

/// Test that values nested past the inline depth are split into roots and
/// reassembled on decode.
#[tokio::test]
async fn depth_split_values_round_trip() {
    let config = SerdesConfig {
        max_inline_depth: 2,
        ..SerdesConfig::default()
    };
    let mut value = Value::from(vec![1]);
    for level in 0..10 {
        value = Value::from(Object::new().with("level", level).with("inner", value));
    }

    let mut serializer = Serializer::with_config(config);
    serializer.add_root(value.clone());
    let text = serializer.serialize().await.unwrap();

    let roots = deserialize(&text).unwrap();
    assert!(roots.len() > 3);
    let decoded = roots.get(0).unwrap();
    assert!(decoded.deep_eq(&value));
}

const CHAIN_LEN: usize = 20_000;

fn linked_list(len: usize) -> Value {
    let mut head = Value::Null;
    for index in (0..len).rev() {
        head = Value::from(Object::new().with("value", index as f64).with("next", head));
    }
    head
}

/// Drop a linked list one node at a time.
fn unlink(head: Value) {
    let mut current = head;
    while let Value::Object(node) = current {
        current = node.remove("next").unwrap_or_default();
    }
}

/// Test that a long linked list survives a round trip. Both encoding and
/// decoding have to work through it without recursing once per node.
#[tokio::test]
async fn long_linked_list_round_trips() {
    let head = linked_list(CHAIN_LEN);
    let text = serialize(&[head.clone()]).await.unwrap();

    let roots = deserialize(&text).unwrap();
    assert!(roots.len() > CHAIN_LEN / 32);
    let decoded = roots.get(0).unwrap();
    assert!(!roots.is_materialized(roots.len() - 1));

    let mut node = decoded.clone();
    for index in 0..CHAIN_LEN {
        assert_eq!(node.get_property("value").unwrap().as_number(), Some(index as f64));
        node = node.get_property("next").unwrap();
    }
    assert!(matches!(node, Value::Null));
    assert!(roots.is_materialized(roots.len() - 1));

    drop(roots);
    unlink(decoded);
    unlink(head);
}

/// Test that the dump names each root.
#[tokio::test]
async fn dump_lists_every_root() {
    let shared = Value::from(Object::new());
    let text = serialize(&[Value::from(vec![shared.clone(), shared])]).await.unwrap();
    let dump = dump_state(&text).unwrap();
    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(lines, vec!["0 Array [0,1,0,1]", "1 Object []"]);
}
