//! Serializer throughput on a graph of signals, stores and tasks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use lattice_state::reactive::{Signal, Store, StoreFlags, Task};
use lattice_state::serdes::{deserialize, serialize};
use lattice_state::value::{LazyRef, Object, Value};

fn build_graph(width: usize) -> Vec<Value> {
    let mut roots = Vec::with_capacity(width * 2);
    for i in 0..width {
        let signal = Signal::new(i as f64);
        let store = Store::new(Object::new().with("label", format!("row number {i}")), StoreFlags::default())
            .unwrap();
        let task = Task::new(
            LazyRef::new("row", |captures| {
                captures[0].read()?;
                captures[1].get_property("label")
            })
            .with_captures(vec![Value::from(signal), Value::from(store.clone())]),
        );
        task.run().unwrap();
        roots.push(Value::from(store));
        roots.push(Value::from(task));
    }
    roots
}

fn bench_serialize(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let roots = build_graph(200);

    c.bench_function("serialize_200_rows", |b| {
        b.iter(|| runtime.block_on(serialize(black_box(&roots))).unwrap())
    });

    let text = runtime.block_on(serialize(&roots)).unwrap();
    c.bench_function("deserialize_200_rows", |b| {
        b.iter(|| deserialize(black_box(&text)).unwrap().to_vec().unwrap())
    });
}

criterion_group!(benches, bench_serialize);
criterion_main!(benches);
