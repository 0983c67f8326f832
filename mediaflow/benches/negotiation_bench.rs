//! Benchmarks for caps negotiation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mediaflow::caps::{Capability, CapabilitySet, RAW_VIDEO};
use mediaflow::graph::Graph;
use mediaflow::testing::{RecordingSink, ScriptedSource};
use std::sync::Arc;

fn offered() -> Capability {
    Capability::new(RAW_VIDEO)
        .with_str("format", "I420")
        .with_range("width", 1, 8192)
        .with_range("height", 1, 8192)
        .with_fraction("framerate", 30, 1)
}

fn caps_benchmark(c: &mut Criterion) {
    let offer = offered();
    let filter = Capability::parse("video/x-raw, width=1920, height=1080").unwrap();
    c.bench_function("caps_intersect", |b| {
        b.iter(|| black_box(&offer).intersect(black_box(&filter)))
    });

    let set = CapabilitySet::OneOf(vec![
        Capability::new("video/x-raw").with_str("format", "RGB"),
        Capability::new("video/x-raw").with_str("format", "I420"),
    ]);
    c.bench_function("caps_set_accepts", |b| {
        b.iter(|| black_box(&set).accepts(black_box(&offer)))
    });
}

fn link_benchmark(c: &mut Criterion) {
    c.bench_function("lazy_link_announce", |b| {
        b.iter(|| {
            let mut graph = Graph::new("bench");
            let src = graph
                .add_stage("source", Arc::new(ScriptedSource::new().with_lazy_outputs()))
                .unwrap();
            let sink = graph
                .add_stage("sink", Arc::new(RecordingSink::accepting(offered())))
                .unwrap();
            graph.register_lazy_link(src, sink, RAW_VIDEO).unwrap();
            black_box(graph.announce_port(src, "src_0", offered().fixate()).unwrap())
        })
    });
}

criterion_group!(benches, caps_benchmark, link_benchmark);
criterion_main!(benches);
