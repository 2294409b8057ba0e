use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use qgraph::{dispatch_graph, format_graph, testing::conv_chain, QuantizationSetting, TargetPlatform};

fn criterion_benchmark(c: &mut Criterion) {
    let setting = QuantizationSetting::default();
    for len in [16, 128] {
        let graph = conv_chain(len);
        c.bench_function(&format!("format conv_chain({len})"), |b| {
            b.iter_batched(
                || graph.clone(),
                |mut graph| format_graph(&mut graph).unwrap(),
                BatchSize::SmallInput,
            )
        });

        let mut formatted = graph.clone();
        format_graph(&mut formatted).unwrap();
        c.bench_function(&format!("dispatch conv_chain({len})"), |b| {
            b.iter_batched(
                || formatted.clone(),
                |mut graph| dispatch_graph(&mut graph, TargetPlatform::PplCudaInt8, &setting).unwrap(),
                BatchSize::SmallInput,
            )
        });
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = criterion_benchmark
}
criterion_main!(benches);
