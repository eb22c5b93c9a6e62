use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use mesh_carve::algs::communicator::NoComm;
use mesh_carve::mesh_generation::{structured_mesh_2d, structured_mesh_3d};
use mesh_carve::metrics::Metrics;
use mesh_carve::partitioning::partition_graph;
use mesh_carve::settings::Settings;

fn bench_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition");
    let comm = NoComm;

    for &side in &[16usize, 32, 48] {
        let (graph, coords, _) = structured_mesh_2d(&comm, side, side).unwrap();
        let settings = Settings {
            num_blocks: 8,
            dimensions: 2,
            sfc_resolution: 11,
            ..Settings::default()
        };
        group.bench_with_input(
            BenchmarkId::new("grid2d", side * side),
            &side,
            |b, _| {
                b.iter(|| {
                    let mut metrics = Metrics::new();
                    partition_graph(&comm, &graph, &coords, None, &settings, &mut metrics)
                        .unwrap()
                })
            },
        );
    }

    let (graph, coords, _) = structured_mesh_3d(&comm, 16, 16, 16).unwrap();
    let settings = Settings {
        num_blocks: 8,
        dimensions: 3,
        sfc_resolution: 9,
        ..Settings::default()
    };
    group.bench_function("cube16", |b| {
        b.iter(|| {
            let mut metrics = Metrics::new();
            partition_graph(&comm, &graph, &coords, None, &settings, &mut metrics).unwrap()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_partition);
criterion_main!(benches);
