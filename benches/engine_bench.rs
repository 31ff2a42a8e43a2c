//! Engine benchmarks using Criterion.
//!
//! Run with: `cargo bench`
//!
//! Covers the two hot paths: the merge-join primitive and a full
//! bottom-up materialization of a chain-shaped ancestor program.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rulelog::bindings::{BindingsTable, TupleTable};
use rulelog::edb::EdbLayer;
use rulelog::executor::RuleExecutor;
use rulelog::program::Program;
use rulelog::reasoner::Reasoner;

fn chain_layer(n: u64) -> EdbLayer {
    let layer = EdbLayer::new();
    let rows: Vec<Vec<u64>> = (0..n).map(|i| vec![i, i + 1]).collect();
    layer.add_facts("par", 2, rows);
    layer
}

fn bench_merge_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_join");
    for size in [100u64, 1_000, 10_000] {
        let mut lit = TupleTable::new(2);
        let mut suppl = TupleTable::new(1);
        for i in 0..size {
            lit.add_row(&[i % (size / 10), i]);
            suppl.add_row(&[i % (size / 10)]);
        }
        let lit = lit.sort_by(&[0]);
        let suppl = suppl.sort_by(&[0]);
        let joins = [(0usize, 0usize)];
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let mut out = BindingsTable::with_layout(vec![0, 1, 2]);
                RuleExecutor::join(black_box(&lit), black_box(&suppl), &joins, &mut out);
                out.n_tuples()
            })
        });
    }
    group.finish();
}

fn bench_materialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("materialization");
    group.sample_size(10);
    for size in [16u64, 32, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &n| {
            b.iter(|| {
                let layer = chain_layer(n);
                let mut program = Program::new(&layer);
                program
                    .parse_rules("anc(X,Y) :- par(X,Y)\nanc(X,Z) :- par(X,Y), anc(Y,Z)")
                    .unwrap();
                let reasoner = Reasoner::default();
                let naiver = reasoner
                    .full_materialization(&layer, &program, 1, None)
                    .unwrap();
                black_box(naiver.count_all_idbs())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_merge_join, bench_materialization);
criterion_main!(benches);
