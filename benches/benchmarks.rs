
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use tempfile::TempDir;
use ugnos_tsi::{Expr, IndexConfig, SeriesSearchOptions, TimeRange, TsIndex};

fn populated_index(series: usize) -> TsIndex {
    let rows = datasets::generate_series(datasets::DEFAULT_SEED, series, 4, 4, 16);
    let idx = TsIndex::in_memory();
    idx.create_index_if_not_exists(&rows).unwrap();
    idx
}

fn bench_create_series(c: &mut Criterion) {
    let rows = datasets::generate_series(datasets::DEFAULT_SEED, 20_000, 4, 4, 16);

    let mut group = c.benchmark_group("create");
    group.bench_function("create_20k_series", |b| {
        b.iter_batched(
            TsIndex::in_memory,
            |idx| {
                for chunk in rows.chunks(1_000) {
                    idx.create_index_if_not_exists(black_box(chunk)).unwrap();
                }
            },
            BatchSize::LargeInput,
        )
    });
    group.bench_function("reregister_20k_existing", |b| {
        let idx = TsIndex::in_memory();
        idx.create_index_if_not_exists(&rows).unwrap();
        b.iter(|| idx.create_index_if_not_exists(black_box(&rows)).unwrap())
    });
    group.finish();
}

fn bench_tag_filters(c: &mut Criterion) {
    let idx = populated_index(100_000);

    // k0 has 16 values, so each equality matches ~1/16 of a measurement.
    let cases = [
        ("eq_literal", Expr::tag_eq("k0", "v0")),
        ("neq_literal", Expr::tag_neq("k0", "v0")),
        ("regex_or_values", Expr::tag_match("k0", "^(v1|v3|v5)$")),
        ("regex_prefix_scan", Expr::tag_match("k0", "^v1.*")),
        ("regex_full_scan", Expr::tag_match("k1", "[02468]$")),
        (
            "and_of_two_tags",
            Expr::and(Expr::tag_eq("k0", "v0"), Expr::tag_eq("k1", "v1")),
        ),
        ("empty_value", Expr::tag_eq("k3", "")),
    ];

    let mut group = c.benchmark_group("search");
    for (name, cond) in &cases {
        group.bench_function(*name, |b| {
            b.iter(|| {
                idx.search_series_ids(black_box("m1"), black_box(Some(cond)), TimeRange::all())
                    .unwrap()
            })
        });
    }
    group.bench_function("iterator_with_field_filter", |b| {
        let cond = Expr::and(
            Expr::tag_eq("k0", "v0"),
            Expr::binary(
                ugnos_tsi::BinaryOp::Gt,
                Expr::field("usage"),
                Expr::NumberLiteral(0.5),
            ),
        );
        b.iter(|| {
            idx.measurement_series_by_expr_iterator("m1", Some(&cond), TimeRange::all(), None)
                .unwrap()
                .map(|it| it.count())
        })
    });
    group.finish();
}

fn bench_tag_values_and_grouping(c: &mut Criterion) {
    let idx = populated_index(50_000);

    let mut group = c.benchmark_group("metadata");
    group.bench_function("tag_values_4_keys", |b| {
        b.iter(|| {
            idx.search_tag_values(black_box("m2"), &["k0", "k1", "k2", "k3"], None)
                .unwrap()
        })
    });
    group.bench_function("group_by_k0", |b| {
        let opts = SeriesSearchOptions {
            condition: Some(Expr::tag_match("k1", "^(v1|v2)$")),
            dimensions: vec!["k0".to_string()],
            ..Default::default()
        };
        b.iter(|| idx.search_series_with_opts(black_box("m2"), &opts).unwrap())
    });
    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let rows = datasets::generate_series(datasets::DEFAULT_SEED, 20_000, 4, 4, 16);

    let mut group = c.benchmark_group("snapshot");
    group.bench_function("write_and_reload_20k", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().expect("tempdir");
                let cfg = IndexConfig {
                    data_dir: dir.path().to_path_buf(),
                    enable_snapshots: true,
                    ..Default::default()
                };
                let idx = TsIndex::with_config(cfg.clone()).expect("index init");
                idx.create_index_if_not_exists(&rows).unwrap();
                (dir, idx, cfg)
            },
            |(dir, idx, cfg)| {
                idx.snapshot().unwrap();
                drop(idx);
                let reopened = TsIndex::with_config(cfg).unwrap();
                drop(reopened);
                drop(dir);
            },
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_create_series,
    bench_tag_filters,
    bench_tag_values_and_grouping,
    bench_snapshot
);
criterion_main!(benches);
