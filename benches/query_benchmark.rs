use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mailidx::backend::AttrBackend;
use mailidx::core::config::Config;
use mailidx::query::Query;
use mailidx::storage::StorageLayout;
use mailidx::store::MailStore;
use rand::Rng;
use std::collections::BTreeMap;
use tempfile::tempdir;

/// Helper to create message text from a small vocabulary
fn create_message_text(word_count: usize) -> String {
    let mut rng = rand::thread_rng();
    let words = [
        "the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog", "release", "meeting",
    ];
    (0..word_count)
        .map(|_| words[rng.gen_range(0..words.len())])
        .collect::<Vec<_>>()
        .join(" ")
}

fn populated_store(message_count: usize) -> (tempfile::TempDir, MailStore) {
    let dir = tempdir().unwrap();
    let layout = StorageLayout::new(dir.path()).unwrap();
    let store = MailStore::new(
        Config::new(dir.path()),
        Box::new(AttrBackend::new(&layout)),
    )
    .unwrap();
    store
        .synchronize(|session| {
            for i in 0..message_count {
                let mut attributes = BTreeMap::new();
                attributes.insert("subject".to_string(), format!("subject {}", i % 20));
                attributes.insert("from".to_string(), format!("sender{}@example.org", i % 7));
                session.import(&create_message_text(50), attributes, "")?;
            }
            Ok(())
        })
        .unwrap();
    (dir, store)
}

/// Benchmark query text parsing
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    let queries = [
        ("term", "hello"),
        ("property", "date >= 2005-08-24"),
        ("mixed", "( hello | hi ) & subject : meeting - flag : \\Seen"),
        ("chained", "2005-08-24 < date < 2005-08-25"),
    ];
    for (name, text) in queries {
        group.bench_function(name, |b| {
            b.iter(|| Query::parse(black_box(text)).unwrap());
        });
    }
    group.finish();
}

/// Benchmark condition compilation, including trees that only compile
/// after decomposition rejects them
fn bench_compile(c: &mut Criterion) {
    let compilable = Query::parse("quick subject : meeting uid >= 10").unwrap();
    let decomposable = Query::parse("( quick fox ) | ( lazy dog )").unwrap();
    c.bench_function("compile_direct", |b| {
        b.iter(|| AttrBackend::compile(black_box(&compilable)));
    });
    c.bench_function("compile_unsupported", |b| {
        b.iter(|| AttrBackend::compile(black_box(&decomposable)));
    });
}

/// Benchmark end-to-end search at a few store sizes
fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("uid_search");
    for size in [100, 1000] {
        let (_dir, store) = populated_store(size);
        group.bench_with_input(
            BenchmarkId::new("direct", size),
            &store,
            |b, store| {
                b.iter(|| store.uid_search_text(black_box("quick subject : \"subject 3\"")).unwrap());
            },
        );
        group.bench_with_input(
            BenchmarkId::new("decomposed", size),
            &store,
            |b, store| {
                b.iter(|| {
                    store
                        .uid_search_text(black_box("( quick fox ) | ( lazy dog )"))
                        .unwrap()
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_parse, bench_compile, bench_search);
criterion_main!(benches);
