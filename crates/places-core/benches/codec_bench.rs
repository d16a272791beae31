use criterion::{criterion_group, criterion_main, Criterion};
use places_core::{export, import, Category, Place};
use time::OffsetDateTime;

const LEGACY_LABELS: [&str; 8] = [
    "Restaurante",
    "Cafetería",
    "Taberna",
    "Panadería",
    "Jatetxea",
    "Kafetegia",
    "Okindegia",
    "Sidrería",
];

fn mk_place(index: usize) -> Place {
    let category = Category::ALL[index % Category::ALL.len()];
    let offset = f64::from(u32::try_from(index % 1_000).unwrap_or(0)) / 10_000.0;
    Place::new(format!("Bench place {index}"), 43.3 + offset, -1.98 - offset, category)
        .with_description("benchmark fixture")
        .with_rating(4.0)
        .with_cuisine_type(category.default_cuisine())
}

fn bench_legacy_resolution(c: &mut Criterion) {
    c.bench_function("category_from_legacy_text", |b| {
        b.iter(|| {
            for label in LEGACY_LABELS {
                criterion::black_box(Category::from_legacy_text(label));
            }
        });
    });
}

fn bench_codec(c: &mut Criterion) {
    let places = (0..1_000).map(mk_place).collect::<Vec<_>>();
    let text = match export(&places, OffsetDateTime::UNIX_EPOCH).and_then(|doc| doc.to_pretty_json()) {
        Ok(text) => text,
        Err(err) => panic!("failed to build benchmark document: {err}"),
    };

    c.bench_function("export_1000_places", |b| {
        b.iter(|| export(criterion::black_box(&places), OffsetDateTime::UNIX_EPOCH));
    });

    c.bench_function("import_1000_places", |b| {
        b.iter(|| import(criterion::black_box(&text)));
    });
}

criterion_group!(benches, bench_legacy_resolution, bench_codec);
criterion_main!(benches);
