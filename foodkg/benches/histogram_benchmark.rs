use criterion::{criterion_group, criterion_main, Criterion};
use foodkg::histogram::ImageHistogram;
use foodkg::text_index::TextIndex;
use foodkg::FoodRecord;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use rand::Rng;

fn noise_png(width: u32, height: u32) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let image = RgbImage::from_fn(width, height, |_, _| Rgb([rng.gen(), rng.gen(), rng.gen()]));
    let mut out = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn bench_histogram(c: &mut Criterion) {
    let sizes = vec![("thumb_64", 64), ("photo_640", 640), ("photo_1600", 1600)];

    let mut group = c.benchmark_group("histogram");
    group.sample_size(20);

    for (name, side) in sizes {
        let bytes = noise_png(side, side);
        group.bench_function(name, |b| {
            b.iter(|| ImageHistogram::from_bytes(&bytes).unwrap())
        });
    }

    let a = ImageHistogram::from_bytes(&noise_png(128, 128)).unwrap();
    let b = ImageHistogram::from_bytes(&noise_png(128, 128)).unwrap();
    group.bench_function("similarity", |bench| bench.iter(|| a.similarity(&b)));
    group.finish();
}

fn bench_text_search(c: &mut Criterion) {
    let words = ["apple", "banana", "bread", "cheese", "yogurt", "almond", "salmon", "rice"];
    let mut rng = rand::thread_rng();
    let records: Vec<FoodRecord> = (0..5_000)
        .map(|i| {
            let first = words[rng.gen_range(0..words.len())];
            let second = words[rng.gen_range(0..words.len())];
            FoodRecord::new(format!("bench:{}", i), format!("{} {} {}", first, second, i))
                .with_category("Mixed", "Mixed")
                .with_calories(rng.gen_range(10.0..600.0))
        })
        .collect();

    let index = TextIndex::in_memory();
    index.rebuild(&records).unwrap();

    let queries = vec![
        ("short_prefix", "ba"),
        ("word", "cheese"),
        ("typo", "almnod"),
        ("two_words", "salmon rice"),
    ];

    let mut group = c.benchmark_group("text_search");
    group.sample_size(20);

    for (name, query) in queries {
        group.bench_function(name, |b| b.iter(|| index.search(query, 100).unwrap()));
    }
    group.bench_function("autocomplete", |b| b.iter(|| index.autocomplete("yog", 10)));
    group.finish();
}

criterion_group!(benches, bench_histogram, bench_text_search);
criterion_main!(benches);
