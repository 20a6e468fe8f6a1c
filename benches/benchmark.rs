use aml_lookup::{validate, CacheKey, Config, Extractor, Network, RenderedPage};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn benchmark_config_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");
    configure_fast_group(&mut group);

    group.bench_function("creation", |b| {
        b.iter(|| {
            let config = Config::default();
            black_box(config);
        });
    });

    group.finish();
}

fn benchmark_address_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("address_validation");
    configure_fast_group(&mut group);

    let addresses = vec![
        "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
        "0x52908400098527886e0f7030069857d2e4169ee7",
        "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq",
        "TN3W4H6rK2ce4vX9YnFQHwKENnHjoxb3m9",
        "invalid_address",
    ];

    group.bench_function("validate", |b| {
        b.iter(|| {
            for address in &addresses {
                black_box(validate(black_box(address)));
            }
        });
    });

    group.finish();
}

fn benchmark_cache_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_key");
    configure_fast_group(&mut group);

    group.bench_function("derive", |b| {
        b.iter(|| {
            let key = CacheKey::new(
                black_box("aml"),
                Network::Eth,
                black_box("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"),
            );
            black_box(key);
        });
    });

    group.finish();
}

fn result_page() -> RenderedPage {
    let rows: String = (0..50)
        .map(|i| {
            format!(
                "<tr><td>0x{:040x}</td><td>Exchange</td><td>{}</td></tr>",
                i, i
            )
        })
        .collect();
    RenderedPage {
        url: "https://upstream.test/address".to_string(),
        html: format!(
            r#"<div class="container">
                 <div class="risk-score-value">Risk score: 87</div>
                 <span class="risk-level">High</span>
                 <div class="risk-type">Exchange</div>
                 <div><span>Address Label:</span><span>Hot Wallet</span></div>
                 <table class="risk-table"><tbody>{}</tbody></table>
               </div>"#,
            rows
        ),
        script_state: None,
    }
}

fn benchmark_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("extraction");
    configure_fast_group(&mut group);

    let extractor = Extractor::default();
    let page = result_page();

    group.bench_function("result_page", |b| {
        b.iter(|| {
            let result = extractor.extract(
                black_box(&page),
                "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
                Network::Eth,
            );
            black_box(result);
        });
    });

    group.bench_function("empty_page", |b| {
        let empty = RenderedPage {
            url: page.url.clone(),
            html: "<html><body>No data available</body></html>".to_string(),
            script_state: None,
        };
        b.iter(|| {
            let result = extractor.extract(black_box(&empty), "TN3W4H6rK2ce4vX9YnFQHwKENnHjoxb3m9", Network::Trx);
            black_box(result);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_config_creation,
    benchmark_address_validation,
    benchmark_cache_key,
    benchmark_extraction
);
criterion_main!(benches);
