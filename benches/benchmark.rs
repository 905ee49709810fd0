use criterion::{black_box, criterion_group, criterion_main, Criterion};
use screenshot_queue::{
    client_id_from_headers, CacheConfig, CaptureRequest, Fingerprint, FingerprintCache, Metrics,
    OutputFormat, RateLimitConfig, RateLimiter, RawCaptureParams, UrlValidator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn benchmark_request_normalization(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalization");
    configure_fast_group(&mut group);

    let validator = UrlValidator::default();
    let test_params = vec![
        RawCaptureParams::new("https://example.com"),
        RawCaptureParams::new("https://example.com/path?q=1").width(5000).height(100).format("jpg"),
        RawCaptureParams::new("http://192.168.1.1"),
        RawCaptureParams::new("invalid-url"),
    ];

    group.bench_function("normalize", |b| {
        b.iter(|| {
            for params in &test_params {
                let result = params.normalize(&validator);
                let _ = black_box(result);
            }
        });
    });

    group.finish();
}

fn benchmark_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    configure_fast_group(&mut group);

    let viewport = CaptureRequest::new("https://example.com", 1280, 800, false, OutputFormat::Png, 0);
    let full_page = CaptureRequest::new("https://example.com/long", 1920, 1080, true, OutputFormat::Webp, 3);

    group.bench_function("viewport", |b| {
        b.iter(|| black_box(Fingerprint::of(black_box(&viewport))));
    });

    group.bench_function("full_page", |b| {
        b.iter(|| black_box(Fingerprint::of(black_box(&full_page))));
    });

    group.finish();
}

fn benchmark_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");
    configure_fast_group(&mut group);

    let limiter = RateLimiter::new(&RateLimitConfig::default(), Arc::new(Metrics::new()));
    let clients: Vec<String> = (0..256).map(|i| format!("203.0.113.{i}")).collect();

    group.bench_function("check_limit", |b| {
        let mut next = 0;
        b.iter(|| {
            next = (next + 1) % clients.len();
            black_box(limiter.check_limit(&clients[next]));
        });
    });

    let headers = [
        ("Host", "example.com"),
        ("X-Forwarded-For", "203.0.113.7, 10.0.0.1"),
        ("User-Agent", "bench"),
    ];
    group.bench_function("client_id", |b| {
        b.iter(|| black_box(client_id_from_headers(headers.iter().copied())));
    });

    group.finish();
}

fn benchmark_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache");
    configure_fast_group(&mut group);

    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        directory: dir.path().join("cache"),
        fallback_directory: dir.path().join("fallback"),
        ..Default::default()
    };
    let cache = rt
        .block_on(FingerprintCache::open(&config, Arc::new(Metrics::new())))
        .unwrap();

    let request = CaptureRequest::new("https://example.com", 1280, 800, false, OutputFormat::Png, 0);
    let blob = vec![0u8; 64 * 1024];

    group.bench_function("put", |b| {
        b.iter(|| rt.block_on(cache.put(&request, &blob)));
    });

    rt.block_on(cache.put(&request, &blob));
    group.bench_function("get_hit", |b| {
        b.iter(|| black_box(rt.block_on(cache.get(&request))));
    });

    let missing = CaptureRequest::new("https://example.org", 1280, 800, false, OutputFormat::Png, 0);
    group.bench_function("get_miss", |b| {
        b.iter(|| black_box(rt.block_on(cache.get(&missing))));
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_request_normalization,
    benchmark_fingerprint,
    benchmark_rate_limiter,
    benchmark_cache
);
criterion_main!(benches);
