use chart_export_server::{
    clamp_scale, find_private_address, get_chrome_args, normalize_output_type, BrowserOptions,
    ExportConfig, ExportRequest, ExportStats, OutputType,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

fn benchmark_config_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");
    group.measurement_time(Duration::from_secs(1));

    group.bench_function("config_creation", |b| {
        b.iter(|| {
            let config = ExportConfig::default();
            black_box(config);
        });
    });

    group.finish();
}

fn benchmark_request_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("export_request");
    group.measurement_time(Duration::from_secs(1));

    group.bench_function("request_creation", |b| {
        b.iter(|| {
            let request = ExportRequest {
                options: Some(serde_json::json!({
                    "title": {"text": "Chart"},
                    "series": [{"data": [1, 2, 3]}]
                })),
                out_type: Some("png".to_string()),
                width: Some(600.0),
                height: Some(400.0),
                ..Default::default()
            };
            black_box(request);
        });
    });

    group.finish();
}

fn benchmark_chrome_args_generation(c: &mut Criterion) {
    let options = BrowserOptions::default();

    c.bench_function("chrome_args_generation", |b| {
        b.iter(|| {
            let args = get_chrome_args(&options);
            black_box(args);
        });
    });
}

fn benchmark_type_normalization(c: &mut Criterion) {
    c.bench_function("type_normalization", |b| {
        b.iter(|| {
            black_box(normalize_output_type(
                black_box(Some("png")),
                black_box(Some("report.pdf")),
                OutputType::Png,
            ));
        });
    });
}

fn benchmark_scale_clamp(c: &mut Criterion) {
    c.bench_function("scale_clamp", |b| {
        b.iter(|| {
            black_box(clamp_scale(black_box(99.0)));
        });
    });
}

fn benchmark_private_address_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("address_scan");
    group.measurement_time(Duration::from_secs(2));

    let clean = "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"600\" height=\"400\">\
                 <rect width=\"600\" height=\"400\"/></svg>";
    let hostile = "<svg><image xlink:href=\"http://10.0.0.1/x\"/></svg>";

    for (name, payload) in [("clean", clean), ("hostile", hostile)] {
        group.bench_with_input(BenchmarkId::new("scan", name), payload, |b, payload| {
            b.iter(|| {
                black_box(find_private_address(black_box(payload)));
            });
        });
    }

    group.finish();
}

fn benchmark_stats_recording(c: &mut Criterion) {
    let stats = ExportStats::new();

    c.bench_function("stats_recording", |b| {
        b.iter(|| {
            stats.record_attempt();
            stats.record_success(Duration::from_millis(120));
            black_box(stats.spent_average());
        });
    });
}

criterion_group!(
    benches,
    benchmark_config_creation,
    benchmark_request_creation,
    benchmark_chrome_args_generation,
    benchmark_type_normalization,
    benchmark_scale_clamp,
    benchmark_private_address_scan,
    benchmark_stats_recording,
);
criterion_main!(benches);
