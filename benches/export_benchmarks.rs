use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::HashMap;
use std::hint::black_box;
use trigger_metrics::exporter::snapshot::{render_store_series, BotSnapshot, ChannelSnapshot, CollectedData};
use trigger_metrics::resilience::{CircuitBreaker, CircuitBreakerConfig};

fn collected(bots: usize) -> CollectedData {
    let bots: Vec<BotSnapshot> = (0..bots)
        .map(|i| BotSnapshot {
            bot_name: format!("bot{i:04}"),
            stats: HashMap::from([
                ("total_triggers".to_string(), "1200".to_string()),
                ("total_responses".to_string(), "1180".to_string()),
                ("total_failures".to_string(), "20".to_string()),
                ("unique_users".to_string(), "87".to_string()),
                ("unique_channels".to_string(), "12".to_string()),
            ]),
            conditions: (0..8)
                .map(|c| (format!("condition{c}"), (150 * (c + 1)).to_string()))
                .collect(),
            samples: (0..200).map(|s| 5 + s * 7).collect(),
        })
        .collect();
    let channels = (0..bots.len() / 2)
        .map(|i| ChannelSnapshot {
            channel_id: format!("channel{i:04}"),
            activity: HashMap::from([
                ("bot_triggers".to_string(), "640".to_string()),
                ("guild_id".to_string(), "guild1".to_string()),
            ]),
        })
        .collect();

    CollectedData {
        keys_scanned: bots.len() + bots.len() / 2,
        bots,
        channels,
        truncated: false,
    }
}

fn benchmark_render_store_series(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_store_series");
    for bots in [10, 100, 1000] {
        let data = collected(bots);
        group.bench_with_input(BenchmarkId::from_parameter(bots), &data, |b, data| {
            b.iter(|| render_store_series(black_box("trigger_metrics"), black_box(data)))
        });
    }
    group.finish();
}

fn benchmark_breaker_fast_path(c: &mut Criterion) {
    let breaker = CircuitBreaker::new("bench".to_string(), CircuitBreakerConfig::for_recorder());
    c.bench_function("circuit_breaker_closed_call", |b| {
        b.iter(|| {
            futures::executor::block_on(breaker.call(|| async { Ok::<_, std::io::Error>(black_box(1)) }))
        })
    });

    let open = CircuitBreaker::new("bench_open".to_string(), CircuitBreakerConfig::for_recorder());
    open.force_open();
    c.bench_function("circuit_breaker_open_rejection", |b| {
        b.iter(|| {
            futures::executor::block_on(open.call(|| async { Ok::<_, std::io::Error>(black_box(1)) }))
        })
    });
}

criterion_group!(benches, benchmark_render_store_series, benchmark_breaker_fast_path);
criterion_main!(benches);
