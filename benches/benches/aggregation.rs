//! Calendar and candle store benchmarks.
//!
//! Run with: `cargo bench --package candlewick-bench`

use candlewick_aggregate::CandleStore;
use candlewick_bench::{MINUTE, minute_bars, spread_instants};
use candlewick_types::{Calendar, Timeframe, Tz};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

fn boundary_benchmark(c: &mut Criterion) {
    let instants = spread_instants(1_000);
    let calendars = [("utc", Calendar::utc()), ("new_york", Calendar::new(Tz::America__New_York))];
    let timeframes = ["5m", "4h", "1d", "1w", "1M"];

    let mut group = c.benchmark_group("boundary");
    group.throughput(Throughput::Elements(instants.len() as u64));

    for (zone, calendar) in &calendars {
        for raw in timeframes {
            let timeframe: Timeframe = raw.parse().expect("valid timeframe");
            group.bench_with_input(BenchmarkId::new(*zone, raw), &timeframe, |b, &timeframe| {
                b.iter(|| {
                    for &ts in &instants {
                        black_box(calendar.candle_times(timeframe, black_box(ts)).expect("in range"));
                    }
                });
            });
        }
    }

    group.finish();
}

fn store_benchmark(c: &mut Criterion) {
    let bars = minute_bars(0, 1_440);
    let calendar = Calendar::utc();

    let mut group = c.benchmark_group("store");
    group.throughput(Throughput::Elements(bars.len() as u64));

    for raw in ["5m", "1h", "1d"] {
        let timeframe: Timeframe = raw.parse().expect("valid timeframe");
        group.bench_with_input(BenchmarkId::new("merge_day", raw), &timeframe, |b, &timeframe| {
            b.iter(|| {
                let mut store = CandleStore::new();
                store.create("BTCUSDT");
                for bar in &bars {
                    if calendar.is_open_time(timeframe, bar.open_time).expect("in range") {
                        let close = calendar.close_time(timeframe, bar.open_time).expect("in range");
                        store
                            .create_open_candle("BTCUSDT", timeframe, bar.open_time, close, bar.open)
                            .expect("continuous");
                    }
                    black_box(store.aggregate("BTCUSDT", timeframe, bar, true, 3).expect("continuous"));
                }
                assert_eq!(store.last_close_candle("BTCUSDT", timeframe).map(|c| c.close_time), Some(1_440 * MINUTE - 1));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, boundary_benchmark, store_benchmark);
criterion_main!(benches);
