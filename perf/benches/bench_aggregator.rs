use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use pitwall_events::{MAX_MAPPED_VEHICLES, VehicleTelemetry};
use pitwall_icc::{EntityUpdate, FrameAggregator, FrameReader, TickHeuristic};
use pitwall_perf::{make_test_vehicle, temp_shm_dir};

fn aggregator(dir: &std::path::Path) -> FrameAggregator<VehicleTelemetry> {
    FrameAggregator::<VehicleTelemetry>::create(
        dir,
        "$Bench_Telemetry$",
        MAX_MAPPED_VEHICLES,
        TickHeuristic::default(),
    )
    .expect("create failed")
}

/// One full tick: `vehicles` updates closed by the expected count.
fn bench_frame_by_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregator");

    for vehicles in [8usize, 32, 128] {
        let dir = temp_shm_dir(&format!("agg_{vehicles}"));
        let mut agg = aggregator(&dir);
        agg.set_expected_count(Some(vehicles));
        let fleet: Vec<VehicleTelemetry> =
            (0..vehicles as i64).map(|id| make_test_vehicle(id, 0.0)).collect();
        let mut et = 0.0;

        group.throughput(Throughput::Elements(vehicles as u64));
        group.bench_with_input(BenchmarkId::new("tick", vehicles), &fleet, |b, fleet| {
            b.iter(|| {
                et += 0.01;
                for v in fleet {
                    agg.on_entity_update(EntityUpdate {
                        entity_id: v.id,
                        timestamp: et,
                        payload: black_box(*v),
                    });
                }
            });
        });

        drop(agg);
        let _ = std::fs::remove_dir_all(&dir);
    }

    group.finish();
}

/// Without a population hint frames close on the repeated slot.
fn bench_frame_by_repeat(c: &mut Criterion) {
    let dir = temp_shm_dir("agg_repeat");
    let mut agg = aggregator(&dir);
    let fleet: Vec<VehicleTelemetry> = (0..32).map(|id| make_test_vehicle(id, 0.0)).collect();

    let mut group = c.benchmark_group("aggregator");
    group.throughput(Throughput::Elements(fleet.len() as u64));
    group.bench_function("tick (repeat close, 32)", |b| {
        b.iter(|| {
            for v in &fleet {
                agg.on_entity_update(EntityUpdate {
                    entity_id: v.id,
                    timestamp: 1.0,
                    payload: black_box(*v),
                });
            }
        });
    });
    group.finish();

    drop(agg);
    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_read_frame(c: &mut Criterion) {
    let dir = temp_shm_dir("agg_read");
    let mut agg = aggregator(&dir);
    let reader =
        FrameReader::<VehicleTelemetry>::open(&dir, "$Bench_Telemetry$", MAX_MAPPED_VEHICLES)
            .expect("open failed");
    agg.set_expected_count(Some(32));
    for id in 0..32 {
        agg.on_entity_update(EntityUpdate {
            entity_id: id,
            timestamp: 1.0,
            payload: make_test_vehicle(id, 1.0),
        });
    }
    let mut buf = Vec::with_capacity(MAX_MAPPED_VEHICLES);

    let mut group = c.benchmark_group("aggregator");
    group.throughput(Throughput::Elements(32));
    group.bench_function("read_frame (32)", |b| {
        b.iter(|| black_box(reader.read_frame(&mut buf)));
    });
    group.finish();

    drop(reader);
    drop(agg);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(benches, bench_frame_by_count, bench_frame_by_repeat, bench_read_frame);
criterion_main!(benches);
