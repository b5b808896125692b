use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use criterion::{Criterion, criterion_group, criterion_main};

use ao_dispatch::{ActiveObjectConfig, Event, Framework, Hsm};

struct Sink(Arc<AtomicUsize>);

impl Hsm for Sink {
    fn init(&mut self, _par: Option<&Event>) {}
    fn dispatch(&mut self, _e: &Event) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

fn stage_throughput(c: &mut Criterion) {
    let framework = Framework::with_default_config();
    let seen = Arc::new(AtomicUsize::new(0));
    let ao = framework
        .ao_start(Sink(seen), ActiveObjectConfig::new(1, 4096, "bench-sink"), None)
        .unwrap();

    c.bench_function("stage_1000_static_events", |b| {
        b.iter(|| {
            for sig in 0..1000u32 {
                let _ = framework.stage(&ao, Event::Static { sig });
            }
        })
    });
}

fn pool_alloc_gc_cycle(c: &mut Criterion) {
    let framework = Framework::with_default_config();

    c.bench_function("pool_alloc_then_gc", |b| {
        b.iter(|| {
            if let Some(e) = framework.alloc(16, 1) {
                drop(e);
            }
        })
    });
}

criterion_group!(benches, stage_throughput, pool_alloc_gc_cycle);
criterion_main!(benches);
