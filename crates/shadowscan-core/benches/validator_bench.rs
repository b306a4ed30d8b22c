//! Access validator overhead benchmarks.
//!
//! The accept path runs on every instrumented access, so it must stay a
//! handful of shadow loads.

use criterion::{Criterion, criterion_group, criterion_main};
use shadowscan_core::shadow::{ShadowConfig, ShadowMemory, with_tag};
use shadowscan_core::validator::AccessValidator;

const BASE: usize = 0x1000_0000;

fn shadow(tag_mode: bool) -> ShadowMemory {
    let shadow = ShadowMemory::new(&ShadowConfig {
        base: BASE,
        len: 1 << 20,
        granule: 8,
        tag_mode,
    })
    .expect("geometry");
    shadow.unpoison(BASE, 4096).expect("unpoison");
    shadow.set_tag(BASE, 4096, 0x2A).expect("tag");
    shadow
}

fn bench_accept_8(c: &mut Criterion) {
    let shadow = shadow(false);
    let validator = AccessValidator::new(&shadow);
    c.bench_function("validate_accept_8", |b| {
        b.iter(|| {
            criterion::black_box(validator.validate(criterion::black_box(BASE + 64), 8, false, 0));
        });
    });
}

fn bench_accept_128(c: &mut Criterion) {
    let shadow = shadow(false);
    let validator = AccessValidator::new(&shadow);
    c.bench_function("validate_accept_128", |b| {
        b.iter(|| {
            criterion::black_box(validator.validate(criterion::black_box(BASE + 64), 128, true, 0));
        });
    });
}

fn bench_accept_tagged(c: &mut Criterion) {
    let shadow = shadow(true);
    let validator = AccessValidator::new(&shadow);
    let ptr = with_tag(BASE + 64, 0x2A);
    c.bench_function("validate_accept_tagged", |b| {
        b.iter(|| {
            criterion::black_box(validator.validate(criterion::black_box(ptr), 16, false, 0));
        });
    });
}

fn bench_reject(c: &mut Criterion) {
    let shadow = shadow(false);
    let validator = AccessValidator::new(&shadow);
    c.bench_function("validate_reject_boundary", |b| {
        b.iter(|| {
            criterion::black_box(validator.validate(criterion::black_box(BASE + 4092), 8, false, 0));
        });
    });
}

criterion_group!(
    benches,
    bench_accept_8,
    bench_accept_128,
    bench_accept_tagged,
    bench_reject
);
criterion_main!(benches);
