// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Throughput benchmarks for the lock-free SPSC byte ring and the seqlock
// mailbox, the two primitives every PCM stream moves bytes through.
//
// Run with:
//   cargo bench --bench fifo
//
// Groups:
//   fifo_write_read — single-threaded write-then-drain round trip at three
//                     message sizes relative to a 64 KiB ring
//   mbx_write_read  — seqlock mailbox publish/read round trip (fixed size)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use dspd_client::{Fifo, Mbx};

const RING_CAPACITY: u32 = 64 * 1024;

const SIZES: &[(&str, usize)] = &[("small_64", 64), ("medium_1024", 1024), ("large_16384", 16384)];

fn bench_fifo_write_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("fifo_write_read");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let mut storage = vec![0u8; Fifo::storage_size(RING_CAPACITY) as usize];
            let fifo = unsafe { Fifo::from_raw(storage.as_mut_ptr(), RING_CAPACITY, true) };
            let src = vec![0xABu8; sz];
            let mut dst = vec![0u8; sz];
            b.iter(|| {
                fifo.write(&src).unwrap();
                let n = fifo.read(&mut dst).unwrap();
                black_box(n);
            });
        });
    }

    group.finish();
}

#[derive(Clone, Copy)]
struct Status {
    frames: u64,
    xruns: u32,
}

fn bench_mbx_write_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("mbx_write_read");
    group.throughput(Throughput::Elements(1));

    group.bench_function("publish_read", |b| {
        let mut storage = vec![0u8; Mbx::<Status>::storage_size()];
        let mbx = unsafe { Mbx::<Status>::from_raw(storage.as_mut_ptr(), true) };
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            mbx.write(Status { frames: counter, xruns: 0 });
            let read = mbx.read();
            black_box(read);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_fifo_write_read, bench_mbx_write_read);
criterion_main!(benches);
