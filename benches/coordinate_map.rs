//! Benchmarks for the hot paths of sparse convolution coordinate
//! management: batch insertion, striding, and kernel-map construction.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use sparsegrid::prelude::*;

/// Batched 3D coordinates on a cube grid of the given side length.
fn grid_coords(side: i32) -> Vec<i32> {
    let mut coords = Vec::with_capacity((side * side * side) as usize * 4);
    for x in 0..side {
        for y in 0..side {
            for z in 0..side {
                coords.extend_from_slice(&[0, x, y, z]);
            }
        }
    }
    coords
}

fn populated_map(coords: &[i32]) -> CpuCoordinateMap {
    let client = CpuRuntime::default_client(&CpuRuntime::default_device());
    let mut map =
        CpuCoordinateMap::with_capacity(&client, 4, coords.len() / 4, &[1, 1, 1]).unwrap();
    map.insert(coords).unwrap();
    map
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    for side in [8, 16, 32] {
        let coords = grid_coords(side);
        let n = coords.len() / 4;
        group.bench_with_input(BenchmarkId::from_parameter(n), &coords, |b, coords| {
            let client = CpuRuntime::default_client(&CpuRuntime::default_device());
            b.iter(|| {
                let mut map =
                    CpuCoordinateMap::with_capacity(&client, 4, n, &[1, 1, 1]).unwrap();
                black_box(map.insert_and_map(coords).unwrap())
            });
        });
    }
    group.finish();
}

fn bench_stride(c: &mut Criterion) {
    let mut group = c.benchmark_group("stride");
    for side in [16, 32] {
        let map = populated_map(&grid_coords(side));
        group.bench_with_input(BenchmarkId::from_parameter(map.size()), &map, |b, map| {
            b.iter(|| black_box(map.stride(&[2, 2, 2]).unwrap()));
        });
    }
    group.finish();
}

fn bench_kernel_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("kernel_map");
    for side in [8, 16] {
        let map = populated_map(&grid_coords(side));
        let down = map.stride(&[2, 2, 2]).unwrap();
        let region = KernelRegion::cube(&[1, 1, 1], &[3, 3, 3], &[1, 1, 1]).unwrap();
        group.bench_with_input(
            BenchmarkId::from_parameter(map.size()),
            &(map, down, region),
            |b, (map, down, region)| {
                b.iter(|| black_box(map.kernel_map(down, region).unwrap()));
            },
        );
    }
    group.finish();
}

fn bench_origin_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("origin_map");
    let mut coords = Vec::new();
    for batch in 0..8 {
        for x in 0..16 {
            for y in 0..16 {
                coords.extend_from_slice(&[batch, x, y, 0]);
            }
        }
    }
    let map = populated_map(&coords);
    let origin = map.origin().unwrap();
    group.bench_function(BenchmarkId::from_parameter(map.size()), |b| {
        b.iter(|| black_box(map.origin_map(&origin).unwrap()));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_insert,
    bench_stride,
    bench_kernel_map,
    bench_origin_map
);
criterion_main!(benches);
