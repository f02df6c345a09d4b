//! Integration tests for kernel-map construction: regions, neighbor search,
//! stride maps, and origin maps.

#![cfg(feature = "cpu")]

use sparsegrid::prelude::*;

fn new_map(coordinate_size: usize, capacity: usize, tensor_stride: &[u32]) -> CpuCoordinateMap {
    let client = CpuRuntime::default_client(&CpuRuntime::default_device());
    CpuCoordinateMap::with_capacity(&client, coordinate_size, capacity, tensor_stride).unwrap()
}

/// A dense 4x4 grid of (batch 0) 2D points.
fn dense_grid() -> CpuCoordinateMap {
    let mut coords = Vec::new();
    for x in 0..4 {
        for y in 0..4 {
            coords.extend_from_slice(&[0, x, y]);
        }
    }
    let mut map = new_map(3, 16, &[1, 1]);
    map.insert(&coords).unwrap();
    map
}

#[test]
fn pointwise_kernel_map_is_the_identity() {
    let map = dense_grid();
    let region = KernelRegion::cube(&[1, 1], &[1, 1], &[1, 1]).unwrap();
    assert_eq!(region.volume(), 1);

    let km = map.kernel_map(&map, &region).unwrap();
    assert_eq!(km.len(), 16);
    assert_eq!(km.volume(), 1);
    for (in_row, out_row) in km.pairs(0) {
        assert_eq!(in_row, out_row);
    }
}

#[test]
fn cube_kernel_map_counts_interior_and_border_neighbors() {
    let map = dense_grid();
    let region = KernelRegion::cube(&[1, 1], &[3, 3], &[1, 1]).unwrap();
    assert_eq!(region.volume(), 9);

    let km = map.kernel_map(&map, &region).unwrap();
    // Per output point, one pair per in-bounds neighbor: 4 corners with 4,
    // 8 edge points with 6, 4 interior points with 9.
    assert_eq!(km.len(), 4 * 4 + 8 * 6 + 4 * 9);

    // The center kernel index pairs every point with itself.
    let center = 4;
    let pairs: Vec<_> = km.pairs(center).collect();
    assert_eq!(pairs.len(), 16);
    assert!(pairs.iter().all(|&(i, o)| i == o));
}

#[test]
fn strided_kernel_map_covers_each_output_once_per_offset() {
    let map = dense_grid();
    let down = map.stride(&[2, 2]).unwrap();
    assert_eq!(down.size(), 4);

    // Kernel size 2 on the input stride grid: offsets {0, 1} per axis.
    let region = KernelRegion::cube(&[1, 1], &[2, 2], &[1, 1]).unwrap();
    let km = map.kernel_map(&down, &region).unwrap();

    // Every (output, offset) pair hits a distinct input on a dense grid.
    assert_eq!(km.len(), 4 * 4);
    for k in 0..km.volume() {
        assert_eq!(km.in_rows(k).len(), 4);
    }
}

#[test]
fn transposed_kernel_map_swaps_directions() {
    let map = dense_grid();
    let down = map.stride(&[2, 2]).unwrap();
    let region = KernelRegion::cube(&[1, 1], &[2, 2], &[1, 1]).unwrap();
    let km = map.kernel_map(&down, &region).unwrap();

    let t = km.transposed();
    assert_eq!(t.len(), km.len());
    for k in 0..km.volume() {
        assert_eq!(t.in_rows(k), km.out_rows(k));
        assert_eq!(t.out_rows(k), km.in_rows(k));
    }
}

#[test]
fn hypercross_region_skips_diagonal_neighbors() {
    let map = dense_grid();
    let region = KernelRegion::cross(&[1, 1], &[3, 3], &[1, 1]).unwrap();
    // 1 + (3 - 1) + (3 - 1)
    assert_eq!(region.volume(), 5);

    let km = map.kernel_map(&map, &region).unwrap();
    // Axis neighbors only: corners have 3, edges 4, interior 5.
    assert_eq!(km.len(), 4 * 3 + 8 * 4 + 4 * 5);
}

#[test]
fn stride_map_sends_every_row_to_its_snapped_cell() {
    let map = dense_grid();
    let down = map.stride(&[2, 2]).unwrap();
    let km = map.stride_map(&down).unwrap();

    assert_eq!(km.volume(), 1);
    assert_eq!(km.len(), map.size());

    let mut in_coords = vec![0; map.size() * 3];
    map.copy_coordinates(&mut in_coords).unwrap();
    let mut out_coords = vec![0; down.size() * 3];
    down.copy_coordinates(&mut out_coords).unwrap();

    for (in_row, out_row) in km.pairs(0) {
        let i = in_row as usize * 3;
        let o = out_row as usize * 3;
        assert_eq!(out_coords[o], in_coords[i]);
        assert_eq!(out_coords[o + 1], in_coords[i + 1] & !1);
        assert_eq!(out_coords[o + 2], in_coords[i + 2] & !1);
    }
}

#[test]
fn origin_map_fans_every_row_into_its_batch() {
    let mut map = new_map(2, 6, &[1]);
    map.insert(&[0, 10, 0, 20, 2, 10, 2, 20, 2, 30, 5, 0]).unwrap();

    let origin = map.origin().unwrap();
    assert_eq!(origin.size(), 3);
    assert_eq!(origin.tensor_stride(), &[0]);

    let km = map.origin_map(&origin).unwrap();
    assert_eq!(km.len(), map.size());

    // Rows of one batch share one origin row.
    let mut coords = vec![0; map.size() * 2];
    map.copy_coordinates(&mut coords).unwrap();
    let mut origin_of_batch = std::collections::HashMap::new();
    for (in_row, out_row) in km.pairs(0) {
        let batch = coords[in_row as usize * 2];
        let prev = origin_of_batch.entry(batch).or_insert(out_row);
        assert_eq!(*prev, out_row);
    }
    assert_eq!(origin_of_batch.len(), 3);
}

#[test]
fn stride_region_contains_every_shifted_coordinate() {
    let mut map = new_map(2, 2, &[1]);
    map.insert(&[0, 0, 0, 4]).unwrap();

    let region = KernelRegion::cube(&[1], &[3], &[1]).unwrap();
    let expanded = map.stride_region(&region).unwrap();

    // {-1, 0, 1} around 0 and 4: six distinct points.
    assert_eq!(expanded.size(), 6);
    assert_eq!(expanded.tensor_stride(), map.tensor_stride());
    let (positions, _) = expanded
        .find(&[0, -1, 0, 0, 0, 1, 0, 3, 0, 4, 0, 5])
        .unwrap();
    assert_eq!(positions.len(), 6);
}

#[test]
fn custom_region_offsets_are_taken_verbatim() {
    let mut map = new_map(2, 4, &[1]);
    map.insert(&[0, 0, 0, 3, 0, 6, 0, 7]).unwrap();

    // A two-offset custom region reaching 3 to the left and 0.
    let region = KernelRegion::custom(&[1], vec![-3, 0]).unwrap();
    assert_eq!(region.volume(), 2);

    let km = map.kernel_map(&map, &region).unwrap();
    // Offset -3 matches outputs 3, 6; offset 0 matches all four.
    assert_eq!(km.in_rows(0).len(), 2);
    assert_eq!(km.in_rows(1).len(), 4);
}
