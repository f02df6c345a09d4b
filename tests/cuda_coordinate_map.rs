//! Integration tests for the CUDA coordinate map: insertion, lookup, and
//! derivation operations.
//!
//! These mirror the CPU suite but never assume a particular row numbering:
//! on the GPU, row order falls out of the staged-insert race. Assertions go
//! through `copy_coordinates` and compare coordinate sets or per-pair
//! invariants instead.

#![cfg(feature = "cuda")]

use sparsegrid::prelude::*;

fn new_map(coordinate_size: usize, capacity: usize, tensor_stride: &[u32]) -> CudaCoordinateMap {
    let client = CudaRuntime::default_client(&CudaRuntime::default_device());
    CudaCoordinateMap::with_capacity(&client, coordinate_size, capacity, tensor_stride).unwrap()
}

/// All rows of the map, indexed by row number
fn rows_of(map: &CudaCoordinateMap) -> Vec<Vec<i32>> {
    let d = map.coordinate_size();
    let mut flat = vec![0; map.size() * d];
    map.copy_coordinates(&mut flat).unwrap();
    flat.chunks_exact(d).map(|c| c.to_vec()).collect()
}

fn sorted_rows(map: &CudaCoordinateMap) -> Vec<Vec<i32>> {
    let mut rows = rows_of(map);
    rows.sort();
    rows
}

#[test]
fn insert_deduplicates_equal_coordinates() {
    let mut map = new_map(2, 4, &[1]);
    let size = map.insert(&[0, 0, 0, 2, 0, 2, 1, 4]).unwrap();
    assert_eq!(size, 3);
    assert_eq!(map.size(), 3);
    assert_eq!(
        sorted_rows(&map),
        vec![vec![0, 0], vec![0, 2], vec![1, 4]]
    );
}

#[test]
fn insert_and_map_round_trip() {
    let coords = [
        0, 1, 2, //
        0, 1, 2, // duplicate of input 0
        0, 3, 4, //
        1, 1, 2, //
        0, 3, 4, // duplicate of input 2
    ];
    let mut map = new_map(3, 8, &[1, 1]);
    let (unique_map, inverse_map) = map.insert_and_map(&coords).unwrap();
    assert_eq!(map.size(), 3);
    assert_eq!(unique_map.len(), 3);
    assert_eq!(inverse_map.len(), 5);

    let rows = rows_of(&map);
    // unique_map[r] is the source input position of row r.
    for (r, &src) in unique_map.iter().enumerate() {
        let src = src as usize;
        assert_eq!(rows[r], &coords[src * 3..(src + 1) * 3]);
    }
    // Gathering through inverse_map reconstructs the input batch.
    for (i, &row) in inverse_map.iter().enumerate() {
        assert_eq!(rows[row as usize], &coords[i * 3..(i + 1) * 3]);
    }
}

#[test]
fn find_preserves_query_order_and_drops_misses() {
    let mut map = new_map(2, 4, &[1]);
    map.insert(&[0, 0, 0, 2, 1, 4]).unwrap();

    let queries = [0, 2, 0, 9, 1, 4, 0, 7, 0, 0];
    let (positions, found) = map.find(&queries).unwrap();
    assert_eq!(positions, vec![0, 2, 4]);

    let rows = rows_of(&map);
    for (&p, &row) in positions.iter().zip(&found) {
        let p = p as usize;
        assert_eq!(rows[row as usize], &queries[p * 2..(p + 1) * 2]);
    }
}

#[test]
fn capacity_is_a_hard_bound() {
    let mut map = new_map(2, 2, &[1]);
    let err = map.insert(&[0, 0, 0, 1, 0, 2]).unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded { capacity: 2, .. }));
    // The failed batch was rolled back; the map is still usable.
    assert_eq!(map.size(), 0);
    assert_eq!(map.insert(&[0, 0, 0, 1]).unwrap(), 2);
    // Re-inserting existing coordinates does not consume capacity.
    assert_eq!(map.insert(&[0, 1]).unwrap(), 2);
}

#[test]
fn oversized_batch_fails_instead_of_filling_the_table() {
    // 40 distinct coordinates against a capacity-16 map whose slot table
    // holds 32 entries: more distinct inputs than slots. The staging pass
    // must report capacity exhaustion rather than probe forever.
    let mut map = new_map(2, 16, &[1]);
    let coords: Vec<i32> = (0..40i32).flat_map(|x| [0, x]).collect();
    let err = map.insert(&coords).unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded { capacity: 16, .. }));

    // Rollback left every slot reusable.
    assert_eq!(map.size(), 0);
    let small: Vec<i32> = (0..10i32).flat_map(|x| [0, x]).collect();
    assert_eq!(map.insert(&small).unwrap(), 10);
}

#[test]
fn stride_snaps_negative_coordinates_toward_negative_infinity() {
    let mut map = new_map(2, 4, &[1]);
    map.insert(&[0, -3, 0, -1, 0, 1, 0, 3]).unwrap();
    let strided = map.stride(&[2]).unwrap();
    assert_eq!(strided.tensor_stride(), &[2]);
    assert_eq!(
        sorted_rows(&strided),
        vec![vec![0, -4], vec![0, -2], vec![0, 0], vec![0, 2]]
    );
}

#[test]
fn kernel_map_pairs_satisfy_the_offset_relation() {
    // Points 0, 1, 2 on a line; kernel size 3 connects adjacent pairs.
    let mut map = new_map(2, 3, &[1]);
    map.insert(&[0, 0, 0, 1, 0, 2]).unwrap();
    let region = KernelRegion::cube(&[1], &[3], &[1]).unwrap();
    let km = map.kernel_map(&map, &region).unwrap();

    assert_eq!(km.volume(), 3);
    assert_eq!(km.range(0).len(), 2);
    assert_eq!(km.range(1).len(), 3);
    assert_eq!(km.range(2).len(), 2);

    // Offset for kernel index k is k - 1; every pair must satisfy
    // in = out + offset regardless of how rows were numbered.
    let rows = rows_of(&map);
    for k in 0..3 {
        let offset = k as i32 - 1;
        for (in_row, out_row) in km.pairs(k) {
            let expected = rows[out_row as usize][1] + offset;
            assert_eq!(rows[in_row as usize][1], expected);
        }
    }
}

#[test]
fn stride_map_matches_the_grid_rule() {
    let mut map = new_map(2, 4, &[1]);
    map.insert(&[0, 0, 0, 1, 0, 2, 0, 5]).unwrap();
    let out = map.stride(&[2]).unwrap();
    let sm = map.stride_map(&out).unwrap();
    assert_eq!(sm.len(), map.size());

    let in_rows = rows_of(&map);
    let out_rows = rows_of(&out);
    for (in_row, out_row) in sm.pairs(0) {
        let snapped = in_rows[in_row as usize][1].div_euclid(2) * 2;
        assert_eq!(out_rows[out_row as usize][1], snapped);
    }
}

#[test]
fn origin_map_partitions_rows_by_batch() {
    let mut map = new_map(2, 5, &[1]);
    map.insert(&[0, 7, 2, 1, 0, 3, 2, 9, 5, 0]).unwrap();
    let origin = map.origin().unwrap();
    assert_eq!(origin.size(), 3);
    assert_eq!(
        sorted_rows(&origin),
        vec![vec![0, 0], vec![2, 0], vec![5, 0]]
    );

    let om = map.origin_map(&origin).unwrap();
    assert_eq!(om.len(), map.size());
    let in_rows = rows_of(&map);
    let origin_rows = rows_of(&origin);
    for (in_row, origin_row) in om.pairs(0) {
        assert_eq!(
            origin_rows[origin_row as usize][0],
            in_rows[in_row as usize][0]
        );
    }
}

#[test]
fn prune_recovers_the_row_correspondence() {
    let mut map = new_map(2, 4, &[1]);
    map.insert(&[0, 0, 0, 2, 1, 4, 1, 6]).unwrap();

    // Keep flags are per current row; derive them from the actual row order
    // so the kept set is fixed whatever numbering the insert produced.
    let rows = rows_of(&map);
    let keep: Vec<bool> = rows.iter().map(|c| c[0] == 1).collect();
    let (pruned, km) = map.prune(&keep).unwrap();

    assert_eq!(pruned.size(), 2);
    assert_eq!(sorted_rows(&pruned), vec![vec![1, 4], vec![1, 6]]);

    // Every pair links an old row to the new row holding the same point.
    assert_eq!(km.len(), 2);
    let pruned_rows = rows_of(&pruned);
    for (old_row, new_row) in km.pairs(0) {
        assert!(keep[old_row as usize]);
        assert_eq!(pruned_rows[new_row as usize], rows[old_row as usize]);
    }
}

#[test]
fn stride_region_covers_the_neighborhood() {
    let mut map = new_map(2, 1, &[1]);
    map.insert(&[0, 0]).unwrap();
    let region = KernelRegion::cube(&[1], &[3], &[1]).unwrap();
    let grown = map.stride_region(&region).unwrap();
    assert_eq!(
        sorted_rows(&grown),
        vec![vec![0, -1], vec![0, 0], vec![0, 1]]
    );
}

#[test]
fn empty_batch_operations_are_harmless() {
    let mut map = new_map(2, 4, &[1]);
    assert_eq!(map.insert(&[]).unwrap(), 0);
    let (positions, found) = map.find(&[]).unwrap();
    assert!(positions.is_empty() && found.is_empty());

    let origin = map.origin().unwrap();
    assert_eq!(origin.size(), 0);
    let om = map.origin_map(&origin).unwrap();
    assert!(om.is_empty());
}
