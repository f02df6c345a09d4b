//! Coordinate map manager: a registry of maps keyed by tensor stride
//!
//! The manager is the external-facing surface of the engine. Callers hold
//! opaque [`CoordinateMapKey`]s (tensor stride + identifying string) and ask
//! the manager to populate, derive, and connect maps by key; the binding
//! layer never touches a map directly. Keys may be created before any map
//! exists (lazy binding) - the manager materializes a map for a key when it
//! is first populated.
//!
//! Kernel maps are cached per (input key, output key, kernel parameters):
//! re-requesting the same connection returns the cached result without
//! re-running neighbor search.

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::kernel_map::KernelMap;
use crate::map::{derived_tensor_stride, CoordinateMap};
use crate::region::{KernelRegion, RegionType};

/// Opaque registry key: tensor stride plus identifying string
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CoordinateMapKey {
    tensor_stride: Vec<u32>,
    id: String,
}

impl CoordinateMapKey {
    /// Create a key for the given stride and label
    pub fn new(tensor_stride: &[u32], id: impl Into<String>) -> Self {
        Self {
            tensor_stride: tensor_stride.to_vec(),
            id: id.into(),
        }
    }

    /// Tensor stride component of the key
    pub fn tensor_stride(&self) -> &[u32] {
        &self.tensor_stride
    }

    /// String label component of the key
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for CoordinateMapKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:\"{}\"", self.tensor_stride, self.id)
    }
}

/// Cache key for kernel maps
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct KernelMapCacheKey {
    in_key: CoordinateMapKey,
    out_key: CoordinateMapKey,
    kernel_size: Vec<u32>,
    dilation: Vec<u32>,
    region_type: RegionType,
    offsets: Vec<i32>,
}

/// Registry of coordinate maps and cached kernel maps
///
/// Generic over the backend map type; the manager itself contains no
/// execution logic.
pub struct CoordinateMapManager<M: CoordinateMap> {
    ctx: M::Ctx,
    coordinate_size: usize,
    maps: FxHashMap<CoordinateMapKey, M>,
    kernel_maps: FxHashMap<KernelMapCacheKey, KernelMap>,
    prune_count: usize,
}

impl<M: CoordinateMap> CoordinateMapManager<M> {
    /// Create an empty manager for coordinate size `D`
    pub fn new(ctx: M::Ctx, coordinate_size: usize) -> Self {
        Self {
            ctx,
            coordinate_size,
            maps: FxHashMap::default(),
            kernel_maps: FxHashMap::default(),
            prune_count: 0,
        }
    }

    /// Coordinate size `D` of every map in this manager
    pub fn coordinate_size(&self) -> usize {
        self.coordinate_size
    }

    /// True if a map is registered under `key`
    pub fn exists(&self, key: &CoordinateMapKey) -> bool {
        self.maps.contains_key(key)
    }

    /// Number of rows in the map under `key`
    pub fn size(&self, key: &CoordinateMapKey) -> Result<usize> {
        Ok(self.get(key)?.size())
    }

    /// Borrow the map under `key`
    pub fn get(&self, key: &CoordinateMapKey) -> Result<&M> {
        self.maps
            .get(key)
            .ok_or_else(|| Error::MapNotFound {
                key: key.to_string(),
            })
    }

    /// Insert a coordinate buffer under a fresh key, deduplicating
    ///
    /// Returns the key plus the `(unique_map, inverse_map)` pair of
    /// [`CoordinateMap::insert_and_map`]. Re-populating an existing key is
    /// rejected: maps are append-only and exclusively owned by their entry.
    pub fn insert_and_map(
        &mut self,
        coordinates: &[i32],
        tensor_stride: &[u32],
        id: impl Into<String>,
    ) -> Result<(CoordinateMapKey, Vec<u32>, Vec<u32>)> {
        let key = CoordinateMapKey::new(tensor_stride, id);
        if self.exists(&key) {
            return Err(Error::invalid_argument(
                "key",
                format!("coordinate map already exists for key {}", key),
            ));
        }
        let capacity = coordinates.len() / self.coordinate_size;
        let mut map =
            M::with_capacity(&self.ctx, self.coordinate_size, capacity, tensor_stride)?;
        let (unique_map, inverse_map) = map.insert_and_map(coordinates)?;
        self.maps.insert(key.clone(), map);
        Ok((key, unique_map, inverse_map))
    }

    /// Derive (or look up) the strided map of `key`
    ///
    /// The derived key shares the source label with the elementwise product
    /// stride; if a map already exists under it, the existing map is kept.
    pub fn stride(
        &mut self,
        key: &CoordinateMapKey,
        stride_factors: &[u32],
    ) -> Result<CoordinateMapKey> {
        let map = self.get(key)?;
        let out_stride = derived_tensor_stride(map.tensor_stride(), stride_factors)?;
        let out_key = CoordinateMapKey::new(&out_stride, key.id());
        if !self.exists(&out_key) {
            let derived = self.get(key)?.stride(stride_factors)?;
            self.maps.insert(out_key.clone(), derived);
        }
        Ok(out_key)
    }

    /// Derive (or look up) the region-expanded map of `key`
    pub fn stride_region(
        &mut self,
        key: &CoordinateMapKey,
        region: &KernelRegion,
    ) -> Result<CoordinateMapKey> {
        let map = self.get(key)?;
        let out_key = CoordinateMapKey::new(map.tensor_stride(), format!("{}/region", key.id()));
        if !self.exists(&out_key) {
            let derived = self.get(key)?.stride_region(region)?;
            self.maps.insert(out_key.clone(), derived);
        }
        Ok(out_key)
    }

    /// Kernel map connecting the maps under `in_key` and `out_key`
    ///
    /// The region is built on the input map's tensor stride from the given
    /// kernel size, dilation, and region type; `offsets` supplies the
    /// explicit list for [`RegionType::Custom`]. Results are cached.
    pub fn kernel_map(
        &mut self,
        in_key: &CoordinateMapKey,
        out_key: &CoordinateMapKey,
        kernel_size: &[u32],
        dilation: &[u32],
        region_type: RegionType,
        offsets: Option<&[i32]>,
    ) -> Result<&KernelMap> {
        let cache_key = KernelMapCacheKey {
            in_key: in_key.clone(),
            out_key: out_key.clone(),
            kernel_size: kernel_size.to_vec(),
            dilation: dilation.to_vec(),
            region_type,
            offsets: offsets.unwrap_or_default().to_vec(),
        };
        if !self.kernel_maps.contains_key(&cache_key) {
            let in_map = self.get(in_key)?;
            let out_map = self.get(out_key)?;
            let region = match region_type {
                RegionType::HyperCube => {
                    KernelRegion::cube(in_map.tensor_stride(), kernel_size, dilation)?
                }
                RegionType::HyperCross => {
                    KernelRegion::cross(in_map.tensor_stride(), kernel_size, dilation)?
                }
                RegionType::Custom => {
                    let offsets = offsets.ok_or_else(|| {
                        Error::invalid_argument("offsets", "required for custom regions")
                    })?;
                    KernelRegion::custom(in_map.tensor_stride(), offsets.to_vec())?
                }
            };
            let km = in_map.kernel_map(out_map, &region)?;
            self.kernel_maps.insert(cache_key.clone(), km);
        }
        Ok(&self.kernel_maps[&cache_key])
    }

    /// Derive (or look up) the origin (batch-reduction) map of `key`
    pub fn origin(&mut self, key: &CoordinateMapKey) -> Result<CoordinateMapKey> {
        let map = self.get(key)?;
        let origin_stride = vec![0; map.tensor_stride().len()];
        let origin_key = CoordinateMapKey::new(&origin_stride, key.id());
        if !self.exists(&origin_key) {
            let origin = self.get(key)?.origin()?;
            self.maps.insert(origin_key.clone(), origin);
        }
        Ok(origin_key)
    }

    /// Fan-in map from every row of `key` to its batch origin row
    pub fn origin_map(&mut self, key: &CoordinateMapKey) -> Result<(CoordinateMapKey, KernelMap)> {
        let origin_key = self.origin(key)?;
        let map = self.get(key)?;
        let origin = self.get(&origin_key)?;
        let km = map.origin_map(origin)?;
        Ok((origin_key, km))
    }

    /// Prune the map under `key` with per-row keep flags
    ///
    /// Registers the compacted map under a fresh key and returns it with the
    /// (old row, new row) correspondence.
    pub fn prune(
        &mut self,
        key: &CoordinateMapKey,
        keep: &[bool],
    ) -> Result<(CoordinateMapKey, KernelMap)> {
        let map = self.get(key)?;
        let (pruned, km) = map.prune(keep)?;
        let tensor_stride = map.tensor_stride().to_vec();
        self.prune_count += 1;
        let out_key = CoordinateMapKey::new(
            &tensor_stride,
            format!("{}/pruned:{}", key.id(), self.prune_count),
        );
        self.maps.insert(out_key.clone(), pruned);
        Ok((out_key, km))
    }

    /// Materialize the coordinates of the map under `key`, row-major
    pub fn get_coordinates(&self, key: &CoordinateMapKey) -> Result<Vec<i32>> {
        let map = self.get(key)?;
        let mut out = vec![0; map.size() * map.coordinate_size()];
        map.copy_coordinates(&mut out)?;
        Ok(out)
    }
}

#[cfg(all(test, feature = "cpu"))]
mod tests {
    use super::*;
    use crate::map::CpuCoordinateMap;
    use crate::runtime::cpu::{CpuDevice, CpuRuntime};
    use crate::runtime::Runtime;

    fn manager() -> CoordinateMapManager<CpuCoordinateMap> {
        let client = CpuRuntime::default_client(&CpuDevice::new());
        CoordinateMapManager::new(client, 2)
    }

    #[test]
    fn test_insert_and_lookup_by_key() {
        let mut m = manager();
        let (key, unique, inverse) = m
            .insert_and_map(&[0, 0, 0, 2, 0, 2, 1, 4], &[1], "")
            .unwrap();
        assert_eq!(m.size(&key).unwrap(), 3);
        assert_eq!(unique.len(), 3);
        assert_eq!(inverse.len(), 4);
        assert_eq!(key.tensor_stride(), &[1]);
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let m = manager();
        let key = CoordinateMapKey::new(&[1], "absent");
        assert!(matches!(m.size(&key), Err(Error::MapNotFound { .. })));
    }

    #[test]
    fn test_stride_registers_derived_key() {
        let mut m = manager();
        let (key, _, _) = m.insert_and_map(&[0, 0, 0, 2, 1, 4], &[1], "").unwrap();
        let out_key = m.stride(&key, &[2]).unwrap();
        assert_eq!(out_key.tensor_stride(), &[2]);
        assert_eq!(m.size(&out_key).unwrap(), 3);
        // Re-striding reuses the registered map.
        let again = m.stride(&key, &[2]).unwrap();
        assert_eq!(again, out_key);
    }

    #[test]
    fn test_kernel_map_is_cached() {
        let mut m = manager();
        let (key, _, _) = m
            .insert_and_map(&[0, 0, 0, 1, 0, 2, 0, 3], &[1], "")
            .unwrap();
        let out_key = m.stride(&key, &[2]).unwrap();
        let len = m
            .kernel_map(&key, &out_key, &[2], &[1], RegionType::HyperCube, None)
            .unwrap()
            .len();
        assert_eq!(len, 4);
        let len_again = m
            .kernel_map(&key, &out_key, &[2], &[1], RegionType::HyperCube, None)
            .unwrap()
            .len();
        assert_eq!(len, len_again);
    }

    #[test]
    fn test_origin_and_prune_keys() {
        let mut m = manager();
        let (key, _, _) = m
            .insert_and_map(&[0, 0, 1, 2, 1, 4], &[1], "feat")
            .unwrap();
        let (origin_key, km) = m.origin_map(&key).unwrap();
        assert_eq!(m.size(&origin_key).unwrap(), 2);
        assert_eq!(km.len(), 3);

        let (pruned_key, pm) = m.prune(&key, &[true, false, true]).unwrap();
        assert_eq!(m.size(&pruned_key).unwrap(), 2);
        assert_eq!(pm.len(), 2);
        assert_ne!(pruned_key, key);
    }

    #[test]
    fn test_get_coordinates_round_trip() {
        let mut m = manager();
        let coords = [0, 0, 0, 2, 1, 4];
        let (key, _, _) = m.insert_and_map(&coords, &[1], "").unwrap();
        assert_eq!(m.get_coordinates(&key).unwrap(), coords);
    }
}
