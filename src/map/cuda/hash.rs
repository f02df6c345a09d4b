//! Host-side wrapper around the device-resident open-addressing table
//!
//! The table is a flat array of `u32` slot values over device memory. Each
//! slot is either `EMPTY_SLOT`, a finalized row index into the dense
//! coordinate storage, or (transiently, inside an insert) a staged input row
//! tagged with `STAGING_FLAG`. Probing is linear over a power-of-two table,
//! with slot claims made by `atomicCAS` on the kernel side.

use cudarc::driver::CudaSlice;

use super::launch;
use crate::error::{Error, Result};
use crate::runtime::cuda::CudaClient;

/// Slot value marking an unoccupied table entry
pub(super) const EMPTY_SLOT: u32 = 0xffff_ffff;

/// High bit tagging a staged (not yet finalized) input row
pub(super) const STAGING_FLAG: u32 = 0x8000_0000;

/// Open-addressing hash table over device memory
pub(super) struct DeviceHashTable {
    slots: CudaSlice<u32>,
    table_size: usize,
}

impl DeviceHashTable {
    /// Allocate a table sized for `capacity` rows at 0.5 max load factor
    pub(super) fn new(client: &CudaClient, capacity: usize) -> Result<Self> {
        if capacity as u64 >= STAGING_FLAG as u64 {
            return Err(Error::invalid_argument(
                "capacity",
                format!("must be below {} rows", STAGING_FLAG),
            ));
        }
        let table_size = (capacity * 2).max(16).next_power_of_two();
        let mut slots = client.stream().alloc_zeros::<u32>(table_size)?;
        launch::table_reset(client, &mut slots, table_size)?;
        Ok(Self { slots, table_size })
    }

    /// Number of slots (a power of two)
    pub(super) fn table_size(&self) -> usize {
        self.table_size
    }

    /// Probe mask, `table_size - 1`
    pub(super) fn mask(&self) -> u32 {
        (self.table_size - 1) as u32
    }

    pub(super) fn slots(&self) -> &CudaSlice<u32> {
        &self.slots
    }

    pub(super) fn slots_mut(&mut self) -> &mut CudaSlice<u32> {
        &mut self.slots
    }
}
