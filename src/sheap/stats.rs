/*
 * memshield - heap integrity and stack protection for Cortex-M targets
 *
 * SPDX-License-Identifier: MIT
 */

//! Heap usage accounting.

/// Snapshot of heap usage, filled in by [`crate::sheap::heap_statistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HeapStatistics {
    /// Number of currently allocated blocks.
    pub current_allocations: u32,
    /// Bytes the callers actually requested.
    pub user_data_allocated: u32,
    /// Requested bytes rounded up to the allocation unit.
    pub user_data_allocated_aligned: u32,
    /// Aligned bytes plus the metadata overhead of every allocated block.
    pub total_bytes_allocated: u32,
    /// Size of the arena in bytes.
    pub size: usize,
}

#[derive(Clone, Copy)]
pub(crate) enum MemoryOp {
    Alloc,
    Free,
}

impl HeapStatistics {
    /// Books one allocation or deallocation.
    pub(crate) fn update(
        &mut self,
        op: MemoryOp,
        size_aligned: usize,
        size_requested: usize,
        block_size: usize,
    ) {
        match op {
            MemoryOp::Alloc => {
                self.current_allocations += 1;
                self.user_data_allocated_aligned += size_aligned as u32;
                self.user_data_allocated += size_requested as u32;
                self.total_bytes_allocated += block_size as u32;
            }
            MemoryOp::Free => {
                self.current_allocations -= 1;
                self.user_data_allocated_aligned -= size_aligned as u32;
                self.user_data_allocated -= size_requested as u32;
                self.total_bytes_allocated -= block_size as u32;
            }
        }
    }
}
