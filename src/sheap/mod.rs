/*
 * memshield - heap integrity and stack protection for Cortex-M targets
 *
 * SPDX-License-Identifier: MIT
 */

//! The secure heap allocator.
//!
//! Memory block layout:
//!
//! ```text
//! +--------------------+---------+-------+-----------------+--------------------+---------+-------+
//! |   aligned size     |  align  | CRC16 |     PAYLOAD     |   aligned size     |  align  | CRC16 |
//! |   alloc flag       |  offset |       |    USER DATA    |   alloc flag       |  offset |       |
//! +--------------------+---------+-------+-----------------+--------------------+---------+-------+
//! ^------- header (8 or 12 bytes) -------^                 ^------ boundary, a header copy -------^
//! ```
//!
//! The arena is a caller-provided byte span holding blocks head-to-tail with
//! no gaps. Storing both the aligned size and the alignment offset lets the
//! free path recompute the size the user actually requested and inspect the
//! padding bytes behind it: a write of 1..3 bytes past a sub-word request is
//! caught before it ever reaches the boundary tag.
//!
//! What the allocator detects, and when:
//!
//! - double free and free of foreign pointers - at `free`
//! - out-of-bound writes into the alignment padding - at `free`
//! - metadata corruption (header or boundary, any cause) - at `free` and
//!   while selecting a block in `malloc`
//!
//! A detected violation refuses the operation, reports its
//! [`AssertionKind`](crate::report::AssertionKind), and leaves the heap
//! untouched; a block that fails its CRC is never repaired or reclaimed
//! behind the caller's back.
//!
//! ## Concurrency
//!
//! Every mutating entry point holds the heap lock for its full duration.
//! Under an RTOS, bind the lock to a recursive OS mutex via
//! [`install_mutex_port`]; without one, overlapping entry (only possible
//! from an interrupt) is refused and reported as a call overlap.

mod block;
mod ring;
mod stats;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use thiserror::Error;

use crate::config::{
    AllocationStrategy, SHEAP_AUTO_CREATED_BLOCK_ID, SHEAP_CALLOC_VALUE,
    SHEAP_MEMORY_ALLOCATION_STRATEGY, SHEAP_MINIMUM_MALLOC_SIZE, SHEAP_MUTEX_WAIT_TICKS,
};
use crate::report::{assert_failed, AssertionKind};
use crate::sync::{LockGuard, MutexPort, SubsystemLock, SyncError};

use block::{overhead, overwrite, Block, HEADER_SIZE};
use ring::IdRing;
pub use stats::HeapStatistics;
use stats::MemoryOp;

/// The allocation unit: requested sizes are rounded up to a multiple of this.
/// At least 4, so the low bit of the size word stays free for the allocated
/// flag.
const MIN_ALLOC: usize = if SHEAP_MINIMUM_MALLOC_SIZE < 4 {
    4
} else {
    SHEAP_MINIMUM_MALLOC_SIZE
};

/// Failures of the pointer-inspection API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SheapError {
    #[error("pointer does not name an intact allocated block")]
    InvalidPointer,
    #[error("heap lock could not be acquired")]
    LockFailed,
}

struct HeapState {
    min: *mut u8,
    max: *mut u8,
    stats: HeapStatistics,
    ring: IdRing,
}

impl HeapState {
    const fn new() -> Self {
        Self {
            min: ptr::null_mut(),
            max: ptr::null_mut(),
            stats: HeapStatistics {
                current_allocations: 0,
                user_data_allocated: 0,
                user_data_allocated_aligned: 0,
                total_bytes_allocated: 0,
                size: 0,
            },
            ring: IdRing::new(),
        }
    }
}

static mut HEAP: HeapState = HeapState::new();
static HEAP_LOCK: SubsystemLock = SubsystemLock::new();

// =============================================================================
// Public API
// =============================================================================

/// Binds the heap lock to an RTOS mutex. Call before the scheduler starts.
pub fn install_mutex_port(port: &'static dyn MutexPort) {
    HEAP_LOCK.install_port(port);
}

/// Establishes the heap arena.
///
/// The arena is filled with the overwrite pattern and set up as a single
/// free block spanning `size - 2 * header` payload bytes. An arena too small
/// to hold one minimal block, or whose size is not a multiple of the
/// allocation unit, is rejected with `InitInvalidSize` and the heap stays
/// uninitialised.
///
/// # Safety
/// `arena` must point to `size` bytes of writable memory, aligned to 4, that
/// stay valid (and otherwise untouched) for as long as the heap is in use.
/// Must be called before the scheduler starts.
pub unsafe fn init(arena: *mut u8, size: usize) {
    if size < overhead(MIN_ALLOC) || size % MIN_ALLOC != 0 {
        assert_failed(
            AssertionKind::InitInvalidSize,
            "heap init failed due to invalid size",
        );
        return;
    }
    HEAP.min = arena;
    HEAP.max = arena.add(size);
    HEAP.stats = HeapStatistics {
        size,
        ..HeapStatistics::default()
    };
    HEAP.ring.reset();

    overwrite(arena, size);
    let start = Block::at(arena);
    start.write_header(size - 2 * HEADER_SIZE, 0, false, SHEAP_AUTO_CREATED_BLOCK_ID);
    start.write_boundary();
}

/// Rounds `n` up to a multiple of the allocation unit.
pub fn align(n: usize) -> usize {
    n.saturating_add(MIN_ALLOC - 1) & !(MIN_ALLOC - 1)
}

/// Allocates `size` bytes, recording `id` as the caller identifier.
///
/// Returns null - after reporting the kind - when the size is zero, the heap
/// is uninitialised or exhausted, or the selected block fails its integrity
/// check. The payload is not initialised.
///
/// # Safety
/// The returned pointer must be released with [`free`] and not be used after
/// that. The heap must have been set up with [`init`].
pub unsafe fn malloc(size: usize, id: u32) -> *mut u8 {
    alloc_impl(size, id, false)
}

/// Allocates `num * size` bytes with the payload filled with the configured
/// calloc byte. Otherwise identical to [`malloc`].
///
/// # Safety
/// See [`malloc`].
pub unsafe fn calloc(num: usize, size: usize, id: u32) -> *mut u8 {
    let Some(total) = num.checked_mul(size) else {
        assert_failed(AssertionKind::OutOfMemory, "calloc size computation overflowed");
        return ptr::null_mut();
    };
    alloc_impl(total, id, true)
}

/// Releases the block owning `ptr`, recording `id` as the caller identifier.
///
/// The operation is refused - with the matching kind reported and the heap
/// left unchanged - for null pointers, pointers outside the arena, blocks
/// whose header or boundary fails its CRC, blocks whose alignment padding
/// was written past the requested size, and blocks already free. On success
/// the block is merged with free neighbours on both sides.
///
/// # Safety
/// `ptr` must be null or a value previously returned by [`malloc`] /
/// [`calloc`].
pub unsafe fn free(ptr: *mut u8, id: u32) {
    if HEAP.min.is_null() {
        assert_failed(AssertionKind::NotInitialized, "free before heap init");
        return;
    }
    let Some(_guard) = acquire(AssertionKind::FreeCallOverlap, "overlapping call to free") else {
        return;
    };
    if id != 0 {
        HEAP.ring.record(id);
    }
    if ptr.is_null() {
        assert_failed(AssertionKind::NullFree, "free is not valid for a null pointer");
        return;
    }
    if !payload_in_arena(ptr) {
        assert_failed(
            AssertionKind::FreePtrNotInHeap,
            "cannot free a pointer outside of the heap",
        );
        return;
    }
    let block = Block::from_payload(ptr);
    if !block.header_crc_valid() {
        assert_failed(
            AssertionKind::FreeInvalidHeader,
            "free refused: block header is not valid",
        );
        return;
    }
    if !block.boundary_crc_valid() {
        // A valid header with a broken boundary is the signature of an
        // out-of-bound write arriving from the payload side.
        assert_failed(
            AssertionKind::FreeInvalidBoundary,
            "free refused: block boundary is not valid",
        );
        return;
    }

    #[cfg(feature = "free-check-unaligned")]
    if padding_altered(block) {
        assert_failed(
            AssertionKind::OutOfBoundWrite,
            "out-of-bound write detected, free refused",
        );
        return;
    }

    if !block.is_allocated() {
        assert_failed(AssertionKind::DoubleFree, "double free detected");
        return;
    }

    block.clear_allocated();
    HEAP.stats.update(
        MemoryOp::Free,
        block.size(),
        block.requested_size(),
        overhead(block.size()),
    );

    #[cfg(feature = "overwrite-on-free")]
    overwrite(ptr, block.size());

    let (merged, merged_size) = coalesce(block);
    merged.write_header(merged_size, 0, false, id);
    merged.write_boundary();
}

/// Size of the arena in bytes.
pub fn heap_size() -> usize {
    unsafe { HEAP.stats.size }
}

/// Bytes currently allocated, as requested by the callers.
pub fn allocated_bytes() -> usize {
    unsafe { HEAP.stats.user_data_allocated as usize }
}

/// Bytes currently allocated, rounded up to the allocation unit.
pub fn allocated_bytes_aligned() -> usize {
    unsafe { HEAP.stats.user_data_allocated_aligned as usize }
}

/// Copies the current usage counters into `out`.
pub fn heap_statistics(out: &mut HeapStatistics) {
    unsafe {
        *out = HEAP.stats;
    }
}

/// Copies the most recent non-zero caller identifiers into `dest`, newest
/// first. Returns the number of ids written.
pub fn latest_allocation_ids(dest: &mut [u32]) -> usize {
    unsafe { HEAP.ring.latest(dest) }
}

/// Looks up the caller identifier recorded in the block owning `ptr`.
///
/// Fails unless `ptr` lies inside the arena and names an allocated block
/// whose header and boundary are intact.
///
/// # Safety
/// `ptr` may be any value; only intact allocated blocks are dereferenced
/// beyond their metadata.
#[cfg(feature = "extended-header")]
pub unsafe fn allocation_id(ptr: *const u8) -> Result<u32, SheapError> {
    let _guard = HEAP_LOCK
        .acquire(SHEAP_MUTEX_WAIT_TICKS)
        .map_err(|_| SheapError::LockFailed)?;
    if HEAP.min.is_null() || ptr.is_null() || !payload_in_arena(ptr as *mut u8) {
        return Err(SheapError::InvalidPointer);
    }
    let block = Block::from_payload(ptr as *mut u8);
    if !block.header_crc_valid() || !block.boundary_crc_valid() || !block.is_allocated() {
        return Err(SheapError::InvalidPointer);
    }
    Ok(block.id())
}

// =============================================================================
// Allocation internals
// =============================================================================

/// Acquires the heap lock, classifying portless contention as the given
/// overlap kind. Mutex failures are reported by the lock layer itself.
fn acquire(overlap_kind: AssertionKind, overlap_msg: &'static str) -> Option<LockGuard<'static>> {
    match HEAP_LOCK.acquire(SHEAP_MUTEX_WAIT_TICKS) {
        Ok(guard) => Some(guard),
        Err(SyncError::Contended) => {
            assert_failed(overlap_kind, overlap_msg);
            None
        }
        Err(_) => None,
    }
}

unsafe fn alloc_impl(size: usize, id: u32, fill_payload: bool) -> *mut u8 {
    if HEAP.min.is_null() {
        assert_failed(
            AssertionKind::NotInitialized,
            "allocation is not possible before heap init",
        );
        return ptr::null_mut();
    }
    let Some(_guard) = acquire(
        AssertionKind::MallocCallOverlap,
        "overlapping call to an allocation entry point",
    ) else {
        return ptr::null_mut();
    };
    if id != 0 {
        HEAP.ring.record(id);
    }
    if size == 0 {
        assert_failed(
            AssertionKind::SizeZeroAlloc,
            "cannot allocate a size of zero",
        );
        return ptr::null_mut();
    }
    allocate_block(size, id, fill_payload)
}

unsafe fn allocate_block(size: usize, id: u32, fill_payload: bool) -> *mut u8 {
    let mut size_aligned = align(size);
    let Some(block) = next_free_block_of_size(size_aligned) else {
        return ptr::null_mut();
    };

    let pre_alloc_size = block.size();
    if pre_alloc_size < overhead(size_aligned) + MIN_ALLOC + 2 * HEADER_SIZE {
        // The residue could not hold a minimal block; absorb it so the
        // head-to-tail walk stays gapless.
        size_aligned = pre_alloc_size;
    }

    block.write_header(size_aligned, size, true, id);
    block.write_boundary();
    HEAP.stats.update(MemoryOp::Alloc, size_aligned, size, overhead(size_aligned));

    if size_aligned < pre_alloc_size {
        let remainder = block.next();
        remainder.write_header(
            pre_alloc_size - overhead(size_aligned),
            0,
            false,
            SHEAP_AUTO_CREATED_BLOCK_ID,
        );
        remainder.write_boundary();
    }

    let payload = block.payload();
    if fill_payload {
        ptr::write_bytes(payload, SHEAP_CALLOC_VALUE, size);
        // The padding keeps the overwrite pattern so the free-time
        // out-of-bound check stays meaningful for calloc'd blocks.
        overwrite(payload.add(size), size_aligned - size);
    }
    payload
}

unsafe fn next_free_block_of_size(size_aligned: usize) -> Option<Block> {
    match SHEAP_MEMORY_ALLOCATION_STRATEGY {
        AllocationStrategy::FirstFit => {
            let mut current = Block::at(HEAP.min);
            while (current.addr() as usize) < HEAP.max as usize
                && (current.is_allocated() || current.size() < size_aligned)
            {
                current = current.next();
            }
            if current.addr() as usize >= HEAP.max as usize {
                assert_failed(AssertionKind::OutOfMemory, "no memory available");
                return None;
            }
            if !current.crc_valid() {
                assert_failed(
                    AssertionKind::InvalidBlock,
                    "found an invalid block, it may have been altered",
                );
                return None;
            }
            Some(current)
        }
    }
}

fn payload_in_arena(ptr: *mut u8) -> bool {
    unsafe {
        let addr = ptr as usize;
        addr >= HEAP.min as usize + HEADER_SIZE && addr < HEAP.max as usize - HEADER_SIZE
    }
}

#[cfg(feature = "free-check-unaligned")]
unsafe fn padding_altered(block: Block) -> bool {
    let padding = block.payload().add(block.requested_size());
    for i in 0..block.alignment_offset() {
        if *padding.add(i) != crate::config::SHEAP_OVERWRITE_VALUE {
            return true;
        }
    }
    false
}

/// Merges the freed block with its free neighbours and returns the header of
/// the merged extent together with its payload size. Stale interior metadata
/// is overwritten; a neighbour failing its CRC is reported and left alone.
unsafe fn coalesce(block: Block) -> (Block, usize) {
    let mut block = block;
    let mut size = block.size();

    if next_block_is_free(block) {
        let next = block.next();
        if next.crc_valid() {
            size += next.size() + 2 * HEADER_SIZE;
            next.clear_header();
            block.clear_boundary();
        } else {
            assert_failed(
                AssertionKind::CoalescingNextInvalidCrc,
                "cannot coalesce with the next block, it is not valid",
            );
        }
    }
    if prev_block_is_free(block) {
        let prev = block.prev();
        if prev.crc_valid() {
            size += prev.size() + 2 * HEADER_SIZE;
            block.clear_header();
            prev.clear_boundary();
            block = prev;
        } else {
            assert_failed(
                AssertionKind::CoalescingPrevInvalidCrc,
                "cannot coalesce with the previous block, it is not valid",
            );
        }
    }
    (block, size)
}

unsafe fn next_block_is_free(block: Block) -> bool {
    let next = block.next();
    (next.addr() as usize) < HEAP.max as usize - overhead(MIN_ALLOC) && !next.is_allocated()
}

unsafe fn prev_block_is_free(block: Block) -> bool {
    let prev_boundary = block.prev_boundary();
    prev_boundary.addr() as usize >= HEAP.min as usize && !prev_boundary.is_allocated()
}

// =============================================================================
// GlobalAlloc bridge
// =============================================================================

/// Adapter that lets Rust's `alloc` crate run on the secure heap.
///
/// ```ignore
/// #[global_allocator]
/// static ALLOCATOR: memshield::sheap::SheapAllocator = memshield::sheap::SheapAllocator;
/// ```
///
/// The heap guarantees 4-byte payload alignment; layouts requesting more are
/// refused with a null return.
pub struct SheapAllocator;

unsafe impl GlobalAlloc for SheapAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MIN_ALLOC {
            return ptr::null_mut();
        }
        malloc(layout.size(), 0)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr, 0);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let payload = self.alloc(layout);
        if !payload.is_null() {
            ptr::write_bytes(payload, 0, layout.size());
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(8))]
    struct Arena([u8; 256]);

    // The heap state is process-global, so this stays a single test; the
    // full behavioral suite lives in the integration tests with their own
    // serialization.
    #[test]
    fn global_alloc_bridge_round_trips() {
        static mut ARENA: Arena = Arena([0; 256]);
        unsafe {
            init(ARENA.0.as_mut_ptr(), 256);

            let allocator = SheapAllocator;
            let layout = Layout::from_size_align(24, 4).unwrap();
            let p = allocator.alloc(layout);
            assert!(!p.is_null());

            let zeroed_layout = Layout::from_size_align(8, 1).unwrap();
            let z = allocator.alloc_zeroed(zeroed_layout);
            assert!(!z.is_null());
            for i in 0..8 {
                assert_eq!(*z.add(i), 0);
            }

            // More alignment than the heap guarantees is refused.
            let over_aligned = Layout::from_size_align(16, 16).unwrap();
            assert!(allocator.alloc(over_aligned).is_null());

            allocator.dealloc(p, layout);
            allocator.dealloc(z, zeroed_layout);
            assert_eq!(allocated_bytes(), 0);
            assert_eq!(HEAP.stats.current_allocations, 0);
        }
    }
}
