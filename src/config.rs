/*
 * memshield - heap integrity and stack protection for Cortex-M targets
 *
 * SPDX-License-Identifier: MIT
 */

//! Build-time configuration.
//!
//! Major toggles are Cargo features; numeric values live here as constants.
//! Users needing different values are expected to adjust this module (or
//! shadow the values in their own fork), the same way an RTOS configuration
//! header is edited per project.

/// Capacity of the ring that records the most recent caller identifiers
/// passed to the allocation entry points. Must be greater than zero.
pub const SHEAP_PC_LOG_SIZE: usize = 20;

/// Requested allocation sizes are rounded up to a multiple of this unit.
/// Values below 4 are clamped to 4; the value must be a power of two because
/// the low bit of the block word doubles as the allocated flag.
pub const SHEAP_MINIMUM_MALLOC_SIZE: usize = 4;

/// Byte written over freed payload, stale metadata, and the arena at init.
pub const SHEAP_OVERWRITE_VALUE: u8 = 0xFF;

/// Byte written over the requested payload of a `calloc` allocation.
pub const SHEAP_CALLOC_VALUE: u8 = 0x00;

/// How many RTOS ticks an allocation entry point may wait for the heap mutex
/// before failing the operation.
pub const SHEAP_MUTEX_WAIT_TICKS: u32 = 100;

/// Identifier recorded for blocks the allocator creates on its own (the
/// initial arena block and split remainders).
pub const SHEAP_AUTO_CREATED_BLOCK_ID: u32 = 0xFFFF_FFFF;

/// Strategies for picking a free block. Only first-fit is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AllocationStrategy {
    FirstFit,
}

/// The strategy used by the allocator.
pub const SHEAP_MEMORY_ALLOCATION_STRATEGY: AllocationStrategy = AllocationStrategy::FirstFit;

/// Software ceiling on the number of MPU regions the stack guard manages.
/// The hardware may report fewer; the smaller of the two wins.
pub const STACKGUARD_NUMBER_OF_MPU_REGIONS: usize = 8;

/// How many RTOS ticks the region-table mutators may wait for their mutex.
pub const STACKGUARD_MUTEX_WAIT_TICKS: u32 = 100;

/// Smallest programmable MPU region in bytes.
pub const MPU_MIN_REGION_SIZE: usize = 32;

// CRC parameters shared by the integrity tags. Both polynomials are applied
// MSB-first without input or output reflection.
pub const CRC16_POLY: u16 = 0x1021;
pub const CRC16_SEED: u16 = 0xFFFF;
pub const CRC16_XOR_OUT: u16 = 0x0000;

pub const CRC32_POLY: u32 = 0x04C1_1DB7;
pub const CRC32_SEED: u32 = 0xFFFF_FFFF;
pub const CRC32_XOR_OUT: u32 = 0xFFFF_FFFF;

const _: () = assert!(SHEAP_PC_LOG_SIZE > 0, "the id ring needs at least one slot");
const _: () = assert!(
    SHEAP_MINIMUM_MALLOC_SIZE.is_power_of_two(),
    "the allocation unit must be a power of two"
);
const _: () = assert!(STACKGUARD_NUMBER_OF_MPU_REGIONS > 0);
