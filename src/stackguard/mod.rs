/*
 * memshield - heap integrity and stack protection for Cortex-M targets
 *
 * SPDX-License-Identifier: MIT
 */

//! Per-task stack overflow protection using the MPU.
//!
//! Each registered task binds its stack base to one MPU region. On every
//! task switch the scheduler calls [`task_switch_in`], which reprograms all
//! occupied regions: the incoming task's stack gets full access, every other
//! registered stack falls to the switch-out permission (all access denied by
//! default). A task overflowing into a neighbouring stack therefore takes an
//! immediate, precise memory-management fault instead of silently corrupting
//! it.
//!
//! ## Concurrency
//!
//! [`add_task`] and [`remove_task`] hold the region-table mutex for their
//! whole mutation and either program a region cleanly or leave the table
//! unchanged. [`task_switch_in`] is deliberately lock-free: it runs inside
//! the scheduler's critical section and must be the only writer to the MPU
//! registers on that path. The registers are re-derived from the table on
//! every switch, so a mutation that raced a switch is applied in full at the
//! next one.

mod fault;

pub use fault::{stackguard_handle_mem_fault, ExceptionFrame, MemFaultCallback};

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use fault::sim;

use thiserror::Error;

use crate::config::{STACKGUARD_MUTEX_WAIT_TICKS, STACKGUARD_NUMBER_OF_MPU_REGIONS};
use crate::mpu::{self, AccessPermission, MpuError, Region, RegionSize};
use crate::report::{assert_failed, AssertionKind};
use crate::sync::SubsystemLock;

/// Permission applied to every registered region that does not belong to the
/// task being switched in.
pub const STACKGUARD_TASK_SWITCH_OUT_PERMISSION: AccessPermission =
    AccessPermission::AllAccessDenied;

/// Stack-guard failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackguardError {
    #[error("no MPU available")]
    NoMpuAvailable,
    #[error("no MPU region left for another task")]
    NoMpuRegionLeft,
    #[error("stack base address is not a valid MPU region address")]
    InvalidMpuAddress,
    #[error("stack base address is not aligned for the region size")]
    InvalidStackAlignment,
    #[error("region number not supported by the hardware")]
    InvalidRegionNumber,
    #[error("stack size is not representable as an MPU region")]
    MpuInvalidRegionSize,
    #[error("no task with this id is registered")]
    TaskNotFound,
    #[error("region table mutex could not be acquired")]
    MutexAcquireFailed,
}

#[derive(Clone, Copy)]
struct TaskRegion {
    task_id: Option<u32>,
    region: Region,
}

const EMPTY_SLOT: TaskRegion = TaskRegion {
    task_id: None,
    region: Region {
        base_address: 0,
        number: 0,
        size: RegionSize::Size32B,
        access: AccessPermission::AllAccessDenied,
        enabled: true,
        cacheable: true,
        bufferable: false,
        shareable: true,
        tex: 0,
        subregion_disable: 0,
        execute_never: false,
    },
};

struct GuardState {
    regions: [TaskRegion; STACKGUARD_NUMBER_OF_MPU_REGIONS],
    /// Usable regions: the smaller of the hardware count and the table size.
    region_count: u8,
    /// Lowest-index free slot, possibly stale after removals (removal lowers
    /// it, insertion rescans upwards).
    next_unused: usize,
}

static mut GUARD: GuardState = GuardState {
    regions: [EMPTY_SLOT; STACKGUARD_NUMBER_OF_MPU_REGIONS],
    region_count: 0,
    next_unused: 0,
};

static GUARD_LOCK: SubsystemLock = SubsystemLock::new();

/// Binds the region-table lock to an RTOS mutex. Call before the scheduler
/// starts.
pub fn install_mutex_port(port: &'static dyn crate::sync::MutexPort) {
    GUARD_LOCK.install_port(port);
}

/// Initializes the stack guard: stores the fault callback, disables the MPU,
/// clears the region table, and reads the hardware region count.
///
/// Returns [`StackguardError::NoMpuAvailable`] when the hardware reports no
/// MPU regions.
pub fn init(callback: Option<MemFaultCallback>) -> Result<(), StackguardError> {
    fault::set_callback(callback);
    let _ = mpu::disable();
    let usable = mpu::region_count().min(STACKGUARD_NUMBER_OF_MPU_REGIONS as u8);
    unsafe {
        GUARD.regions = [EMPTY_SLOT; STACKGUARD_NUMBER_OF_MPU_REGIONS];
        GUARD.region_count = usable;
        GUARD.next_unused = 0;
    }
    if usable == 0 {
        return Err(StackguardError::NoMpuAvailable);
    }
    Ok(())
}

/// Registers `task_id`'s stack and programs its MPU region with
/// `initial_access`.
///
/// `stack_base` must be 32-byte aligned and, on Armv7-M, naturally aligned
/// to the region size. Registering an id that is already guarded reprograms
/// its existing region in place, so a task never occupies two slots.
pub fn add_task(
    task_id: u32,
    stack_base: *const u32,
    size: RegionSize,
    initial_access: AccessPermission,
    execute_never: bool,
) -> Result<(), StackguardError> {
    let _guard = GUARD_LOCK
        .acquire(STACKGUARD_MUTEX_WAIT_TICKS)
        .map_err(|_| StackguardError::MutexAcquireFailed)?;

    unsafe {
        let slot = match slot_of(task_id) {
            Some(existing) => existing,
            None => {
                if GUARD.next_unused >= GUARD.region_count as usize {
                    return Err(StackguardError::NoMpuRegionLeft);
                }
                GUARD.next_unused
            }
        };

        let mut region = EMPTY_SLOT.region;
        region.base_address = stack_base as usize as u32;
        region.number = slot as u8;
        region.size = size;
        region.access = initial_access;
        region.execute_never = execute_never;

        // Validation happens in the driver before any register write; a
        // rejected region leaves both the MPU and the table untouched.
        match mpu::configure_region(&region) {
            Ok(()) => {}
            Err(MpuError::NoMpuAvailable) => return Err(StackguardError::NoMpuAvailable),
            Err(MpuError::InvalidRegionAddress) => return Err(StackguardError::InvalidMpuAddress),
            Err(MpuError::InvalidRegionAlignment) => {
                return Err(StackguardError::InvalidStackAlignment)
            }
            Err(MpuError::InvalidRegionNumber) => return Err(StackguardError::InvalidRegionNumber),
            Err(MpuError::InvalidRegionSize) => return Err(StackguardError::MpuInvalidRegionSize),
        }

        GUARD.regions[slot] = TaskRegion {
            task_id: Some(task_id),
            region,
        };
        while GUARD.next_unused < GUARD.region_count as usize
            && GUARD.regions[GUARD.next_unused].task_id.is_some()
        {
            GUARD.next_unused += 1;
        }
    }
    Ok(())
}

/// As [`add_task`], taking the stack size in bytes. The size must be a power
/// of two of at least 32 bytes.
pub fn add_task_byte_size(
    task_id: u32,
    stack_base: *const u32,
    stack_bytes: u32,
    initial_access: AccessPermission,
    execute_never: bool,
) -> Result<(), StackguardError> {
    let Some(size) = RegionSize::from_bytes(stack_bytes) else {
        return Err(StackguardError::MpuInvalidRegionSize);
    };
    add_task(task_id, stack_base, size, initial_access, execute_never)
}

/// Unregisters `task_id` and releases its slot for reuse.
///
/// Only the table is touched; the hardware region stays programmed until the
/// next [`task_switch_in`] re-derives the MPU from the table.
pub fn remove_task(task_id: u32) -> Result<(), StackguardError> {
    let _guard = GUARD_LOCK
        .acquire(STACKGUARD_MUTEX_WAIT_TICKS)
        .map_err(|_| StackguardError::MutexAcquireFailed)?;

    unsafe {
        match slot_of(task_id) {
            Some(slot) => {
                GUARD.regions[slot] = EMPTY_SLOT;
                if slot < GUARD.next_unused {
                    GUARD.next_unused = slot;
                }
                Ok(())
            }
            None => Err(StackguardError::TaskNotFound),
        }
    }
}

/// The scheduler hook: reprograms every occupied region so that only
/// `task_id`'s stack is fully accessible.
///
/// Must be called from the task-switch hook, i.e. from a privileged context
/// inside the scheduler's critical section - it takes no lock and must be
/// the only writer to the MPU registers on that path. The MPU is disabled
/// across the update and re-enabled afterwards when `enable_mpu` is set.
pub fn task_switch_in(task_id: u32, enable_mpu: bool) {
    if !mpu::is_enabled() {
        assert_failed(
            AssertionKind::MpuNotEnabled,
            "task switch in: MPU is not enabled",
        );
    }
    let _ = mpu::disable();
    unsafe {
        for slot in 0..GUARD.region_count as usize {
            let entry = GUARD.regions[slot];
            if let Some(owner) = entry.task_id {
                let mut region = entry.region;
                region.access = if owner == task_id {
                    AccessPermission::AllAccessAllowed
                } else {
                    STACKGUARD_TASK_SWITCH_OUT_PERMISSION
                };
                region.number = slot as u8;
                let _ = mpu::configure_region(&region);
            }
        }
    }
    if enable_mpu {
        let _ = mpu::enable();
    }
}

/// Enables the MPU with the currently programmed regions.
pub fn guard() -> Result<(), StackguardError> {
    mpu::enable().map_err(|_| StackguardError::NoMpuAvailable)
}

/// Whether the MPU is currently enabled.
pub fn is_mpu_enabled() -> bool {
    mpu::is_enabled()
}

unsafe fn slot_of(task_id: u32) -> Option<usize> {
    for slot in 0..GUARD.region_count as usize {
        if GUARD.regions[slot].task_id == Some(task_id) {
            return Some(slot);
        }
    }
    None
}
