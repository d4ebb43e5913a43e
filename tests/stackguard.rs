//! Stack-guard behavior against the simulated MPU and fault-status
//! registers: region programming, task-switch selectivity, and the
//! memory-fault decode path.

#![cfg(feature = "stackguard")]

use std::sync::{Mutex, MutexGuard};

use memshield::mpu::{self, AccessPermission, RegionSize};
use memshield::stackguard::{self, ExceptionFrame, StackguardError};
use memshield::AssertionKind;

const REGIONS: usize = 8;

const RASR_ENABLE: u32 = 1;
const RASR_AP_POS: u32 = 24;

static TEST_LOCK: Mutex<()> = Mutex::new(());
static REPORTED: Mutex<Vec<AssertionKind>> = Mutex::new(Vec::new());
static FAULTS: Mutex<Vec<(u32, ExceptionFrame)>> = Mutex::new(Vec::new());

fn sink(kind: AssertionKind, _msg: &'static str) {
    REPORTED.lock().unwrap().push(kind);
}

fn fault_sink(address: u32, frame: ExceptionFrame) {
    FAULTS.lock().unwrap().push((address, frame));
}

fn setup() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    memshield::init(Some(sink));
    REPORTED.lock().unwrap().clear();
    FAULTS.lock().unwrap().clear();
    mpu::sim::reset(REGIONS as u8);
    stackguard::sim::set_fault_status(0, 0);
    stackguard::sim::set_debugger_attached(false);
    stackguard::init(Some(fault_sink)).unwrap();
    guard
}

fn access_of(region: usize) -> u32 {
    (mpu::sim::rasr(region) >> RASR_AP_POS) & 0x7
}

fn region_enabled(region: usize) -> bool {
    mpu::sim::rasr(region) & RASR_ENABLE != 0
}

fn frame() -> ExceptionFrame {
    ExceptionFrame {
        r0: 0x11,
        r1: 0x22,
        r2: 0x33,
        r3: 0x44,
        r12: 0x55,
        lr: 0xFFFF_FFFD,
        return_address: 0x0800_1234,
        xpsr: 0x0100_0000,
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[test]
fn add_task_programs_the_claimed_region() {
    let _guard = setup();

    stackguard::add_task(
        7,
        0x2000_0000 as *const u32,
        RegionSize::Size32B,
        AccessPermission::PrivilegedRw,
        false,
    )
    .unwrap();

    assert_eq!(mpu::sim::rbar(0), 0x2000_0000);
    assert!(region_enabled(0));
    assert_eq!(access_of(0), AccessPermission::PrivilegedRw as u32);
    assert_eq!((mpu::sim::rasr(0) >> 1) & 0x1F, RegionSize::Size32B.code() as u32);
}

#[test]
fn add_task_rejects_bad_addresses_and_sizes() {
    let _guard = setup();

    // Not 32-byte aligned.
    assert_eq!(
        stackguard::add_task(
            1,
            0x2000_0010 as *const u32,
            RegionSize::Size32B,
            AccessPermission::PrivilegedRw,
            false,
        ),
        Err(StackguardError::InvalidMpuAddress)
    );
    // 32-byte aligned but not naturally aligned for a 1 KiB region.
    assert_eq!(
        stackguard::add_task(
            1,
            0x2000_0020 as *const u32,
            RegionSize::Size1KB,
            AccessPermission::PrivilegedRw,
            false,
        ),
        Err(StackguardError::InvalidStackAlignment)
    );
    // A rejected registration claims nothing.
    assert_eq!(
        stackguard::remove_task(1),
        Err(StackguardError::TaskNotFound)
    );
}

#[test]
fn byte_sizes_must_be_powers_of_two_of_at_least_32() {
    let _guard = setup();

    for bad in [0u32, 16, 48, 1000] {
        assert_eq!(
            stackguard::add_task_byte_size(
                2,
                0x2000_0000 as *const u32,
                bad,
                AccessPermission::PrivilegedRw,
                false,
            ),
            Err(StackguardError::MpuInvalidRegionSize)
        );
    }

    stackguard::add_task_byte_size(
        2,
        0x2000_0400 as *const u32,
        1024,
        AccessPermission::PrivilegedRw,
        false,
    )
    .unwrap();
    assert_eq!(mpu::sim::rbar(0), 0x2000_0400);
    assert_eq!((mpu::sim::rasr(0) >> 1) & 0x1F, RegionSize::Size1KB.code() as u32);
}

#[test]
fn table_capacity_is_bounded_by_the_region_count() {
    let _guard = setup();

    for task in 0..REGIONS as u32 {
        stackguard::add_task(
            task,
            (0x2000_0000 + task as usize * 32) as *const u32,
            RegionSize::Size32B,
            AccessPermission::PrivilegedRw,
            false,
        )
        .unwrap();
    }
    assert_eq!(
        stackguard::add_task(
            99,
            0x2000_1000 as *const u32,
            RegionSize::Size32B,
            AccessPermission::PrivilegedRw,
            false,
        ),
        Err(StackguardError::NoMpuRegionLeft)
    );
}

#[test]
fn re_registering_a_task_reuses_its_slot() {
    let _guard = setup();

    stackguard::add_task(
        5,
        0x2000_0000 as *const u32,
        RegionSize::Size32B,
        AccessPermission::PrivilegedRw,
        false,
    )
    .unwrap();
    stackguard::add_task(
        5,
        0x2000_0040 as *const u32,
        RegionSize::Size64B,
        AccessPermission::PrivilegedRw,
        false,
    )
    .unwrap();

    // Still slot 0, with the new base; a single remove drains the task.
    assert_eq!(mpu::sim::rbar(0), 0x2000_0040);
    stackguard::remove_task(5).unwrap();
    assert_eq!(stackguard::remove_task(5), Err(StackguardError::TaskNotFound));
}

#[test]
fn removal_releases_the_lowest_slot_first() {
    let _guard = setup();

    for (task, base) in [(1u32, 0x2000_0000usize), (2, 0x2000_0020), (3, 0x2000_0040)] {
        stackguard::add_task(
            task,
            base as *const u32,
            RegionSize::Size32B,
            AccessPermission::PrivilegedRw,
            false,
        )
        .unwrap();
    }

    stackguard::remove_task(1).unwrap();
    stackguard::add_task(
        4,
        0x2000_0060 as *const u32,
        RegionSize::Size32B,
        AccessPermission::PrivilegedRw,
        false,
    )
    .unwrap();

    // The newcomer claimed the freed slot 0.
    assert_eq!(mpu::sim::rbar(0), 0x2000_0060);
}

#[test]
fn init_without_mpu_regions_fails() {
    let _guard = {
        let guard = TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        mpu::sim::reset(0);
        guard
    };
    assert_eq!(
        stackguard::init(Some(fault_sink)),
        Err(StackguardError::NoMpuAvailable)
    );
    assert_eq!(stackguard::guard(), Err(StackguardError::NoMpuAvailable));
}

// ---------------------------------------------------------------------------
// Task switching
// ---------------------------------------------------------------------------

#[test]
fn switch_in_grants_exactly_the_running_task() {
    let _guard = setup();

    let bases = [0x2000_0000u32, 0x2000_0400, 0x2000_0800];
    for (task, base) in bases.iter().enumerate() {
        stackguard::add_task(
            task as u32 + 1,
            *base as *const u32,
            RegionSize::Size1KB,
            AccessPermission::PrivilegedRw,
            false,
        )
        .unwrap();
    }

    stackguard::task_switch_in(2, true);
    assert!(stackguard::is_mpu_enabled());

    let allowed: Vec<usize> = (0..REGIONS)
        .filter(|&n| region_enabled(n) && access_of(n) == AccessPermission::AllAccessAllowed as u32)
        .collect();
    assert_eq!(allowed, vec![1], "only the running task's region is open");
    assert_eq!(mpu::sim::rbar(1), bases[1] | 1);
    assert_eq!(access_of(0), AccessPermission::AllAccessDenied as u32);
    assert_eq!(access_of(2), AccessPermission::AllAccessDenied as u32);
}

#[test]
fn switch_in_of_an_unregistered_task_denies_everything() {
    let _guard = setup();

    stackguard::add_task(
        7,
        0x2000_0000 as *const u32,
        RegionSize::Size32B,
        AccessPermission::PrivilegedRw,
        false,
    )
    .unwrap();
    stackguard::task_switch_in(7, true);
    assert_eq!(access_of(0), AccessPermission::AllAccessAllowed as u32);

    stackguard::task_switch_in(9, true);
    assert_eq!(access_of(0), AccessPermission::AllAccessDenied as u32);
    assert!(stackguard::is_mpu_enabled());
}

#[test]
fn switch_in_reports_when_the_mpu_was_still_disabled() {
    let _guard = setup();

    stackguard::add_task(
        1,
        0x2000_0000 as *const u32,
        RegionSize::Size32B,
        AccessPermission::PrivilegedRw,
        false,
    )
    .unwrap();

    // Fresh init leaves the MPU off; the first switch-in flags that but
    // still programs and enables.
    stackguard::task_switch_in(1, true);
    assert_eq!(REPORTED.lock().unwrap().clone(), vec![AssertionKind::MpuNotEnabled]);
    assert!(stackguard::is_mpu_enabled());

    REPORTED.lock().unwrap().clear();
    stackguard::task_switch_in(1, true);
    assert!(REPORTED.lock().unwrap().is_empty());
}

#[test]
fn guard_enables_the_mpu() {
    let _guard = setup();

    assert!(!stackguard::is_mpu_enabled());
    stackguard::guard().unwrap();
    assert!(stackguard::is_mpu_enabled());
    assert_eq!(mpu::sim::ctrl() & 1, 1);
}

// ---------------------------------------------------------------------------
// Memory-fault path
// ---------------------------------------------------------------------------

#[test]
fn data_access_violation_reaches_the_callback() {
    let _guard = setup();

    stackguard::add_task(
        7,
        0x2000_0000 as *const u32,
        RegionSize::Size32B,
        AccessPermission::PrivilegedRw,
        false,
    )
    .unwrap();
    stackguard::task_switch_in(9, true);

    // A store into task 7's denied stack page raises a memory-management
    // fault with DACCVIOL set and the address latched in MMFAR.
    stackguard::sim::set_fault_status(stackguard::sim::DACCVIOL, 0x2000_0000);
    let stacked = frame();
    unsafe { stackguard::stackguard_handle_mem_fault(&stacked) };

    let faults = FAULTS.lock().unwrap().clone();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].0, 0x2000_0000);
    assert_eq!(faults[0].1, stacked);
}

#[test]
fn other_fault_causes_are_not_forwarded() {
    let _guard = setup();

    // Instruction access violation only: MEMFAULTSR is set but DACCVIOL is
    // not, so the data-violation callback stays silent.
    stackguard::sim::set_fault_status(1 << 0, 0x2000_0000);
    let stacked = frame();
    unsafe { stackguard::stackguard_handle_mem_fault(&stacked) };
    assert!(FAULTS.lock().unwrap().is_empty());

    stackguard::sim::set_fault_status(0, 0);
    unsafe { stackguard::stackguard_handle_mem_fault(&stacked) };
    assert!(FAULTS.lock().unwrap().is_empty());
}

#[test]
fn null_frame_is_ignored() {
    let _guard = setup();

    stackguard::sim::set_fault_status(stackguard::sim::DACCVIOL, 0x2000_0000);
    unsafe { stackguard::stackguard_handle_mem_fault(core::ptr::null()) };
    assert!(FAULTS.lock().unwrap().is_empty());
}
