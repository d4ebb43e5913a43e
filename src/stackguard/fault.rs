/*
 * memshield - heap integrity and stack protection for Cortex-M targets
 *
 * SPDX-License-Identifier: MIT
 */

//! Memory-management fault path.
//!
//! The `MemManage_Handler` vector picks the stack pointer the faulting
//! context was using (MSP or PSP, decided by bit 2 of EXC_RETURN) and tail
//! calls [`stackguard_handle_mem_fault`] with it. That routine decodes the
//! Configurable Fault Status Register: a data access violation is forwarded
//! to the registered callback together with the faulting address from MMFAR
//! and the eight-word exception frame the hardware stacked.
//!
//! Wire the vector by pointing the `MemManage` entry of the vector table at
//! `MemManage_Handler` (CMSIS naming; with `cortex-m-rt` alias its
//! `MemoryManagement` handler to this symbol).

/// The eight words the hardware pushes when taking an exception.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ExceptionFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub return_address: u32,
    pub xpsr: u32,
}

/// Signature of the application memory-fault sink.
pub type MemFaultCallback = fn(fault_address: u32, frame: ExceptionFrame);

// Installed by stackguard::init before faults can be taken.
static mut MEM_FAULT_CALLBACK: Option<MemFaultCallback> = None;

pub(crate) fn set_callback(callback: Option<MemFaultCallback>) {
    unsafe {
        MEM_FAULT_CALLBACK = callback;
    }
}

const CFSR_MEMFAULTSR_MASK: u32 = 0xFF;
const CFSR_DACCVIOL: u32 = 1 << 1;
#[cfg(feature = "halt-on-mem-fault")]
const DHCSR_C_DEBUGEN: u32 = 1 << 0;

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod regs {
    use core::ptr;

    const SCB_CFSR: *const u32 = 0xE000_ED28 as *const u32;
    const SCB_MMFAR: *const u32 = 0xE000_ED34 as *const u32;
    #[cfg(feature = "halt-on-mem-fault")]
    const DHCSR: *const u32 = 0xE000_EDF0 as *const u32;

    pub fn read_cfsr() -> u32 {
        unsafe { ptr::read_volatile(SCB_CFSR) }
    }

    pub fn read_mmfar() -> u32 {
        unsafe { ptr::read_volatile(SCB_MMFAR) }
    }

    #[cfg(feature = "halt-on-mem-fault")]
    pub fn read_dhcsr() -> u32 {
        unsafe { ptr::read_volatile(DHCSR) }
    }
}

/// Process-local fault-status registers for non-ARM builds: set CFSR/MMFAR,
/// then drive [`stackguard_handle_mem_fault`] with a constructed frame.
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod sim {
    use core::sync::atomic::{AtomicU32, Ordering};

    static CFSR: AtomicU32 = AtomicU32::new(0);
    static MMFAR: AtomicU32 = AtomicU32::new(0);
    static DHCSR: AtomicU32 = AtomicU32::new(0);

    pub fn set_fault_status(cfsr: u32, mmfar: u32) {
        CFSR.store(cfsr, Ordering::SeqCst);
        MMFAR.store(mmfar, Ordering::SeqCst);
    }

    pub fn set_debugger_attached(attached: bool) {
        DHCSR.store(attached as u32, Ordering::SeqCst);
    }

    /// CFSR value signalling a data access violation, for convenience.
    pub const DACCVIOL: u32 = super::CFSR_DACCVIOL;

    pub(super) fn read_cfsr() -> u32 {
        CFSR.load(Ordering::SeqCst)
    }

    pub(super) fn read_mmfar() -> u32 {
        MMFAR.load(Ordering::SeqCst)
    }

    #[cfg(feature = "halt-on-mem-fault")]
    pub(super) fn read_dhcsr() -> u32 {
        DHCSR.load(Ordering::SeqCst)
    }
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
use regs::{read_cfsr, read_mmfar};
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
use sim::{read_cfsr, read_mmfar};

/// Decodes a memory-management fault and forwards data access violations to
/// the registered callback.
///
/// `frame` is the stacked exception frame of the faulting context; a null
/// frame is ignored.
///
/// # Safety
/// `frame` must be null or point to a readable [`ExceptionFrame`].
#[no_mangle]
pub unsafe extern "C" fn stackguard_handle_mem_fault(frame: *const ExceptionFrame) {
    if frame.is_null() {
        return;
    }
    let cfsr = read_cfsr();
    if cfsr & CFSR_MEMFAULTSR_MASK != 0 && cfsr & CFSR_DACCVIOL != 0 {
        if let Some(callback) = MEM_FAULT_CALLBACK {
            callback(read_mmfar(), *frame);
        }
    }

    #[cfg(feature = "halt-on-mem-fault")]
    halt_if_debugging();
}

#[cfg(feature = "halt-on-mem-fault")]
fn halt_if_debugging() {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    let dhcsr = regs::read_dhcsr();
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    let dhcsr = sim::read_dhcsr();

    if dhcsr & DHCSR_C_DEBUGEN != 0 {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        cortex_m::asm::bkpt();
    }
}

/// The MemManage exception vector.
///
/// Selects the active stack pointer via the EXC_RETURN value in `lr` and
/// branches to [`stackguard_handle_mem_fault`] with it as the frame pointer.
/// Armv6-M parts escalate MPU violations to HardFault and get no vector from
/// this crate.
#[cfg(all(
    feature = "memfault-handler",
    feature = "mpu-m3-m4-m7",
    target_arch = "arm",
    target_os = "none"
))]
#[unsafe(naked)]
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn MemManage_Handler() {
    core::arch::naked_asm!(
        "tst lr, #4",            // which stack was in use?
        "ite eq",
        "mrseq r0, msp",
        "mrsne r0, psp",
        "b stackguard_handle_mem_fault",
    );
}
