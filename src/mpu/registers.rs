/*
 * memshield - heap integrity and stack protection for Cortex-M targets
 *
 * SPDX-License-Identifier: MIT
 */

//! Access to the MPU register window.
//!
//! On a Cortex-M target the window lives at `0xE000ED90` inside the System
//! Control Space. On any other target (host tests, simulation) the same
//! operations hit a process-local register file that latches per-region
//! state, so driver behavior can be observed without hardware.

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod hw {
    use core::ptr;

    const MPU_TYPE: *mut u32 = 0xE000_ED90 as *mut u32;
    const MPU_CTRL: *mut u32 = 0xE000_ED94 as *mut u32;
    const MPU_RBAR: *mut u32 = 0xE000_ED9C as *mut u32;
    const MPU_RASR: *mut u32 = 0xE000_EDA0 as *mut u32;

    pub fn read_type() -> u32 {
        unsafe { ptr::read_volatile(MPU_TYPE) }
    }

    pub fn read_ctrl() -> u32 {
        unsafe { ptr::read_volatile(MPU_CTRL) }
    }

    pub unsafe fn write_ctrl(value: u32) {
        ptr::write_volatile(MPU_CTRL, value);
    }

    pub unsafe fn write_rbar(value: u32) {
        ptr::write_volatile(MPU_RBAR, value);
    }

    pub unsafe fn write_rasr(value: u32) {
        ptr::write_volatile(MPU_RASR, value);
    }
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub(crate) use hw::*;

/// Process-local MPU register file for non-ARM builds.
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod sim {
    use core::sync::atomic::{AtomicU32, Ordering};

    /// Upper bound on regions the simulation can latch; real Cortex-M parts
    /// implement at most 16.
    pub const MAX_REGIONS: usize = 16;

    const RBAR_VALID: u32 = 1 << 4;
    const RBAR_REGION_MASK: u32 = 0xF;
    const RBAR_ADDR_MASK: u32 = !0x1F;

    static TYPE: AtomicU32 = AtomicU32::new(8 << 8);
    static CTRL: AtomicU32 = AtomicU32::new(0);
    static RNR: AtomicU32 = AtomicU32::new(0);
    static RBAR: [AtomicU32; MAX_REGIONS] = [const { AtomicU32::new(0) }; MAX_REGIONS];
    static RASR: [AtomicU32; MAX_REGIONS] = [const { AtomicU32::new(0) }; MAX_REGIONS];

    /// Resets the register file, reporting `region_count` data regions.
    pub fn reset(region_count: u8) {
        TYPE.store((region_count as u32) << 8, Ordering::SeqCst);
        CTRL.store(0, Ordering::SeqCst);
        RNR.store(0, Ordering::SeqCst);
        for slot in RBAR.iter().chain(RASR.iter()) {
            slot.store(0, Ordering::SeqCst);
        }
    }

    /// Latched base-address register of region `n` (address bits plus the
    /// region number, as on hardware readback).
    pub fn rbar(n: usize) -> u32 {
        RBAR[n].load(Ordering::SeqCst)
    }

    /// Latched attribute-and-size register of region `n`.
    pub fn rasr(n: usize) -> u32 {
        RASR[n].load(Ordering::SeqCst)
    }

    /// Current control-register value.
    pub fn ctrl() -> u32 {
        CTRL.load(Ordering::SeqCst)
    }

    pub(in crate::mpu) fn read_type() -> u32 {
        TYPE.load(Ordering::SeqCst)
    }

    pub(in crate::mpu) fn read_ctrl() -> u32 {
        CTRL.load(Ordering::SeqCst)
    }

    pub(in crate::mpu) unsafe fn write_ctrl(value: u32) {
        CTRL.store(value, Ordering::SeqCst);
    }

    // Writing RBAR with the VALID bit set also selects the region, exactly
    // like the hardware shortcut that lets a region be programmed without a
    // separate RNR write.
    pub(in crate::mpu) unsafe fn write_rbar(value: u32) {
        let region = if value & RBAR_VALID != 0 {
            let region = value & RBAR_REGION_MASK;
            RNR.store(region, Ordering::SeqCst);
            region
        } else {
            RNR.load(Ordering::SeqCst)
        } as usize;
        RBAR[region].store((value & RBAR_ADDR_MASK) | region as u32, Ordering::SeqCst);
    }

    pub(in crate::mpu) unsafe fn write_rasr(value: u32) {
        let region = RNR.load(Ordering::SeqCst) as usize;
        RASR[region].store(value, Ordering::SeqCst);
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub(in crate::mpu) use sim::{read_ctrl, read_type, write_ctrl, write_rasr, write_rbar};
