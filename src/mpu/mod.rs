/*
 * memshield - heap integrity and stack protection for Cortex-M targets
 *
 * SPDX-License-Identifier: MIT
 */

//! Memory Protection Unit driver.
//!
//! Programs, enables, disables, and queries MPU regions through the
//! Armv6-M/Armv7-M RBAR/RASR register pair. Region attributes are carried in
//! a plain [`Region`] descriptor; programming one region is a single
//! RBAR-with-VALID write followed by a RASR write, the sequence the
//! architecture defines for atomic region updates.
//!
//! For the register layout and alignment rules see the Armv7-M Architecture
//! Reference Manual (DDI 0403), section B3.5.
//!
//! ## Register-layout variants
//!
//! - `mpu-m0plus` - Armv6-M (Cortex-M0+): same RBAR/RASR window, no TEX
//!   field, no natural-alignment requirement enforced by this driver
//! - `mpu-m3-m4-m7` - Armv7-M: region bases must be naturally aligned to the
//!   region size
//! - `mpu-m23` / `mpu-m33-m35p` - Armv8-M layouts (RLAR/MAIR); recognised but
//!   not implemented

mod registers;

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use registers::sim;

use thiserror::Error;

#[cfg(any(feature = "mpu-m23", feature = "mpu-m33-m35p"))]
compile_error!(
    "the Armv8-M MPU register layout (mpu-m23 / mpu-m33-m35p) is not implemented; \
     select mpu-m0plus or mpu-m3-m4-m7"
);

#[cfg(not(any(
    feature = "mpu-m0plus",
    feature = "mpu-m3-m4-m7",
    feature = "mpu-m23",
    feature = "mpu-m33-m35p"
)))]
compile_error!("select an MPU register-layout feature: mpu-m0plus or mpu-m3-m4-m7");

// =============================================================================
// Register fields
// =============================================================================

const TYPE_DREGION_POS: u32 = 8;

const CTRL_ENABLE: u32 = 1 << 0;
const CTRL_PRIVDEFENA: u32 = 1 << 2;

const RBAR_VALID: u32 = 1 << 4;
const RBAR_ADDRESS_ALIGNMENT_MASK: u32 = 0x1F;

const RASR_ENABLE_POS: u32 = 0;
const RASR_SIZE_POS: u32 = 1;
const RASR_SRD_POS: u32 = 8;
const RASR_TEX_SCB_POS: u32 = 16;
const RASR_AP_POS: u32 = 24;
const RASR_XN_POS: u32 = 28;

// =============================================================================
// Descriptors
// =============================================================================

/// MPU driver failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MpuError {
    #[error("no MPU available")]
    NoMpuAvailable,
    #[error("region base address is not 32-byte aligned")]
    InvalidRegionAddress,
    #[error("region base address is not aligned to the region size")]
    InvalidRegionAlignment,
    #[error("region number exceeds the hardware region count")]
    InvalidRegionNumber,
    #[error("region size code is not representable")]
    InvalidRegionSize,
}

/// Data access permission encoding of the RASR AP field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AccessPermission {
    AllAccessDenied = 0x00,
    PrivilegedRw = 0x01,
    PrivilegedRwUnprivilegedRo = 0x02,
    AllAccessAllowed = 0x03,
    PrivilegedRo = 0x05,
    PrivilegedRoUnprivilegedRo = 0x06,
}

/// Region sizes expressible in the RASR SIZE field.
///
/// The encoded region spans `2^(code + 1)` bytes: code `0x04` is 32 bytes,
/// code `0x1F` is 4 GiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RegionSize {
    Size32B = 0x04,
    Size64B = 0x05,
    Size128B = 0x06,
    Size256B = 0x07,
    Size512B = 0x08,
    Size1KB = 0x09,
    Size2KB = 0x0A,
    Size4KB = 0x0B,
    Size8KB = 0x0C,
    Size16KB = 0x0D,
    Size32KB = 0x0E,
    Size64KB = 0x0F,
    Size128KB = 0x10,
    Size256KB = 0x11,
    Size512KB = 0x12,
    Size1MB = 0x13,
    Size2MB = 0x14,
    Size4MB = 0x15,
    Size8MB = 0x16,
    Size16MB = 0x17,
    Size32MB = 0x18,
    Size64MB = 0x19,
    Size128MB = 0x1A,
    Size256MB = 0x1B,
    Size512MB = 0x1C,
    Size1GB = 0x1D,
    Size2GB = 0x1E,
    Size4GB = 0x1F,
}

const REGION_SIZES: [RegionSize; 28] = [
    RegionSize::Size32B,
    RegionSize::Size64B,
    RegionSize::Size128B,
    RegionSize::Size256B,
    RegionSize::Size512B,
    RegionSize::Size1KB,
    RegionSize::Size2KB,
    RegionSize::Size4KB,
    RegionSize::Size8KB,
    RegionSize::Size16KB,
    RegionSize::Size32KB,
    RegionSize::Size64KB,
    RegionSize::Size128KB,
    RegionSize::Size256KB,
    RegionSize::Size512KB,
    RegionSize::Size1MB,
    RegionSize::Size2MB,
    RegionSize::Size4MB,
    RegionSize::Size8MB,
    RegionSize::Size16MB,
    RegionSize::Size32MB,
    RegionSize::Size64MB,
    RegionSize::Size128MB,
    RegionSize::Size256MB,
    RegionSize::Size512MB,
    RegionSize::Size1GB,
    RegionSize::Size2GB,
    RegionSize::Size4GB,
];

impl RegionSize {
    /// The raw RASR SIZE encoding.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Region span in bytes.
    pub const fn bytes(self) -> u64 {
        1 << (self.code() + 1)
    }

    /// Decodes a raw size code (`0x04..=0x1F`).
    pub fn from_code(code: u8) -> Option<Self> {
        if (0x04..=0x1F).contains(&code) {
            Some(REGION_SIZES[(code - 0x04) as usize])
        } else {
            None
        }
    }

    /// Converts a byte count to its size code. The count must be a power of
    /// two and at least 32.
    pub fn from_bytes(bytes: u32) -> Option<Self> {
        if !bytes.is_power_of_two() {
            return None;
        }
        Self::from_code((bytes.trailing_zeros() as u8).wrapping_sub(1))
    }
}

/// One MPU region descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Region {
    pub base_address: u32,
    pub number: u8,
    pub size: RegionSize,
    pub access: AccessPermission,
    pub enabled: bool,
    pub cacheable: bool,
    pub bufferable: bool,
    pub shareable: bool,
    pub tex: u8,
    pub subregion_disable: u8,
    pub execute_never: bool,
}

impl Region {
    fn rasr_value(&self) -> u32 {
        let tex_scb = ((self.tex as u32) << 3)
            | ((self.shareable as u32) << 2)
            | ((self.cacheable as u32) << 1)
            | self.bufferable as u32;
        ((self.access as u32) << RASR_AP_POS)
            | ((self.execute_never as u32) << RASR_XN_POS)
            | (tex_scb << RASR_TEX_SCB_POS)
            | ((self.subregion_disable as u32) << RASR_SRD_POS)
            | ((self.size.code() as u32) << RASR_SIZE_POS)
            | ((self.enabled as u32) << RASR_ENABLE_POS)
    }

    #[cfg(feature = "mpu-m3-m4-m7")]
    fn is_naturally_aligned(&self) -> bool {
        let mask = (self.size.bytes() - 1) as u32;
        self.base_address & mask == 0
    }
}

// =============================================================================
// Driver operations
// =============================================================================

/// Number of data regions the hardware implements. Zero means no MPU.
pub fn region_count() -> u8 {
    (registers::read_type() >> TYPE_DREGION_POS) as u8
}

/// Whether the MPU is currently enabled.
pub fn is_enabled() -> bool {
    registers::read_ctrl() & CTRL_ENABLE != 0
}

/// Enables the MPU with the privileged default memory map as background.
///
/// The enable is followed by data and instruction synchronisation barriers so
/// no access issued after this call can be satisfied under the old map.
pub fn enable() -> Result<(), MpuError> {
    if region_count() == 0 {
        return Err(MpuError::NoMpuAvailable);
    }
    unsafe {
        registers::write_ctrl(CTRL_PRIVDEFENA | CTRL_ENABLE);
    }
    barrier::dsb();
    barrier::isb();
    Ok(())
}

/// Disables the MPU.
///
/// A data memory barrier is issued first so every outstanding access retires
/// under the permissions it was issued with.
pub fn disable() -> Result<(), MpuError> {
    if region_count() == 0 {
        return Err(MpuError::NoMpuAvailable);
    }
    barrier::dmb();
    unsafe {
        registers::write_ctrl(0);
    }
    Ok(())
}

/// Programs one region from its descriptor.
///
/// Validation happens before any register is touched: a rejected region
/// leaves the MPU state unchanged. The enable state of the MPU itself is not
/// modified; callers sequence [`disable`]/[`enable`] around reprogramming as
/// their consistency model requires.
pub fn configure_region(region: &Region) -> Result<(), MpuError> {
    let regions = region_count();
    if regions == 0 {
        return Err(MpuError::NoMpuAvailable);
    }
    if region.number >= regions {
        return Err(MpuError::InvalidRegionNumber);
    }
    if region.base_address & RBAR_ADDRESS_ALIGNMENT_MASK != 0 {
        return Err(MpuError::InvalidRegionAddress);
    }
    #[cfg(feature = "mpu-m3-m4-m7")]
    if !region.is_naturally_aligned() {
        return Err(MpuError::InvalidRegionAlignment);
    }

    unsafe {
        registers::write_rbar(region.base_address | RBAR_VALID | region.number as u32);
        registers::write_rasr(region.rasr_value());
    }
    Ok(())
}

// =============================================================================
// Barriers
// =============================================================================

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod barrier {
    pub fn dmb() {
        cortex_m::asm::dmb();
    }

    pub fn dsb() {
        cortex_m::asm::dsb();
    }

    pub fn isb() {
        cortex_m::asm::isb();
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
mod barrier {
    pub fn dmb() {}
    pub fn dsb() {}
    pub fn isb() {}
}
