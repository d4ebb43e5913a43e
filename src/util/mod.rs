/*
 * memshield - heap integrity and stack protection for Cortex-M targets
 *
 * SPDX-License-Identifier: MIT
 */

//! Shared utility routines.

mod crc;

pub use crc::{crc16, crc32};
