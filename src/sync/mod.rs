/*
 * memshield - heap integrity and stack protection for Cortex-M targets
 *
 * SPDX-License-Identifier: MIT
 */

//! Exclusion primitives shared by the subsystems.

mod mutex;

pub use mutex::{LockGuard, MutexPort, SubsystemLock, SyncError};
