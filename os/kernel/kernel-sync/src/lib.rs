//! # Kernel synchronization primitives
//!
//! Spin-based locks for code that may not sleep on a scheduler. Both lock types
//! share the same raw lock word ([`RawRwSpin`]):
//!
//! - [`SpinLock`] only ever takes the word exclusively.
//! - [`RwSpinLock`] additionally admits any number of concurrent readers while
//!   no writer holds the word.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod raw_rw;
mod rw_lock;
mod spin_lock;

pub use raw_rw::RawRwSpin;
pub use rw_lock::{RwSpinLock, RwSpinLockReadGuard, RwSpinLockWriteGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
