//! # Kernel synchronization primitives
//!
//! Spin locks that optionally mask interrupts, a once-only publication cell,
//! and a bounded wait ([`WaitCondition`] + [`Deadline`]) used wherever a thread
//! must sleep on a state change with a timeout (full submission rings,
//! completion ports, controller bring-up).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;
mod sync_once_cell;
mod time;
mod wait;

pub use irq::IrqGuard;
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
pub use time::{Clock, Deadline};
pub use wait::{WaitCondition, WaitTimedOut};
