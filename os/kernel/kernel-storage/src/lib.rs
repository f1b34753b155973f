//! # Block storage contract
//!
//! Everything a block driver and its callers agree on, independent of the
//! transport:
//!
//! * [`Iocp`], the completion port every asynchronous request reports into,
//! * [`IoError`], the error taxonomy carried through it,
//! * [`StorageDevice`], the trait drivers implement per block device,
//! * [`DeviceRegistry`], the arena the kernel keeps registered devices in.
//!
//! Requests are fire-and-forget: a driver validates and queues the request,
//! returns, and later reports the outcome exactly once per emitted hardware
//! command through the caller's [`Iocp`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod arena;
mod buffer;
mod device;
mod error;
mod iocp;
mod registry;

pub use arena::{Arena, Handle};
pub use buffer::IoBuffer;
pub use device::{InfoKey, InfoValue, IoOwner, StorageDevice};
pub use error::{IoError, IoResult};
pub use iocp::Iocp;
pub use registry::{DeviceHandle, DeviceRegistry};
