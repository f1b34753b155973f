//! # NVMe driver
//!
//! Queue engine and controller driver for NVM Express block devices.
//!
//! ## Layers
//!
//! | Module | Role |
//! |--------|------|
//! | [`wire`] | command/completion layouts, registers, identify data |
//! | [`queue`] | power-of-two rings with phase bits and doorbells |
//! | [`queue_pair`] | submission + completion ring, handler table, PRP construction |
//! | [`controller`] | bring-up state machine, interrupt demultiplexing, namespace discovery |
//! | `io` | splitting block requests into hardware-sized commands |
//! | [`irq`] | routing raw interrupt vectors to controllers |
//! | [`namespace`] | one [`StorageDevice`](kernel_storage::StorageDevice) per namespace |
//!
//! ## Lifecycle
//!
//! ```text
//!  probe ──► IrqRouter::register ──► NvmeController::init ──► detect_namespaces ──► DeviceRegistry::register
//!                    ▲                        │
//!                    └── IrqRouter::dispatch ◄┘ admin completions
//! ```
//!
//! Everything outside the controller (PCI, vector allocation, physical
//! memory) is reached through the [`Platform`] trait and the
//! [`ControllerResources`] handed to [`probe`].
//!
//! ## Submitting I/O
//!
//! Every request reports into an [`Iocp`](kernel_storage::Iocp). The request
//! is split up front, the port is armed with the number of commands, and each
//! command's completion counts once:
//!
//! ```text
//!   read_async(lba, buf, 400 blocks)      Iocp { expected: 4 }
//!     ├── Read  lba 100, 128 blocks ──► complete(Ok)  1/4
//!     ├── Read  lba 228, 128 blocks ──► complete(Ok)  2/4
//!     ├── Read  lba 356, 128 blocks ──► complete(Err) 3/4   first error wins
//!     └── Read  lba 484,  16 blocks ──► complete(Ok)  4/4 ─► fires with Err
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod config;
pub mod controller;
mod error;
mod io;
pub mod irq;
pub mod namespace;
pub mod platform;
mod probe;
pub mod queue;
pub mod queue_pair;
pub mod wire;

pub use config::NvmeConfig;
pub use controller::{ControllerIdentity, NamespaceInfo, NvmeController};
pub use error::{InitError, Stage, SubmitError};
pub use irq::{ControllerHandle, IrqRouter};
pub use namespace::NvmeNamespace;
pub use platform::{ControllerResources, DmaRegion, IrqMode, IrqRange, PhysAddr, PhysRange, Platform};
pub use probe::{ProbedController, probe};
pub use queue_pair::{CompletionEvent, CompletionHandler, Payload, QueuePair};
