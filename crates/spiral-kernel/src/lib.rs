//! # Spiral Kernel
//!
//! The authoritative registry and state machine over all choice trees.
//! Every mutation of a tree goes through [`SpiralKernel`], which serializes
//! selections per tree and leaves unrelated trees uncontended.

pub mod events;
pub mod kernel;
pub mod snapshot;

pub use events::{EventFilter, KernelEvent, KernelEventKind, KernelSubscription};
pub use kernel::SpiralKernel;
pub use snapshot::Snapshot;
