//! Transfer engine for the twopane file manager.
//!
//! Recursive copy/move with byte-level progress, a symlink-remapping policy,
//! interactive conflict resolution and cooperative cancellation. The library
//! is UI-agnostic: every interactive decision and every progress event goes
//! through the async callback contracts in [`controller::Host`] and
//! [`engine::EngineHooks`], so a terminal UI, a test harness and the `tpcp`
//! CLI all drive the same code.
//!
//! Execution is single-threaded and cooperative: one item, one directory
//! entry and one chunk at a time, with every filesystem call and every host
//! decision a suspension point.

pub mod conflict;
pub mod controller;
pub mod engine;
pub mod error;
pub mod scan;
pub mod speed;
pub mod symlink;

#[cfg(test)]
pub(crate) mod testutils;

pub use controller::{Controller, Host, TransferOutcome, TransferRequest};
pub use engine::{OverwritePolicy, Summary, TransferMode};
pub use error::{ErrorAction, Gate, Interrupt, TransferError};
pub use symlink::SymlinkPolicy;
