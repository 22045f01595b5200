//! Data transfer operations on top of an authenticated grid session.
//!
//! [`DataTransferOperations`] puts and gets single files or whole directory trees, replicates
//! data objects between storage resources and renames or physically moves them. Progress and
//! per-file failures are reported through a [`common::TransferStatusCallback`]; the transfer is
//! steered (paused, cancelled, resumed after a restart path) through a shared
//! [`common::TransferControlBlock`].
//!
//! [`StatusPrinter`] is the callback used by the `rgrid` binary.

pub mod operations;
pub mod progress;

pub use operations::DataTransferOperations;
pub use progress::{StatusFormat, StatusPrinter};
