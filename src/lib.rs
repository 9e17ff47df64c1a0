//! Workspace facade crate.
//!
//! Re-exports the individual workspace crates so a host application (GUI,
//! CLI) can depend on `openpod` alone instead of wiring each member crate.

pub use bridge_traits;
pub use core_db as db;
pub use core_device as device;
pub use core_runtime as runtime;
pub use core_sync as sync;
