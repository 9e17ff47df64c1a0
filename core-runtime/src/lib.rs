//! # Runtime Module
//!
//! Ambient plumbing shared by the openpod core crates.
//!
//! ## Components
//!
//! - **Logging** (`logging`): `tracing-subscriber` setup with env-filter and
//!   pretty/compact/JSON formats
//! - **Events** (`events`): broadcast bus the pipeline emits progress on
//! - **Cancellation** (`cancel`): cooperative flag polled between items

pub mod cancel;
pub mod error;
pub mod events;
pub mod logging;

pub use cancel::CancelFlag;
pub use error::{Error, Result};
pub use events::{EventBus, SyncEvent, SyncStage};
pub use logging::{init_logging, LogFormat, LoggingConfig};
