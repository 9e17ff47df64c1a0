//! # Host Capability Traits
//!
//! Contracts between the openpod core and the host application.
//!
//! ## Overview
//!
//! The sync core reads and writes the iPod's binary databases itself, but a
//! handful of concerns are deliberately external and host-provided:
//!
//! - [`MetadataProvider`](metadata::MetadataProvider) — audio tag reading and
//!   write-back (play counts, ratings, fingerprint tags)
//! - [`ImageEncoder`](image::ImageEncoder) — RGB565 resampling of embedded
//!   album art for `.ithmb` pixel files
//! - [`DeviceStorage`](storage::DeviceStorage) — free-space probe for the
//!   pre-flight storage check
//!
//! The core fails fast with a descriptive error when a required capability
//! is missing outright; per-file capability errors are recorded on the sync
//! outcome and the run continues.
//!
//! ## Thread Safety
//!
//! The pipeline itself is single-threaded, but it runs on a background
//! thread while the host observes progress, so all traits require
//! `Send + Sync`.

pub mod error;
pub mod image;
pub mod metadata;
pub mod storage;

pub use error::{BridgeError, Result};
pub use image::{ArtworkFormat, EncodedImage, ImageEncoder};
pub use metadata::{AudioMetadata, MetadataProvider, RatingTag};
pub use storage::{DeviceStorage, FixedStorage};
