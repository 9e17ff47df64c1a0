//! # Database Module
//!
//! Codecs for the iPod's proprietary on-disk databases and the device
//! signer that makes the firmware accept them.
//!
//! ## Components
//!
//! - **Buffer** (`buffer`): append-only output buffer with chunk-frame
//!   length backpatching
//! - **Records** (`record`): tracks, albums, playlists, device identity
//! - **Reader** (`reader`): recursive iTunesDB parser
//! - **Writer** (`writer`): single-pass iTunesDB emitter with id assignment
//! - **Signer** (`signer`): HASH58/HASH72 signatures over the emitted bytes
//! - **Play Counts** (`playcounts`): the firmware's play-log sidecar file
//! - **Artwork** (`artwork`): ArtworkDB and `.ithmb` pixel files

pub mod artwork;
pub mod buffer;
pub mod error;
pub mod playcounts;
pub mod reader;
pub mod record;
pub mod signer;
pub mod writer;

pub use buffer::{ChunkFrame, DbBuffer};
pub use error::{DbError, Result};
pub use record::{
    Album, Database, DeviceFields, Playlist, PlaylistItem, Track, MAC_EPOCH_OFFSET,
};
pub use writer::{generate_dbid, TrackAssignment, WriteResult};
