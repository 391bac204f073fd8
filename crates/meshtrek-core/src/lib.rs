//! MeshTrek Core - fragment types, identifier codec, and fragment storage
//!
//! This crate provides the foundational types shared by the correlation engine
//! and the output tooling:
//!
//! - **Codec**: packed stream-id sets and composite stream keys
//! - **Fragments**: request/response/connection records parsed from probe logs
//! - **Store**: one log file loaded for repeated lookups
//! - **Config**: TOML configuration with env overrides

pub mod codec;
pub mod config;
pub mod fragment;
pub mod store;

// Re-export commonly used types
pub use codec::{pack_stream_ids, CodecError, PackedStreamIds, Protocol};
pub use config::{ConfigLoader, MeshtrekConfig, ScanMode};
pub use fragment::{
    id_prefix, ConnectionFragment, Fragment, RequestFragment, ResponseFragment, StreamFragment,
    StreamTimes, PREFIX_LEN,
};
pub use store::{FragmentSource, FragmentStore, StoreError};

/// MeshTrek version
pub const MESHTREK_VERSION: &str = env!("CARGO_PKG_VERSION");
