//! # Larder
//!
//! **Embedded, async, crash-consistent file-backed key-value store for Rust.**
//!
//! Larder keeps arbitrary structured values and binary blobs in a single
//! folder, one file per key, with durability guarantees that survive
//! crashes: every mutation is staged into a side file, fsynced, and
//! atomically renamed into place. Operations on the same key serialize
//! through a per-key lock; operations on different keys run in parallel.
//! All I/O is async and never blocks the `tokio` executor.
//!
//! ## Quick Start
//!
//! ```no_run
//! use larder::{Larder, PathStep};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Larder::open("./data").await?;
//!
//!     // Structured values under arbitrary keys
//!     store.assoc(&json!("user:100"), json!({"name": "Alice", "visits": 0})).await?;
//!
//!     // Transform a sub-value in place
//!     let path: Vec<PathStep> = vec!["visits".into()];
//!     store
//!         .update_in(&json!("user:100"), &path, |old| {
//!             json!(old.and_then(|v| v.as_i64()).unwrap_or_default() + 1)
//!         })
//!         .await?;
//!
//!     // Read a sub-path
//!     let visits = store.get_in(&json!("user:100"), &path).await?;
//!     assert_eq!(visits, Some(json!(1)));
//!
//!     // Binary blobs share the keyspace
//!     store.bassoc(&json!("avatar:100"), &b"\x89PNG..."[..]).await?;
//!     store
//!         .bget(&json!("avatar:100"), |blob| {
//!             println!("{} bytes at {}", blob.size(), blob.path().display());
//!             Ok(())
//!         })
//!         .await?;
//!
//!     // Enumerate and delete
//!     let keys = store.keys().await?;
//!     assert!(keys.contains(&json!("user:100")));
//!     store.dissoc(&json!("user:100")).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Core Guarantees
//!
//! - **Crash consistent**: side-file write, fsync, atomic rename, directory
//!   fsync — readers see the old record or the new one, never a torn file
//! - **Per-key serialization**: concurrent operations on one key run in
//!   FIFO lock order; distinct keys never contend
//! - **Async native**: file I/O via `tokio::fs`, blocking work (mmap reads)
//!   delegated to the blocking pool
//! - **Pluggable serialization**: records go through a [`Codec`] boundary
//!   with tag-handler registries; [`JsonCodec`] is bundled
//!
//! ## Error Handling
//!
//! Operations return `Result<T, LarderError>`; errors carry the offending
//! key and the underlying cause, and the store remains usable after any
//! failed operation. The only fatal error is [`LarderError::NotWritable`]
//! at construction, raised when the folder fails the writability probe.
//!
//! ## On-Disk Layout
//!
//! Under the store folder: `<fingerprint>` holds a structured record (the
//! codec encoding of the `[key, value]` pair), `B_<fingerprint>` holds a
//! binary record (verbatim bytes), and `<name>.new` side files exist only
//! while a mutation is in flight.

#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub(crate) mod atomic;
pub(crate) mod codec;
pub(crate) mod config;
pub(crate) mod errors;
pub(crate) mod fingerprint;
pub(crate) mod locks;
pub(crate) mod paths;
pub(crate) mod store;

pub use codec::{Codec, CodecError, Handlers, JsonCodec, TAG_KEY, TAG_VALUE_KEY, TagHandler};
pub use config::{Builder, Config};
pub use errors::{LarderError, Result};
pub use fingerprint::Fingerprint;
use mimalloc::MiMalloc;
pub use paths::PathStep;
pub use serde_json::Value;
pub use store::{Blob, Larder};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;
