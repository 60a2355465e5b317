//! delta-server: differential artifacts between container image versions
//!
//! Devices update by downloading a delta between the image they run and the
//! image they need instead of the whole destination image.  This crate
//! coordinates building those deltas:
//!
//! - parses and validates `(src, dest)` image references and derives the
//!   canonical delta key
//! - guarantees at most one build per key through atomic filesystem locks
//! - serves cached artifacts without touching the lock
//! - runs builds detached from the request that triggered them, so a slow
//!   build survives the client giving up
//!
//! Two artifact formats share one [`coordinator::Coordinator`]: image-native
//! deltas published to the registry, and patch files kept in a local store
//! and downloaded through a companion route.
//!
//! # Example
//!
//! ```
//! use delta_server::reference::resolve_key;
//!
//! let delta = resolve_key(
//!     "registry.example.io/v2/aaaaaaaaaaaaaaaa1111",
//!     "registry.example.io/v2/bbbbbbbb",
//! )
//! .unwrap();
//! assert_eq!(delta.key.as_str(), "bbbbbbbb:delta-aaaaaaaaaaaaaaaa");
//! assert_eq!(delta.path, "registry.example.io/v2/bbbbbbbb:delta-aaaaaaaaaaaaaaaa");
//! ```

// Request path
pub mod auth;
pub mod coordinator;
pub mod reference;
pub mod server;

// Build path
pub mod backend;
pub mod compute;
pub mod executor;
pub mod lock;
pub mod process;
pub mod registry;
pub mod store;

// Wiring
pub mod config;
pub mod context;
pub mod error;

pub use error::{Error, Result};
