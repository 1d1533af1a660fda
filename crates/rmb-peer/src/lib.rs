//! RMB peer: signed, end-to-end encrypted RPC between twins over relays.
//!
//! Start a [`Peer`] with a mnemonic, a [`PeerConfig`] and a
//! [`DirectoryProvider`], then either serve commands through a [`Router`],
//! call remote commands through an [`RpcClient`], or both through a [`Mux`].
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Exponential backoff with jitter for relay reconnects.
pub mod backoff;
/// CLI parsing and layered configuration.
pub mod config;
/// Self-healing WebSocket link to one relay.
pub mod connection;
/// Twin directory provider, cache and in-memory implementation.
pub mod directory;
/// Error types.
pub mod error;
/// Keys derived from a twin's mnemonic.
pub mod identity;
/// Combined router and correlator handler.
pub mod mux;
/// Peer core: envelope building, verification and decryption.
pub mod peer;
/// Command routing for incoming requests.
pub mod router;
/// Request/response correlation.
pub mod rpc;

pub use config::PeerConfig;
pub use directory::{DirectoryCache, DirectoryProvider, MemoryDirectory, Twin};
pub use error::{DirectoryError, Error, Result};
pub use identity::Identity;
pub use mux::Mux;
pub use peer::{Handler, Peer};
pub use router::{Context, HandlerError, Router};
pub use rpc::{CallOptions, Correlator, RpcClient};
