//! Wire-level building blocks shared by every RMB peer.
//!
//! This crate provides:
//! - The protobuf envelope schema and its canonical challenge ([`envelope`])
//! - Curve-tagged ed25519/sr25519 signatures ([`crypto`])
//! - secp256k1 + AES-GCM end-to-end sealing ([`seal`])
//! - Relay bearer tokens ([`token`])
//! - Protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod envelope;
pub mod seal;
pub mod token;
pub mod types;

pub use crypto::{CryptoError, KeyType, Signer};
pub use envelope::{Address, Envelope, EnvelopeError};
pub use seal::{E2eKey, SealError};
pub use types::TwinId;
