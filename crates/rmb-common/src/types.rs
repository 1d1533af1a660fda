//! Protocol constants shared by every RMB participant.

/// A twin id: the on-chain numeric identity of a peer.
pub type TwinId = u32;

/// Content-type tag carried in every envelope produced by this library.
pub const DEFAULT_SCHEMA: &str = "application/json";

/// Envelope TTL used when the caller gives no deadline (5 minutes).
pub const DEFAULT_TTL_SECS: u64 = 5 * 60;

/// Lifetime of the bearer token presented to the relay on connect.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 60;

/// Signing context used by sr25519 identities (substrate convention).
pub const SR25519_CONTEXT: &[u8] = b"substrate";

/// Signature prefix bytes identifying the signing curve.
pub mod signature_tag {
    /// Ed25519 signature follows.
    pub const ED25519: u8 = b'e';
    /// Sr25519 (schnorrkel) signature follows.
    pub const SR25519: u8 = b's';
}
