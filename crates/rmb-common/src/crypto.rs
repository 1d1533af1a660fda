//! Curve-tagged signing and verification.
//!
//! Every signature produced by an RMB peer is prefixed with a single byte
//! naming the curve (`'e'` for ed25519, `'s'` for sr25519) so the verifier
//! can pick the algorithm without any out-of-band negotiation.

use crate::types::{signature_tag, SR25519_CONTEXT};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from signing-key handling and signature verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// The signature carried no bytes at all.
    #[error("signature is empty")]
    EmptySignature,
    /// The first signature byte names no supported curve.
    #[error("unrecognized signature prefix 0x{0:02x}")]
    UnknownCurve(u8),
    /// A key could not be decoded for the selected curve.
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// The signature did not verify against the message and key.
    #[error("could not verify signature")]
    BadSignature,
}

/// Signing curve family of an identity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// Edwards-curve signatures (RFC 8032).
    Ed25519,
    /// Schnorr signatures over ristretto255, the chain default.
    #[default]
    Sr25519,
}

impl KeyType {
    /// The one-byte wire prefix for signatures made with this curve.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Ed25519 => signature_tag::ED25519,
            Self::Sr25519 => signature_tag::SR25519,
        }
    }

    /// Resolves a wire prefix back into a curve.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownCurve`] for any byte other than `'e'`/`'s'`.
    pub const fn from_tag(tag: u8) -> Result<Self, CryptoError> {
        match tag {
            signature_tag::ED25519 => Ok(Self::Ed25519),
            signature_tag::SR25519 => Ok(Self::Sr25519),
            other => Err(CryptoError::UnknownCurve(other)),
        }
    }

    /// Lowercase name as used in configuration files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::Sr25519 => "sr25519",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" => Ok(Self::Ed25519),
            "sr25519" => Ok(Self::Sr25519),
            other => Err(CryptoError::InvalidKey(format!(
                "unsupported key type '{other}', expected ed25519 or sr25519"
            ))),
        }
    }
}

/// A signing identity fixed to one curve family.
#[derive(Clone)]
pub enum Signer {
    /// Ed25519 signing key.
    Ed25519(ed25519_dalek::SigningKey),
    /// Sr25519 keypair.
    Sr25519(schnorrkel::Keypair),
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("key_type", &self.key_type())
            .finish_non_exhaustive()
    }
}

impl Signer {
    /// Builds a signer from a 32-byte secret seed.
    ///
    /// For ed25519 the seed is the secret key; for sr25519 it is the
    /// mini-secret, expanded the way substrate wallets expand it.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the seed is rejected by the curve.
    pub fn from_seed(key_type: KeyType, seed: &[u8; 32]) -> Result<Self, CryptoError> {
        match key_type {
            KeyType::Ed25519 => Ok(Self::Ed25519(ed25519_dalek::SigningKey::from_bytes(seed))),
            KeyType::Sr25519 => {
                let mini = schnorrkel::MiniSecretKey::from_bytes(seed)
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                Ok(Self::Sr25519(
                    mini.expand_to_keypair(schnorrkel::ExpansionMode::Ed25519),
                ))
            }
        }
    }

    /// Curve family of this signer.
    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        match self {
            Self::Ed25519(_) => KeyType::Ed25519,
            Self::Sr25519(_) => KeyType::Sr25519,
        }
    }

    /// The 32-byte account public key registered on chain.
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        match self {
            Self::Ed25519(key) => key.verifying_key().to_bytes(),
            Self::Sr25519(pair) => pair.public.to_bytes(),
        }
    }

    /// Signs `msg` and returns `tag ‖ raw signature`.
    ///
    /// # Examples
    ///
    /// ```
    /// use rmb_common::crypto::{self, KeyType, Signer};
    ///
    /// let signer = Signer::from_seed(KeyType::Ed25519, &[7u8; 32]).unwrap();
    /// let sig = signer.sign(b"hello");
    /// assert_eq!(sig[0], b'e');
    /// assert!(crypto::verify(&signer.public_key(), b"hello", &sig).is_ok());
    /// ```
    #[must_use]
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let raw: [u8; 64] = match self {
            Self::Ed25519(key) => {
                use ed25519_dalek::Signer as _;
                key.sign(msg).to_bytes()
            }
            Self::Sr25519(pair) => pair.sign_simple(SR25519_CONTEXT, msg).to_bytes(),
        };
        let mut out = Vec::with_capacity(1 + raw.len());
        out.push(self.key_type().tag());
        out.extend_from_slice(&raw);
        out
    }
}

/// Verifies a curve-tagged `signature` over `msg` with the account key `pubkey`.
///
/// The first byte of the signature selects the algorithm; unknown prefixes
/// are rejected before any key parsing happens.
///
/// # Errors
///
/// Returns [`CryptoError`] if the signature is empty, the prefix is unknown,
/// the key or signature bytes are malformed, or verification fails.
pub fn verify(pubkey: &[u8], msg: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let (&tag, raw) = signature
        .split_first()
        .ok_or(CryptoError::EmptySignature)?;

    match KeyType::from_tag(tag)? {
        KeyType::Ed25519 => {
            use ed25519_dalek::Verifier as _;
            let key: [u8; 32] = pubkey
                .try_into()
                .map_err(|_| CryptoError::InvalidKey(format!("ed25519 key length {}", pubkey.len())))?;
            let key = ed25519_dalek::VerifyingKey::from_bytes(&key)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            let sig = ed25519_dalek::Signature::from_slice(raw)
                .map_err(|_| CryptoError::BadSignature)?;
            key.verify(msg, &sig).map_err(|_| CryptoError::BadSignature)
        }
        KeyType::Sr25519 => {
            let key = schnorrkel::PublicKey::from_bytes(pubkey)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            let sig =
                schnorrkel::Signature::from_bytes(raw).map_err(|_| CryptoError::BadSignature)?;
            key.verify_simple(SR25519_CONTEXT, msg, &sig)
                .map_err(|_| CryptoError::BadSignature)
        }
    }
}

/// Returns the current Unix timestamp in seconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
#[must_use]
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
