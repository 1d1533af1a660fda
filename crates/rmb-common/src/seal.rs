//! Per-message end-to-end encryption between two twins.
//!
//! Both sides hold a secp256k1 key whose compressed public point is published
//! in the twin directory. The symmetric key is `SHA-256(compressed(d·Q))`, the
//! same in both directions, so either party can open what the other sealed.
//!
//! Wire format: `[nonce (12B) | AES-256-GCM ciphertext+tag]`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// Length of a compressed secp256k1 public key.
pub const PUBLIC_KEY_LEN: usize = 33;

/// Errors from E2E key handling and seal/open operations.
#[derive(Debug, Error)]
pub enum SealError {
    /// The secret scalar is zero or out of range.
    #[error("invalid secret key")]
    InvalidSecret,
    /// The peer's public key is not a valid SEC1 point.
    #[error("invalid public key")]
    InvalidPublicKey,
    /// Cipher bytes too short to hold nonce and tag.
    #[error("malformed cipher: {0}")]
    Malformed(&'static str),
    /// AEAD encryption failed.
    #[error("encryption failed")]
    Encrypt,
    /// AEAD authentication failed: wrong key or tampered bytes.
    #[error("decryption failed")]
    Decrypt,
}

/// A twin's secp256k1 encryption key.
#[derive(Clone)]
pub struct E2eKey {
    secret: k256::SecretKey,
}

impl fmt::Debug for E2eKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("E2eKey").finish_non_exhaustive()
    }
}

impl E2eKey {
    /// Builds the key from a 32-byte big-endian scalar.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::InvalidSecret`] for a zero or out-of-range scalar.
    pub fn from_bytes(secret: &[u8]) -> Result<Self, SealError> {
        let secret = k256::SecretKey::from_slice(secret).map_err(|_| SealError::InvalidSecret)?;
        Ok(Self { secret })
    }

    /// Compressed SEC1 public key, 33 bytes.
    #[must_use]
    pub fn public_key(&self) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    /// Derives the symmetric key shared with the holder of `their_public`.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::InvalidPublicKey`] if `their_public` is not a point.
    pub fn shared_key(&self, their_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, SealError> {
        let public = k256::PublicKey::from_sec1_bytes(their_public)
            .map_err(|_| SealError::InvalidPublicKey)?;
        let point = (public.to_projective() * *self.secret.to_nonzero_scalar()).to_affine();
        let compressed = point.to_encoded_point(true);
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&Sha256::digest(compressed.as_bytes()));
        Ok(key)
    }

    /// Encrypts `plaintext` for `recipient_public` under a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns [`SealError`] if the recipient key is invalid or encryption fails.
    pub fn seal(&self, recipient_public: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let key = self.shared_key(recipient_public)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| SealError::Encrypt)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SealError::Encrypt)?;

        let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&ciphertext);
        Ok(wire)
    }

    /// Decrypts bytes sealed by the holder of `sender_public`.
    ///
    /// # Errors
    ///
    /// Returns [`SealError`] if the input is truncated, the sender key is
    /// invalid, or authentication fails.
    pub fn open(&self, sender_public: &[u8], wire: &[u8]) -> Result<Vec<u8>, SealError> {
        if wire.len() < NONCE_LEN + TAG_LEN {
            return Err(SealError::Malformed("shorter than nonce and tag"));
        }
        let (nonce, ciphertext) = wire.split_at(NONCE_LEN);
        let key = self.shared_key(sender_public)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| SealError::Decrypt)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Decrypt)
    }
}
