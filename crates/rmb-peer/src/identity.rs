//! Key material derived from a twin's BIP39 mnemonic.
//!
//! One phrase yields two independent keys:
//! - the signing identity, derived the substrate way
//!   (`PBKDF2-HMAC-SHA512(entropy, "mnemonic", 2048)`, first 32 bytes as the
//!   ed25519 seed or sr25519 mini-secret);
//! - the secp256k1 E2E key, the first 32 bytes of the standard BIP39 seed.

use crate::error::{Error, Result};
use bip39::Mnemonic;
use rand::rngs::OsRng;
use rand::RngCore;
use rmb_common::{E2eKey, KeyType, Signer};
use sha2::Sha512;
use zeroize::Zeroizing;

const PBKDF2_ROUNDS: u32 = 2048;

/// Signing and encryption keys of a twin.
#[derive(Clone, Debug)]
pub struct Identity {
    signer: Signer,
    e2e: E2eKey,
}

impl Identity {
    /// Derives both keys from `phrase`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the phrase is not a valid English BIP39
    /// mnemonic or a derived key is rejected by its curve.
    pub fn from_mnemonic(phrase: &str, key_type: KeyType) -> Result<Self> {
        let mnemonic = Mnemonic::parse_normalized(phrase.trim())
            .map_err(|e| Error::Config(format!("invalid mnemonic: {e}")))?;

        let entropy = Zeroizing::new(mnemonic.to_entropy());
        let mini = mini_secret(&entropy, "");
        let signer =
            Signer::from_seed(key_type, &mini).map_err(|e| Error::Config(e.to_string()))?;

        let seed = Zeroizing::new(mnemonic.to_seed_normalized(""));
        let e2e = E2eKey::from_bytes(&seed[..32]).map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self { signer, e2e })
    }

    /// Generates a fresh 12-word English mnemonic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the word list cannot encode the entropy.
    pub fn generate_phrase() -> Result<String> {
        let mut entropy = Zeroizing::new([0u8; 16]);
        OsRng.fill_bytes(entropy.as_mut());
        let mnemonic = Mnemonic::from_entropy(entropy.as_ref())
            .map_err(|e| Error::Config(format!("mnemonic generation: {e}")))?;
        Ok(mnemonic.to_string())
    }

    /// The signing identity.
    #[must_use]
    pub const fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Curve family of the signing identity.
    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        self.signer.key_type()
    }

    /// The account public key registered on chain.
    #[must_use]
    pub fn account_key(&self) -> [u8; 32] {
        self.signer.public_key()
    }

    /// The secp256k1 encryption key.
    #[must_use]
    pub const fn e2e_key(&self) -> &E2eKey {
        &self.e2e
    }
}

/// Substrate mini-secret: PBKDF2 over the raw mnemonic entropy.
fn mini_secret(entropy: &[u8], password: &str) -> Zeroizing<[u8; 32]> {
    let salt = Zeroizing::new(format!("mnemonic{password}"));
    let mut seed = Zeroizing::new([0u8; 64]);
    pbkdf2::pbkdf2_hmac::<Sha512>(entropy, salt.as_bytes(), PBKDF2_ROUNDS, seed.as_mut());
    let mut mini = Zeroizing::new([0u8; 32]);
    mini.copy_from_slice(&seed[..32]);
    mini
}
