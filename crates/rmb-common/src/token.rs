//! Relay bearer tokens.
//!
//! A token is a compact JWT (`header.claims.signature`, base64url without
//! padding) signed with the twin's own account key. The header always
//! advertises `RS512`, which relays treat as "curve-tagged RMB signature";
//! the signature segment is the tagged signature over `header.claims`.

use crate::crypto::{self, CryptoError, Signer};
use crate::types::TwinId;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Algorithm name written into every token header.
pub const TOKEN_ALG: &str = "RS512";

/// Errors from token creation, parsing and verification.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Not three dot-separated segments.
    #[error("malformed token")]
    Malformed,
    /// A segment is not valid base64url.
    #[error("invalid token encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
    /// Header or claims are not the expected JSON.
    #[error("invalid token json: {0}")]
    Json(#[from] serde_json::Error),
    /// The header names a different algorithm.
    #[error("unexpected token algorithm '{0}'")]
    Algorithm(String),
    /// The signature does not verify.
    #[error("token signature: {0}")]
    Signature(#[from] CryptoError),
    /// `exp` is in the past.
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Token claims. Field order is alphabetical to match the canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Expiry, Unix seconds.
    pub exp: u64,
    /// Issued-at, Unix seconds.
    pub iat: u64,
    /// Session name, omitted when the peer has none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Twin id of the bearer.
    pub sub: TwinId,
}

/// Issues a token for `twin` valid for `ttl_secs` from now.
///
/// # Errors
///
/// Returns [`TokenError::Json`] if the claims cannot be encoded.
pub fn issue(
    signer: &Signer,
    twin: TwinId,
    session: Option<&str>,
    ttl_secs: u64,
) -> Result<String, TokenError> {
    issue_at(signer, twin, session, crypto::unix_now(), ttl_secs)
}

/// Issues a token with an explicit issue time.
///
/// # Errors
///
/// Returns [`TokenError::Json`] if the claims cannot be encoded.
pub fn issue_at(
    signer: &Signer,
    twin: TwinId,
    session: Option<&str>,
    iat: u64,
    ttl_secs: u64,
) -> Result<String, TokenError> {
    let header = Header {
        alg: TOKEN_ALG.to_string(),
        typ: "JWT".to_string(),
    };
    let claims = Claims {
        exp: iat.saturating_add(ttl_secs),
        iat,
        sid: session.filter(|s| !s.is_empty()).map(str::to_string),
        sub: twin,
    };
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
    );
    let signature = signer.sign(signing_input.as_bytes());
    Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
}

/// Splits a token and decodes its claims without checking the signature.
///
/// Returns the claims, the signing input and the raw tagged signature.
///
/// # Errors
///
/// Returns [`TokenError`] on any structural or encoding problem.
pub fn decode(token: &str) -> Result<(Claims, &str, Vec<u8>), TokenError> {
    let (signing_input, signature) = token.rsplit_once('.').ok_or(TokenError::Malformed)?;
    let (header, claims) = signing_input.split_once('.').ok_or(TokenError::Malformed)?;
    if claims.contains('.') {
        return Err(TokenError::Malformed);
    }
    let header: Header = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header)?)?;
    if header.alg != TOKEN_ALG {
        return Err(TokenError::Algorithm(header.alg));
    }
    let claims: Claims = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(claims)?)?;
    let signature = URL_SAFE_NO_PAD.decode(signature)?;
    Ok((claims, signing_input, signature))
}

/// Verifies a token against the bearer's account key at time `now`.
///
/// # Errors
///
/// Returns [`TokenError`] if decoding fails, the signature is invalid or the
/// token has expired.
pub fn verify(token: &str, pubkey: &[u8], now: u64) -> Result<Claims, TokenError> {
    let (claims, signing_input, signature) = decode(token)?;
    crypto::verify(pubkey, signing_input.as_bytes(), &signature)?;
    if claims.exp < now {
        return Err(TokenError::Expired);
    }
    Ok(claims)
}
