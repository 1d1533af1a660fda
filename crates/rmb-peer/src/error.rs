use rmb_common::TwinId;
use thiserror::Error;

/// Failures talking to the twin directory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// No twin is registered under this id.
    #[error("twin {0} not found")]
    NotFound(TwinId),
    /// No twin is registered for this account key.
    #[error("no twin registered for this public key")]
    UnknownKey,
    /// The provider itself failed (network, chain, authorization).
    #[error("directory provider: {0}")]
    Provider(String),
}

/// Errors surfaced by the peer, the RPC client and the router.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid mnemonic, key type or configuration value. Startup only.
    #[error("configuration error: {0}")]
    Config(String),
    /// Directory lookup or publish failed.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    /// No relay connection could accept the frame.
    #[error("relay connection closed")]
    ConnectionClosed,
    /// Malformed envelope, wrong schema or unexpected message kind.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The envelope signature did not verify.
    #[error("message signature verification failed: {0}")]
    BadSignature(String),
    /// Sealing the payload for the destination failed.
    #[error("could not encrypt data: {0}")]
    EncryptFailed(String),
    /// Opening a cipher payload failed.
    #[error("could not decrypt payload: {0}")]
    DecryptFailed(String),
    /// The remote handler, or the relay, answered with an error envelope.
    #[error("remote error ({code}): {message}")]
    Remote {
        /// Remote error code; 0 when the remote set none.
        code: u32,
        /// Remote error message, verbatim.
        message: String,
    },
    /// The router has no handler for the command.
    #[error("function is not found")]
    FunctionNotFound,
    /// The call deadline elapsed.
    #[error("deadline exceeded")]
    Timeout,
    /// The caller cancelled the call.
    #[error("call cancelled")]
    Cancelled,
    /// JSON encoding or decoding of a payload failed.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
