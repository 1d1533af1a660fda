//! The RMB envelope: protobuf wire schema, challenge hash and signing.
//!
//! The message types are declared with `prost` derives so the wire layout
//! stays byte-compatible with other RMB implementations without a build
//! step. Field tags are part of the protocol and must never change.

use crate::crypto::{self, CryptoError, Signer};
use crate::types::TwinId;
use md5::{Digest, Md5};
use prost::Message as _;
use std::fmt::Write as _;
use thiserror::Error;

/// Errors from envelope decoding and structural validation.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The bytes are not a valid protobuf envelope.
    #[error("envelope decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    /// Neither request, response nor error is set.
    #[error("envelope has no message body")]
    MissingBody,
    /// Neither plain nor cipher payload is set.
    #[error("envelope has no payload")]
    MissingPayload,
    /// The source address is absent.
    #[error("envelope has no source address")]
    MissingSource,
}

/// A twin plus optional session identifying one connection of that twin.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct Address {
    /// Twin id.
    #[prost(uint32, tag = "1")]
    pub twin: TwinId,
    /// Session name distinguishing multiple connections of the same twin.
    #[prost(string, optional, tag = "2")]
    pub connection: Option<String>,
}

impl Address {
    /// Address of `twin` with no session.
    #[must_use]
    pub const fn twin(twin: TwinId) -> Self {
        Self {
            twin,
            connection: None,
        }
    }

    /// Address of `twin` on the named session.
    #[must_use]
    pub fn session(twin: TwinId, session: impl Into<String>) -> Self {
        Self {
            twin,
            connection: Some(session.into()),
        }
    }
}

/// Request body: the command string routed to a handler.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Request {
    /// Dotted command path, e.g. `calculator.add`.
    #[prost(string, tag = "1")]
    pub command: String,
}

/// Response body marker. Responses carry their data in the payload.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Response {}

/// Error body describing a remote or relay failure.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct ErrorBody {
    /// Application or relay error code.
    #[prost(uint32, tag = "1")]
    pub code: u32,
    /// Human-readable description.
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Exactly one body kind per envelope.
#[derive(Clone, PartialEq, Eq, prost::Oneof)]
pub enum Body {
    /// Call a remote command.
    #[prost(message, tag = "7")]
    Request(Request),
    /// Successful reply to a request.
    #[prost(message, tag = "8")]
    Response(Response),
    /// Failure reply, from the remote handler or from the relay.
    #[prost(message, tag = "12")]
    Error(ErrorBody),
}

/// Envelope payload, either in the clear or sealed for the recipient.
#[derive(Clone, PartialEq, Eq, prost::Oneof)]
pub enum Payload {
    /// Unencrypted payload bytes.
    #[prost(bytes, tag = "15")]
    Plain(Vec<u8>),
    /// `nonce ‖ AES-256-GCM ciphertext` sealed for the destination.
    #[prost(bytes, tag = "16")]
    Cipher(Vec<u8>),
}

/// The unit of transport between peers.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    /// Correlation id shared by a request and its response.
    #[prost(string, tag = "1")]
    pub uid: String,
    /// Free-form tags, opaque to this library.
    #[prost(string, optional, tag = "2")]
    pub tags: Option<String>,
    /// Creation time, Unix seconds.
    #[prost(uint64, tag = "3")]
    pub timestamp: u64,
    /// Lifetime in seconds counted from `timestamp`.
    #[prost(uint64, tag = "4")]
    pub expiration: u64,
    /// Sender address. Absent on relay-originated errors.
    #[prost(message, optional, tag = "5")]
    pub source: Option<Address>,
    /// Recipient address.
    #[prost(message, optional, tag = "6")]
    pub destination: Option<Address>,
    /// Message body.
    #[prost(oneof = "Body", tags = "7, 8, 12")]
    pub body: Option<Body>,
    /// Curve-tagged signature over [`Envelope::challenge`].
    #[prost(bytes = "vec", optional, tag = "9")]
    pub signature: Option<Vec<u8>>,
    /// Payload content type.
    #[prost(string, optional, tag = "10")]
    pub schema: Option<String>,
    /// Relay domain(s) serving the destination, `_`-joined.
    #[prost(string, optional, tag = "11")]
    pub federation: Option<String>,
    /// Payload bytes.
    #[prost(oneof = "Payload", tags = "15, 16")]
    pub payload: Option<Payload>,
}

impl Envelope {
    /// Serializes to protobuf bytes.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decodes protobuf bytes. Unknown fields are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Decode`] on malformed input.
    pub fn parse(data: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(Self::decode(data)?)
    }

    /// Checks the structural invariants of a peer-originated envelope:
    /// a source, a body and a payload must be present.
    ///
    /// # Errors
    ///
    /// Returns the first missing part.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.source.is_none() {
            return Err(EnvelopeError::MissingSource);
        }
        if self.body.is_none() {
            return Err(EnvelopeError::MissingBody);
        }
        if self.payload.is_none() {
            return Err(EnvelopeError::MissingPayload);
        }
        Ok(())
    }

    /// The request body, if this is a request.
    #[must_use]
    pub fn request(&self) -> Option<&Request> {
        match &self.body {
            Some(Body::Request(req)) => Some(req),
            _ => None,
        }
    }

    /// Whether this envelope is a response.
    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(self.body, Some(Body::Response(_)))
    }

    /// The error body, if this is an error.
    #[must_use]
    pub fn error(&self) -> Option<&ErrorBody> {
        match &self.body {
            Some(Body::Error(err)) => Some(err),
            _ => None,
        }
    }

    /// Plaintext payload, if present and not encrypted.
    #[must_use]
    pub fn plain(&self) -> Option<&[u8]> {
        match &self.payload {
            Some(Payload::Plain(data)) => Some(data),
            _ => None,
        }
    }

    /// Source twin id, if a source address is set.
    #[must_use]
    pub fn source_twin(&self) -> Option<TwinId> {
        self.source.as_ref().map(|a| a.twin)
    }

    /// Whether the envelope lifetime has elapsed at `now` (Unix seconds).
    ///
    /// A zero expiration means the sender set no lifetime.
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration != 0 && self.timestamp.saturating_add(self.expiration) < now
    }

    /// Writes the canonical challenge stream hashed for signing.
    ///
    /// Fields appear in a fixed order, decimal-formatted, with no
    /// separators; absent optionals contribute nothing. The signature field
    /// itself is never part of the stream.
    pub fn write_challenge(&self, out: &mut Vec<u8>) {
        let mut text = String::new();
        text.push_str(&self.uid);
        if let Some(tags) = &self.tags {
            text.push_str(tags);
        }
        // Writing into a String is infallible.
        let _ = write!(text, "{}{}", self.timestamp, self.expiration);
        for addr in [&self.source, &self.destination].into_iter().flatten() {
            let _ = write!(text, "{}", addr.twin);
            if let Some(conn) = &addr.connection {
                text.push_str(conn);
            }
        }
        match &self.body {
            Some(Body::Request(req)) => text.push_str(&req.command),
            Some(Body::Error(err)) => {
                let _ = write!(text, "{}{}", err.code, err.message);
            }
            Some(Body::Response(_)) | None => {}
        }
        if let Some(schema) = &self.schema {
            text.push_str(schema);
        }
        if let Some(federation) = &self.federation {
            text.push_str(federation);
        }
        out.extend_from_slice(text.as_bytes());
        match &self.payload {
            Some(Payload::Plain(data) | Payload::Cipher(data)) => out.extend_from_slice(data),
            None => {}
        }
    }

    /// MD5 digest of the canonical challenge stream.
    #[must_use]
    pub fn challenge(&self) -> [u8; 16] {
        let mut stream = Vec::with_capacity(128);
        self.write_challenge(&mut stream);
        let digest = Md5::digest(&stream);
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest);
        out
    }

    /// Computes the challenge and stores the tagged signature.
    pub fn sign(&mut self, signer: &Signer) {
        let challenge = self.challenge();
        self.signature = Some(signer.sign(&challenge));
    }

    /// Verifies the stored signature against the sender's account key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EmptySignature`] when unsigned, or the
    /// verification failure otherwise.
    pub fn verify(&self, pubkey: &[u8]) -> Result<(), CryptoError> {
        let signature = self
            .signature
            .as_deref()
            .ok_or(CryptoError::EmptySignature)?;
        crypto::verify(pubkey, &self.challenge(), signature)
    }
}
