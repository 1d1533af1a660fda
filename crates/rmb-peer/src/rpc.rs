//! Request/response correlation on top of [`Peer`].
//!
//! Every call registers a one-shot slot under a fresh UUID; the
//! [`Correlator`] fills the slot when an envelope with that uid arrives.
//! Slots are removed when the call returns, whatever the outcome, so a late
//! response is dropped instead of piling up.

use crate::config::PeerConfig;
use crate::directory::DirectoryProvider;
use crate::error::{Error, Result};
use crate::peer::{Handler, Peer};
use dashmap::DashMap;
use rmb_common::types::DEFAULT_SCHEMA;
use rmb_common::{Address, Envelope, TwinId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

type Slot = oneshot::Sender<Result<Envelope>>;

/// Routes response and error envelopes to the call waiting on their uid.
#[derive(Debug, Default)]
pub struct Correlator {
    slots: DashMap<String, Slot>,
}

/// Removes its slot on drop.
struct PendingCall<'a> {
    correlator: &'a Correlator,
    uid: &'a str,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.correlator.slots.remove(self.uid);
    }
}

impl Correlator {
    /// Empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register<'a>(&'a self, uid: &'a str) -> (PendingCall<'a>, oneshot::Receiver<Result<Envelope>>) {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(uid.to_string(), tx);
        (
            PendingCall {
                correlator: self,
                uid,
            },
            rx,
        )
    }

    /// Completes the call waiting on `uid`. Returns `false` if none is.
    pub fn deliver(&self, uid: &str, result: Result<Envelope>) -> bool {
        match self.slots.remove(uid) {
            Some((_, slot)) => slot.send(result).is_ok(),
            None => false,
        }
    }

    /// Number of calls currently waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.slots.len()
    }

    /// Delivers an inbound envelope to its caller. Requests are ignored
    /// unless processing them already failed.
    pub fn accept(&self, envelope: Envelope, error: Option<Error>) {
        if error.is_none() && envelope.request().is_some() {
            debug!(uid = %envelope.uid, "correlator ignoring request envelope");
            return;
        }
        let uid = envelope.uid.clone();
        let result = match error {
            Some(err) => Err(err),
            None => Ok(envelope),
        };
        if !self.deliver(&uid, result) {
            debug!(uid = %uid, "no call waiting for envelope, dropping");
        }
    }
}

impl Handler for Correlator {
    fn handle(self: Arc<Self>, _peer: &Peer, envelope: Envelope, error: Option<Error>) {
        self.accept(envelope, error);
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Deadline; defaults to the configured call timeout.
    pub timeout: Option<Duration>,
    /// Aborts the call with [`Error::Cancelled`] when fired.
    pub cancel: Option<CancellationToken>,
}

/// Typed JSON request/response client.
#[derive(Clone, Debug)]
pub struct RpcClient {
    peer: Peer,
    correlator: Arc<Correlator>,
}

impl RpcClient {
    /// Wraps a peer whose handler routes responses into `correlator`.
    #[must_use]
    pub fn new(peer: Peer, correlator: Arc<Correlator>) -> Self {
        Self { peer, correlator }
    }

    /// Starts a client-only peer: every inbound envelope goes to the
    /// correlator.
    ///
    /// # Errors
    ///
    /// Same as [`Peer::new`].
    pub async fn connect(
        mnemonic: &str,
        config: PeerConfig,
        provider: Arc<dyn DirectoryProvider>,
    ) -> Result<Self> {
        let correlator = Arc::new(Correlator::new());
        let peer = Peer::new(mnemonic, config, provider, Arc::clone(&correlator) as Arc<dyn Handler>).await?;
        Ok(Self::new(peer, correlator))
    }

    /// The underlying peer.
    #[must_use]
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Number of calls waiting for a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.correlator.pending()
    }

    /// Calls `command` on twin `twin` with the default options.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call_with`].
    pub async fn call<T, R>(&self, twin: TwinId, command: &str, data: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_with(Address::twin(twin), command, data, CallOptions::default())
            .await
    }

    /// Sends `data` as JSON to `dest` and decodes the JSON answer.
    ///
    /// The envelope TTL is the deadline rounded up to whole seconds.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when the deadline elapses, [`Error::Cancelled`]
    /// when `options.cancel` fires, [`Error::Remote`] when the remote
    /// answers with an error, [`Error::Protocol`] for a malformed answer,
    /// plus any send or verification failure.
    pub async fn call_with<T, R>(
        &self,
        dest: Address,
        command: &str,
        data: &T,
        options: CallOptions,
    ) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(data)?;
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.peer.config().rpc.call_timeout());
        let uid = Uuid::new_v4().to_string();
        let (slot, rx) = self.correlator.register(&uid);

        let exchange = async {
            self.peer
                .send_request(&uid, dest, command, &payload, ttl_secs(timeout))
                .await?;
            rx.await.map_err(|_| Error::ConnectionClosed)?
        };
        let cancelled = async {
            match &options.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            res = tokio::time::timeout(timeout, exchange) => {
                res.map_err(|_| Error::Timeout).and_then(|r| r)
            }
            () = cancelled => Err(Error::Cancelled),
        };
        drop(slot);

        let envelope = outcome?;
        Ok(serde_json::from_slice(response_payload(&envelope)?)?)
    }
}

/// Envelope lifetime for a deadline: whole seconds, rounded up, at least 1.
fn ttl_secs(timeout: Duration) -> u64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}

/// The plaintext JSON body of a response envelope.
///
/// # Errors
///
/// [`Error::Remote`] for error envelopes, [`Error::Protocol`] for anything
/// that is not a plain `application/json` response.
pub fn response_payload(envelope: &Envelope) -> Result<&[u8]> {
    if let Some(err) = envelope.error() {
        return Err(Error::Remote {
            code: err.code,
            message: err.message.clone(),
        });
    }
    if !envelope.is_response() {
        return Err(Error::Protocol(
            "received a non response envelope".to_string(),
        ));
    }
    if envelope.schema.as_deref() != Some(DEFAULT_SCHEMA) {
        return Err(Error::Protocol(format!(
            "invalid schema received expected '{DEFAULT_SCHEMA}'"
        )));
    }
    envelope
        .plain()
        .ok_or_else(|| Error::Protocol("payload is not in plain format".to_string()))
}
