//! Peer core: identity, directory and relay links behind one handle.
//!
//! A [`Peer`] signs and (when both sides publish an E2E key) encrypts every
//! outbound envelope, and verifies and decrypts every inbound one before
//! handing it to the user's [`Handler`].

use crate::config::PeerConfig;
use crate::connection::{ConnStatus, RelayAuth, RelayConnection};
use crate::directory::{DirectoryCache, DirectoryProvider};
use crate::error::{Error, Result};
use crate::identity::Identity;
use rmb_common::crypto::unix_now;
use rmb_common::envelope::{Body, ErrorBody, Payload, Request, Response};
use rmb_common::types::{DEFAULT_SCHEMA, DEFAULT_TTL_SECS};
use rmb_common::{Address, E2eKey, Envelope, TwinId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Frames buffered between the relay workers and the receive loop.
const INBOUND_BUFFER: usize = 16;

/// Receives every inbound envelope after verification and decryption.
///
/// `error` is set when verification or decryption failed, or when the
/// envelope is a relay- or remote-originated error; the envelope is passed
/// as far as it could be processed. Called from the peer's receive loop:
/// implementations must not block and should spawn for slow work.
pub trait Handler: Send + Sync + 'static {
    /// Handles one inbound envelope.
    fn handle(self: Arc<Self>, peer: &Peer, envelope: Envelope, error: Option<Error>);
}

impl<F> Handler for F
where
    F: Fn(&Peer, Envelope, Option<Error>) + Send + Sync + 'static,
{
    fn handle(self: Arc<Self>, peer: &Peer, envelope: Envelope, error: Option<Error>) {
        (*self)(peer, envelope, error);
    }
}

/// A connected RMB peer. Cheap to clone; all clones share one identity,
/// directory cache and set of relay links.
#[derive(Clone, Debug)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

#[derive(Debug)]
struct PeerInner {
    identity: Identity,
    source: Address,
    encryption: bool,
    directory: DirectoryCache,
    relays: Vec<RelayConnection>,
    next_relay: AtomicUsize,
    config: Arc<PeerConfig>,
    cancel: CancellationToken,
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Peer {
    /// Starts a peer for the twin owning `mnemonic`.
    ///
    /// Looks the twin up by its account key, publishes a corrected relay
    /// record and E2E key if the directory disagrees with `config`, then
    /// opens one relay link per configured URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid configuration or mnemonic and
    /// [`Error::Directory`] if the twin is unknown or the publish fails.
    pub async fn new(
        mnemonic: &str,
        config: PeerConfig,
        provider: Arc<dyn DirectoryProvider>,
        handler: Arc<dyn Handler>,
    ) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let identity = Identity::from_mnemonic(mnemonic, config.key_type)?;
        let directory = DirectoryCache::with_ttl(provider, config.directory.cache_ttl());

        let twin_id = directory.get_by_pubkey(&identity.account_key()).await?;
        info!(twin = twin_id, session = ?config.session, "starting peer");
        let twin = directory.get(twin_id).await?;

        let e2e_public = if config.encryption.enabled {
            identity.e2e_key().public_key()
        } else {
            Vec::new()
        };
        let relay = relay_record(&config.relays)?;

        if twin.e2e_key.as_deref().unwrap_or_default() != e2e_public.as_slice()
            || twin.relay.as_deref() != Some(relay.as_str())
        {
            info!(twin = twin_id, relay = %relay, "twin relay/public key didn't match, updating directory");
            directory
                .publish(twin_id, identity.signer(), &relay, &e2e_public)
                .await?;
        }

        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let auth = RelayAuth {
            signer: identity.signer().clone(),
            twin: twin_id,
            session: config.session.clone(),
        };
        let relays = config
            .relays
            .iter()
            .map(|url| {
                RelayConnection::start(
                    url.clone(),
                    Arc::clone(&config),
                    auth.clone(),
                    inbound_tx.clone(),
                    cancel.child_token(),
                )
            })
            .collect();

        let inner = Arc::new(PeerInner {
            source: Address {
                twin: twin_id,
                connection: config.session.clone(),
            },
            encryption: config.encryption.enabled,
            identity,
            directory,
            relays,
            next_relay: AtomicUsize::new(0),
            config,
            cancel: cancel.clone(),
        });

        tokio::spawn(receive_loop(
            Arc::downgrade(&inner),
            inbound_rx,
            handler,
            cancel,
        ));

        Ok(Self { inner })
    }

    /// This peer's twin id.
    #[must_use]
    pub fn twin(&self) -> TwinId {
        self.inner.source.twin
    }

    /// This peer's address (twin and session).
    #[must_use]
    pub fn source(&self) -> &Address {
        &self.inner.source
    }

    /// The key material this peer was started with.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// The effective configuration.
    #[must_use]
    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    /// The directory cache shared by all clones of this peer.
    #[must_use]
    pub fn directory(&self) -> &DirectoryCache {
        &self.inner.directory
    }

    /// Whether at least one relay link is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.relays.iter().any(RelayConnection::is_connected)
    }

    /// Waits until at least one relay link is up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if every relay worker has stopped.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut watchers: Vec<_> = self
            .inner
            .relays
            .iter()
            .map(RelayConnection::subscribe)
            .collect();
        loop {
            if watchers
                .iter()
                .any(|w| *w.borrow() == ConnStatus::Connected)
            {
                return Ok(());
            }
            let (changed, idx) = {
                let (changed, idx, _rest) = futures_util::future::select_all(
                    watchers.iter_mut().map(|w| Box::pin(w.changed())),
                )
                .await;
                (changed, idx)
            };
            if changed.is_err() {
                watchers.swap_remove(idx);
                if watchers.is_empty() {
                    return Err(Error::ConnectionClosed);
                }
            }
        }
    }

    /// Stops the relay links and the receive loop.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// Sends a request envelope for `command` to `dest`.
    ///
    /// `ttl` is the envelope lifetime in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Directory`] if `dest` is unknown,
    /// [`Error::EncryptFailed`] if sealing fails, or
    /// [`Error::ConnectionClosed`] if no relay link accepts the frame.
    pub async fn send_request(
        &self,
        uid: &str,
        dest: Address,
        command: &str,
        payload: &[u8],
        ttl: u64,
    ) -> Result<()> {
        let body = Body::Request(Request {
            command: command.to_string(),
        });
        let envelope = self.make_envelope(uid, dest, body, payload, ttl).await?;
        self.send(&envelope).await
    }

    /// Answers request `uid` with either `payload` or, when `error` is set,
    /// an error envelope.
    ///
    /// # Errors
    ///
    /// Same as [`Peer::send_request`].
    pub async fn send_response(
        &self,
        uid: &str,
        dest: Address,
        error: Option<ErrorBody>,
        payload: &[u8],
    ) -> Result<()> {
        let body = match error {
            Some(err) => Body::Error(err),
            None => Body::Response(Response {}),
        };
        let envelope = self
            .make_envelope(uid, dest, body, payload, DEFAULT_TTL_SECS)
            .await?;
        self.send(&envelope).await
    }

    fn e2e_key(&self) -> Option<&E2eKey> {
        self.inner
            .encryption
            .then(|| self.inner.identity.e2e_key())
    }

    async fn make_envelope(
        &self,
        uid: &str,
        dest: Address,
        body: Body,
        payload: &[u8],
        ttl: u64,
    ) -> Result<Envelope> {
        let twin = self.inner.directory.get(dest.twin).await?;

        let payload = match (self.e2e_key(), twin.e2e_key()) {
            (Some(key), Some(their_key)) => Payload::Cipher(
                key.seal(their_key, payload)
                    .map_err(|e| Error::EncryptFailed(e.to_string()))?,
            ),
            _ => Payload::Plain(payload.to_vec()),
        };

        let mut envelope = Envelope {
            uid: uid.to_string(),
            tags: None,
            timestamp: unix_now(),
            expiration: ttl,
            source: Some(self.inner.source.clone()),
            destination: Some(dest),
            body: Some(body),
            signature: None,
            schema: Some(DEFAULT_SCHEMA.to_string()),
            federation: twin.relay.clone(),
            payload: Some(payload),
        };
        envelope.sign(self.inner.identity.signer());
        Ok(envelope)
    }

    /// Writes the frame to the next relay in round-robin order, preferring
    /// links that are up and failing over when a link's worker is gone.
    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let frame = envelope.serialize();
        let relays = &self.inner.relays;
        let start = self.inner.next_relay.fetch_add(1, Ordering::Relaxed);
        let mut order: Vec<&RelayConnection> = (0..relays.len())
            .map(|i| &relays[(start + i) % relays.len()])
            .collect();
        order.sort_by_key(|conn| !conn.is_connected());

        for conn in order {
            match conn.send(frame.clone()).await {
                Ok(()) => {
                    debug!(uid = %envelope.uid, relay = conn.url(), "envelope handed to relay");
                    return Ok(());
                }
                Err(_) => warn!(relay = conn.url(), "relay writer closed, trying next"),
            }
        }
        Err(Error::ConnectionClosed)
    }

    /// Verifies an inbound envelope and replaces a cipher payload with its
    /// plaintext.
    async fn check_incoming(&self, envelope: &mut Envelope) -> Result<()> {
        let Some(source) = envelope.source.clone() else {
            // only the relay sends envelopes without a source
            return Err(match envelope.error() {
                Some(err) => Error::Remote {
                    code: err.code,
                    message: err.message.clone(),
                },
                None => Error::Protocol("received an invalid envelope".to_string()),
            });
        };

        let twin = self.inner.directory.get(source.twin).await?;
        if let Err(e) = envelope.verify(&twin.account) {
            warn!(uid = %envelope.uid, twin = source.twin, error = %e, "dropping envelope with bad signature");
            return Err(Error::BadSignature(e.to_string()));
        }

        if let Some(err) = envelope.error() {
            return Err(Error::Remote {
                code: err.code,
                message: err.message.clone(),
            });
        }
        envelope
            .validate()
            .map_err(|e| Error::Protocol(e.to_string()))?;

        if let Some(Payload::Cipher(cipher)) = &envelope.payload {
            let Some(key) = self.e2e_key() else {
                return Err(Error::DecryptFailed(
                    "received an encrypted message while encryption is not enabled".to_string(),
                ));
            };
            let Some(sender_key) = twin.e2e_key() else {
                return Err(Error::DecryptFailed(format!(
                    "twin {} has no e2e key",
                    source.twin
                )));
            };
            let plain = key.open(sender_key, cipher).map_err(|e| {
                warn!(uid = %envelope.uid, twin = source.twin, error = %e, "could not decrypt payload");
                Error::DecryptFailed(e.to_string())
            })?;
            envelope.payload = Some(Payload::Plain(plain));
        }

        Ok(())
    }
}

/// Directory relay record for a set of relay URLs: hostnames (with port when
/// one is given) sorted case-insensitively, de-duplicated and joined with `_`.
///
/// # Errors
///
/// Returns [`Error::Config`] if a URL does not parse or has no host.
pub fn relay_record(urls: &[String]) -> Result<String> {
    let mut hosts = urls
        .iter()
        .map(|raw| {
            let url = url::Url::parse(raw)
                .map_err(|e| Error::Config(format!("failed to parse url {raw}: {e}")))?;
            let host = url
                .host_str()
                .ok_or_else(|| Error::Config(format!("relay url has no host: {raw}")))?;
            Ok(match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    hosts.sort_by_key(|h| h.to_lowercase());
    hosts.dedup();
    Ok(hosts.join("_"))
}

async fn receive_loop(
    weak: Weak<PeerInner>,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    handler: Arc<dyn Handler>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let Some(inner) = weak.upgrade() else { break };
        let peer = Peer { inner };

        let mut envelope = match Envelope::parse(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping undecodable envelope");
                continue;
            }
        };
        if envelope.is_expired(unix_now()) {
            debug!(uid = %envelope.uid, "dropping expired envelope");
            continue;
        }

        let error = peer.check_incoming(&mut envelope).await.err();
        Arc::clone(&handler).handle(&peer, envelope, error);
    }
    debug!("receive loop stopped");
}
