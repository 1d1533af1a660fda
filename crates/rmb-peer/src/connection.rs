//! Self-healing WebSocket link to one relay.
//!
//! A [`RelayConnection`] owns a background worker that connects, runs the
//! socket until it fails, waits out a backoff and connects again. The
//! outward channels survive reconnects; only the socket cycles. A frame taken
//! from the writer but not yet flushed when the socket dies is lost.

use crate::backoff::ExponentialBackoff;
use crate::config::PeerConfig;
use crate::error::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use rmb_common::{token, Signer, TwinId};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
enum RelayError {
    Fatal(anyhow::Error),
    Transient(anyhow::Error),
}

/// Connection status of a relay WebSocket link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// No socket; either backing off or shut down.
    Disconnected,
    /// Dialing the relay.
    Connecting,
    /// Socket open, frames flow.
    Connected,
}

/// Credentials presented to the relay on every connect.
#[derive(Clone, Debug)]
pub struct RelayAuth {
    /// Signs the bearer token.
    pub signer: Signer,
    /// Twin the token is issued for.
    pub twin: TwinId,
    /// Session claim, if any.
    pub session: Option<String>,
}

/// Handle to one relay link.
#[derive(Debug)]
pub struct RelayConnection {
    url: String,
    writer: mpsc::Sender<Vec<u8>>,
    status: watch::Receiver<ConnStatus>,
}

impl RelayConnection {
    /// Spawns the connection worker for `url`.
    ///
    /// Inbound binary frames are forwarded to `inbound`. The worker stops
    /// when `cancel` fires, when `inbound` is closed, or when every clone of
    /// the writer is dropped.
    #[must_use]
    pub fn start(
        url: String,
        config: Arc<PeerConfig>,
        auth: RelayAuth,
        inbound: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Self {
        // capacity 1: a sender waits until the worker has taken the previous frame
        let (writer, writer_rx) = mpsc::channel(1);
        let (status_tx, status) = watch::channel(ConnStatus::Disconnected);

        tokio::spawn(relay_connection_manager(
            url.clone(),
            config,
            auth,
            writer_rx,
            inbound,
            status_tx,
            cancel,
        ));

        Self {
            url,
            writer,
            status,
        }
    }

    /// The relay URL, without credentials.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current link status.
    #[must_use]
    pub fn status(&self) -> ConnStatus {
        *self.status.borrow()
    }

    /// Whether the socket is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ConnStatus::Connected
    }

    /// Subscribes to status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnStatus> {
        self.status.clone()
    }

    /// Hands a frame to the worker, waiting while the previous one is pending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] once the worker has stopped.
    pub async fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.writer
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// The relay URL with the bearer token set as the raw query string.
///
/// A URL without a path gets `/`, so the request target is `/?<token>`.
///
/// # Errors
///
/// Returns [`Error::Config`] if the URL does not parse or the token cannot
/// be encoded.
pub fn authenticated_url(url: &str, auth: &RelayAuth, ttl_secs: u64) -> Result<String> {
    let mut target =
        url::Url::parse(url).map_err(|e| Error::Config(format!("invalid relay URL {url}: {e}")))?;
    let token = token::issue(&auth.signer, auth.twin, auth.session.as_deref(), ttl_secs)
        .map_err(|e| Error::Config(format!("cannot issue relay token: {e}")))?;
    target.set_query(Some(&token));
    Ok(target.into())
}

async fn relay_connection_manager(
    url: String,
    config: Arc<PeerConfig>,
    auth: RelayAuth,
    mut writer_rx: mpsc::Receiver<Vec<u8>>,
    inbound: mpsc::Sender<Vec<u8>>,
    status_tx: watch::Sender<ConnStatus>,
    cancel: CancellationToken,
) {
    let mut backoff = ExponentialBackoff::from(&config.reconnect);

    loop {
        status_tx.send_replace(ConnStatus::Connecting);

        match connect_and_run(
            &url,
            &config,
            &auth,
            &mut writer_rx,
            &inbound,
            &status_tx,
            &cancel,
        )
        .await
        {
            Ok(()) => {
                info!(relay = %url, "relay connection closed");
                break;
            }
            Err(RelayError::Fatal(e)) => {
                error!(relay = %url, error = %e, "fatal relay error, not retrying");
                break;
            }
            Err(RelayError::Transient(e)) => {
                let was_connected = *status_tx.borrow() == ConnStatus::Connected;
                warn!(relay = %url, error = %e, "relay connection lost");
                status_tx.send_replace(ConnStatus::Disconnected);
                if was_connected {
                    backoff.reset();
                }
            }
        }

        let delay = backoff.next_delay();
        info!(
            relay = %url,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting"
        );
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    status_tx.send_replace(ConnStatus::Disconnected);
}

async fn connect_and_run(
    url: &str,
    config: &PeerConfig,
    auth: &RelayAuth,
    writer_rx: &mut mpsc::Receiver<Vec<u8>>,
    inbound: &mpsc::Sender<Vec<u8>>,
    status_tx: &watch::Sender<ConnStatus>,
    cancel: &CancellationToken,
) -> std::result::Result<(), RelayError> {
    let target = authenticated_url(url, auth, config.token_ttl_s)
        .map_err(|e| RelayError::Fatal(e.into()))?;

    debug!(relay = %url, "connecting");
    let connect = tokio_tungstenite::connect_async(target.as_str());
    let (ws, _) = tokio::select! {
        () = cancel.cancelled() => return Ok(()),
        res = connect => res.map_err(|e| RelayError::Transient(e.into()))?,
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    status_tx.send_replace(ConnStatus::Connected);
    info!(relay = %url, twin = auth.twin, "connected to relay");

    let ping_interval = config.keepalive.ping_interval();
    let pong_wait = config.keepalive.pong_wait();
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(());
            }

            msg = ws_rx.next() => {
                let msg = msg
                    .ok_or_else(|| RelayError::Transient(anyhow::anyhow!("connection closed")))
                    .and_then(|r| r.map_err(|e| RelayError::Transient(e.into())))?;
                match msg {
                    Message::Binary(data) => {
                        last_seen = Instant::now();
                        if inbound.send(data).await.is_err() {
                            debug!(relay = %url, "inbound receiver gone, stopping");
                            return Ok(());
                        }
                    }
                    Message::Pong(_) => {
                        last_seen = Instant::now();
                    }
                    Message::Ping(data) => {
                        last_seen = Instant::now();
                        ws_tx.send(Message::Pong(data)).await
                            .map_err(|e| RelayError::Transient(e.into()))?;
                    }
                    Message::Text(_) => {
                        error!(relay = %url, "invalid message type received");
                        return Err(RelayError::Transient(anyhow::anyhow!("text frame from relay")));
                    }
                    Message::Close(frame) => {
                        return Err(RelayError::Transient(anyhow::anyhow!(
                            "relay closed the connection: {frame:?}"
                        )));
                    }
                    Message::Frame(_) => {}
                }
            }

            outbound = writer_rx.recv() => {
                let Some(frame) = outbound else {
                    debug!(relay = %url, "writer closed, stopping");
                    return Ok(());
                };
                ws_tx.send(Message::Binary(frame)).await
                    .map_err(|e| RelayError::Transient(e.into()))?;
            }

            _ = ping.tick() => {
                ws_tx.send(Message::Ping(Vec::new())).await
                    .map_err(|e| RelayError::Transient(e.into()))?;
                if last_seen.elapsed() > pong_wait {
                    warn!(relay = %url, silent_for = ?last_seen.elapsed(), "connection stalling");
                    return Err(RelayError::Transient(anyhow::anyhow!("connection stalling")));
                }
            }
        }
    }
}
