#![allow(dead_code)]

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use rmb_common::crypto::unix_now;
use rmb_common::envelope::{Body, ErrorBody, Payload};
use rmb_common::{token, Address, Envelope, KeyType, TwinId};
use rmb_peer::directory::DirectoryProvider;
use rmb_peer::{Handler, Identity, MemoryDirectory, Peer, PeerConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

type SessionKey = (TwinId, Option<String>);

struct Session {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
    kill: CancellationToken,
}

/// Minimal relay: authenticates the bearer token against the directory and
/// forwards envelopes by destination twin and session.
pub struct RelayState {
    directory: Arc<MemoryDirectory>,
    sessions: DashMap<SessionKey, Session>,
    connects: DashMap<TwinId, usize>,
    next_id: AtomicU64,
    tamper: AtomicBool,
    mute: AtomicBool,
    sniffed: Mutex<Vec<Envelope>>,
}

pub struct TestRelay {
    pub addr: SocketAddr,
    pub state: Arc<RelayState>,
}

impl TestRelay {
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Flip one payload byte of every forwarded envelope.
    pub fn set_tamper(&self, on: bool) {
        self.state.tamper.store(on, Ordering::SeqCst);
    }

    /// Stop reading every socket: no pongs, no forwarding.
    pub fn set_mute(&self, on: bool) {
        self.state.mute.store(on, Ordering::SeqCst);
    }

    /// Sends a text frame to every socket of `twin`.
    pub fn send_text(&self, twin: TwinId) {
        for entry in self.state.sessions.iter() {
            if entry.key().0 == twin {
                let _ = entry.value().tx.send(Message::Text("hello".into()));
            }
        }
    }

    /// Every envelope the relay has seen, in arrival order.
    pub fn sniffed(&self) -> Vec<Envelope> {
        self.state.sniffed.lock().unwrap().clone()
    }

    /// Number of successful handshakes by `twin`.
    pub fn connects(&self, twin: TwinId) -> usize {
        self.state.connects.get(&twin).map_or(0, |c| *c)
    }

    /// Drops every socket of `twin` without a close frame.
    pub fn kill(&self, twin: TwinId) {
        for entry in self.state.sessions.iter() {
            if entry.key().0 == twin {
                entry.value().kill.cancel();
            }
        }
    }

    pub fn is_online(&self, address: &Address) -> bool {
        self.state
            .sessions
            .contains_key(&(address.twin, address.connection.clone()))
    }

    pub async fn wait_online(&self, address: &Address) {
        wait_until(|| self.is_online(address)).await;
    }
}

pub async fn start_relay(directory: Arc<MemoryDirectory>) -> TestRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(RelayState {
        directory,
        sessions: DashMap::new(),
        connects: DashMap::new(),
        next_id: AtomicU64::new(1),
        tamper: AtomicBool::new(false),
        mute: AtomicBool::new(false),
        sniffed: Mutex::new(Vec::new()),
    });

    let state_clone = Arc::clone(&state);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handle_connection(stream, Arc::clone(&state_clone)));
        }
    });

    TestRelay { addr, state }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

fn authorize(state: &RelayState, query: Option<&str>) -> Result<SessionKey, ErrorResponse> {
    let raw = query.ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "missing token"))?;
    let (claims, _, _) =
        token::decode(raw).map_err(|_| reject(StatusCode::UNAUTHORIZED, "bad token"))?;
    let twin = state
        .directory
        .twin(claims.sub)
        .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "unknown twin"))?;
    token::verify(raw, &twin.account, unix_now())
        .map_err(|_| reject(StatusCode::UNAUTHORIZED, "invalid token"))?;
    Ok((claims.sub, claims.sid))
}

async fn handle_connection(stream: TcpStream, state: Arc<RelayState>) {
    let mut key = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        key = Some(authorize(&state, req.uri().query())?);
        Ok(resp)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let Some(key) = key else { return };

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let kill = CancellationToken::new();
    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    state.sessions.insert(
        key.clone(),
        Session {
            id,
            tx,
            kill: kill.clone(),
        },
    );
    *state.connects.entry(key.0).or_default() += 1;

    loop {
        tokio::select! {
            () = kill.cancelled() => break,
            Some(frame) = rx.recv() => {
                if ws_tx.send(frame).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next(), if !state.mute.load(Ordering::SeqCst) => match msg {
                Some(Ok(Message::Binary(data))) => state.route(&key, data),
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws_tx.send(Message::Pong(data)).await;
                }
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }

    state.sessions.remove_if(&key, |_, s| s.id == id);
}

impl RelayState {
    fn route(&self, from: &SessionKey, data: Vec<u8>) {
        let Ok(mut envelope) = Envelope::parse(&data) else {
            return;
        };
        self.sniffed.lock().unwrap().push(envelope.clone());
        let Some(dest) = envelope.destination.clone() else {
            return;
        };

        let frame = if self.tamper.load(Ordering::SeqCst) {
            if let Some(Payload::Plain(bytes) | Payload::Cipher(bytes)) = &mut envelope.payload {
                if let Some(last) = bytes.last_mut() {
                    *last ^= 0x01;
                }
            }
            envelope.serialize()
        } else {
            data
        };

        let key = (dest.twin, dest.connection.clone());
        if let Some(session) = self.sessions.get(&key) {
            let _ = session.tx.send(Message::Binary(frame));
            return;
        }

        // relay-originated error: no source, no signature
        let reply = Envelope {
            uid: envelope.uid.clone(),
            timestamp: unix_now(),
            expiration: 300,
            destination: Some(Address {
                twin: from.0,
                connection: from.1.clone(),
            }),
            body: Some(Body::Error(ErrorBody {
                code: 404,
                message: format!("twin {} is not connected", dest.twin),
            })),
            ..Envelope::default()
        };
        if let Some(session) = self.sessions.get(from) {
            let _ = session.tx.send(Message::Binary(reply.serialize()));
        }
    }
}

/// Config tuned for tests: short reconnect and keepalive timings.
pub fn fast_config(relay: &TestRelay) -> PeerConfig {
    let mut config = PeerConfig::default();
    config.relays = vec![relay.url()];
    config.reconnect.initial_delay_ms = 50;
    config.reconnect.max_delay_ms = 50;
    config.keepalive.ping_interval_s = 1;
    config.keepalive.pong_wait_s = 3;
    config.rpc.call_timeout_s = 5;
    config
}

/// Registers a fresh twin with no relay or E2E key published yet.
pub fn new_twin(directory: &MemoryDirectory) -> (String, TwinId) {
    let phrase = Identity::generate_phrase().unwrap();
    let identity = Identity::from_mnemonic(&phrase, KeyType::Sr25519).unwrap();
    let twin = directory.register(&identity.account_key(), None, None);
    (phrase, twin)
}

/// Starts a peer and waits until the relay has admitted it.
pub async fn start_peer(
    relay: &TestRelay,
    directory: &Arc<MemoryDirectory>,
    phrase: &str,
    config: PeerConfig,
    handler: Arc<dyn Handler>,
) -> Peer {
    let provider: Arc<dyn DirectoryProvider> = directory.clone();
    let peer = Peer::new(phrase, config, provider, handler).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), peer.wait_connected())
        .await
        .expect("peer did not connect")
        .unwrap();
    relay.wait_online(peer.source()).await;
    peer
}

pub async fn wait_until(cond: impl FnMut() -> bool) {
    wait_until_within(Duration::from_secs(5), cond).await;
}

pub async fn wait_until_within(limit: Duration, mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(limit, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
