//! Serve and call through one peer.

use crate::error::Error;
use crate::peer::{Handler, Peer};
use crate::router::Router;
use crate::rpc::Correlator;
use rmb_common::Envelope;
use std::sync::Arc;

/// Sends requests to a [`Router`] and everything else to a [`Correlator`].
#[derive(Debug)]
pub struct Mux {
    router: Arc<Router>,
    correlator: Arc<Correlator>,
}

impl Mux {
    /// Combines a router with the correlator of an [`crate::RpcClient`].
    #[must_use]
    pub fn new(router: Router, correlator: Arc<Correlator>) -> Self {
        Self {
            router: Arc::new(router),
            correlator,
        }
    }
}

impl Handler for Mux {
    fn handle(self: Arc<Self>, peer: &Peer, envelope: Envelope, error: Option<Error>) {
        if envelope.request().is_some() {
            Arc::clone(&self.router).handle(peer, envelope, error);
        } else {
            self.correlator.accept(envelope, error);
        }
    }
}
