//! In-process transport.
//!
//! Sessions join a [`MemoryNetwork`] under their peer id. A session listening
//! on `mem/<name>` can be reached by any later session that lists
//! `mem/<name>` among its peers; links are bidirectional.

use crate::error::TransportError;
use crate::id::PeerId;
use crate::transport::{InboundFrame, Link, LinkEvent, Transport};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::sync::mpsc;

struct Endpoint {
    inbound: mpsc::UnboundedSender<LinkEvent>,
    links: BTreeSet<PeerId>,
}

#[derive(Default)]
struct NetworkState {
    /// Listener name → peer listening on it.
    listeners: HashMap<String, PeerId>,
    endpoints: HashMap<PeerId, Endpoint>,
}

/// A set of in-process endpoints.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide network used for `mem/` locators.
    pub fn global() -> &'static MemoryNetwork {
        static GLOBAL: OnceLock<MemoryNetwork> = OnceLock::new();
        GLOBAL.get_or_init(MemoryNetwork::new)
    }

    /// Attach an endpoint.
    ///
    /// # Parameters
    ///
    /// - `listeners`: names this endpoint can be reached at
    /// - `peers`: names of already-listening endpoints to link with
    ///
    /// # Errors
    ///
    /// - `TransportError::DuplicatePeer` if `id` already joined
    /// - `TransportError::AddressInUse` if a listener name is taken
    /// - `TransportError::Unreachable` if a peer name has no listener
    pub fn join(&self, id: PeerId, listeners: &[String], peers: &[String]) -> Result<Link, TransportError> {
        let mut state = self.lock();
        if state.endpoints.contains_key(&id) {
            return Err(TransportError::DuplicatePeer(id));
        }
        if let Some(taken) = listeners.iter().find(|name| state.listeners.contains_key(*name)) {
            return Err(TransportError::AddressInUse(format!("mem/{}", taken)));
        }

        let mut links = BTreeSet::new();
        for name in peers {
            let peer = state
                .listeners
                .get(name)
                .cloned()
                .ok_or_else(|| TransportError::Unreachable(format!("mem/{}", name)))?;
            links.insert(peer);
        }

        for peer in &links {
            if let Some(endpoint) = state.endpoints.get_mut(peer) {
                endpoint.links.insert(id.clone());
            }
        }
        for name in listeners {
            state.listeners.insert(name.clone(), id.clone());
        }

        let (inbound, receiver) = mpsc::unbounded_channel();
        state.endpoints.insert(id.clone(), Endpoint { inbound, links });

        tracing::debug!(peer = %id, ?listeners, ?peers, "joined memory network");

        let transport = MemoryTransport {
            id,
            listening: listeners.to_vec(),
            network: self.clone(),
            closed: AtomicBool::new(false),
        };
        Ok(Link {
            transport: Arc::new(transport),
            inbound: receiver,
        })
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One endpoint of a [`MemoryNetwork`].
pub struct MemoryTransport {
    id: PeerId,
    listening: Vec<String>,
    network: MemoryNetwork,
    closed: AtomicBool,
}

impl Transport for MemoryTransport {
    fn local_id(&self) -> &PeerId {
        &self.id
    }

    fn peers(&self) -> Vec<PeerId> {
        let state = self.network.lock();
        state
            .endpoints
            .get(&self.id)
            .map(|endpoint| endpoint.links.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn send(&self, peer: &PeerId, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let state = self.network.lock();
        let linked = state
            .endpoints
            .get(&self.id)
            .is_some_and(|endpoint| endpoint.links.contains(peer));
        let target = state.endpoints.get(peer).filter(|_| linked);
        let Some(target) = target else {
            return Err(TransportError::UnknownPeer(peer.clone()));
        };

        target
            .inbound
            .send(LinkEvent::Frame(InboundFrame {
                from: self.id.clone(),
                bytes: frame,
            }))
            .map_err(|_| TransportError::UnknownPeer(peer.clone()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut state = self.network.lock();
        state.endpoints.remove(&self.id);
        state.listeners.retain(|_, owner| *owner != self.id);
        for endpoint in state.endpoints.values_mut() {
            if endpoint.links.remove(&self.id) {
                let _ = endpoint.inbound.send(LinkEvent::Disconnected(self.id.clone()));
            }
        }
        tracing::debug!(peer = %self.id, "left memory network");
    }

    fn locators(&self) -> Vec<String> {
        self.listening.iter().map(|name| format!("mem/{}", name)).collect()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}
