//! In-memory transport.
//!
//! A [`MemoryNetwork`] is a shared broker mapping peer ids to live
//! endpoints. Opening a link pairs two [`MemoryLink`] halves; each half owns
//! an unbounded inbox drained by a `spawn_local` pump that re-publishes
//! deliveries on the link's event bus. Deliveries therefore never run
//! listener code inside the sender's call stack, and per-link order is the
//! inbox order.
//!
//! Everything here must run inside a `tokio::task::LocalSet`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{Endpoint, EndpointEvent, LinkSignal, Network, RawLink};
use crate::error::TransportError;
use crate::events::EventBus;
use crate::types::PeerId;

/// Shared broker routing links between [`MemoryEndpoint`]s.
///
/// Cloning yields another handle on the same broker.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Rc<RefCell<HashMap<PeerId, Weak<MemoryEndpoint>>>>,
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("endpoints", &self.endpoints.borrow().len())
            .finish()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind and return the concrete endpoint type.
    pub fn bind_memory(&self, id: Option<PeerId>) -> Result<Rc<MemoryEndpoint>, TransportError> {
        let id = match id {
            Some(id) => id,
            None => loop {
                let candidate = PeerId::random();
                if self.lookup(&candidate).is_none() {
                    break candidate;
                }
            },
        };

        if self.lookup(&id).is_some() {
            return Err(TransportError::IdTaken(id));
        }

        let endpoint = Rc::new_cyclic(|me| MemoryEndpoint {
            id: id.clone(),
            network: self.clone(),
            events: EventBus::new(),
            links: RefCell::new(Vec::new()),
            destroyed: Cell::new(false),
            me: me.clone(),
        });
        self.endpoints
            .borrow_mut()
            .insert(id.clone(), Rc::downgrade(&endpoint));
        debug!(peer = %id, "memory endpoint bound");
        Ok(endpoint)
    }

    /// Ids of every live endpoint.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .endpoints
            .borrow()
            .iter()
            .filter(|(_, e)| e.upgrade().is_some_and(|e| !e.is_destroyed()))
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    fn lookup(&self, id: &PeerId) -> Option<Rc<MemoryEndpoint>> {
        self.endpoints
            .borrow()
            .get(id)
            .and_then(Weak::upgrade)
            .filter(|e| !e.is_destroyed())
    }

    fn release(&self, id: &PeerId, endpoint: &Weak<MemoryEndpoint>) {
        let mut endpoints = self.endpoints.borrow_mut();
        if endpoints.get(id).is_some_and(|e| e.ptr_eq(endpoint)) {
            endpoints.remove(id);
        }
    }
}

impl Network for MemoryNetwork {
    fn bind(&self, id: Option<PeerId>) -> Result<Rc<dyn Endpoint>, TransportError> {
        let endpoint: Rc<dyn Endpoint> = self.bind_memory(id)?;
        Ok(endpoint)
    }
}

/// An endpoint bound on a [`MemoryNetwork`].
pub struct MemoryEndpoint {
    id: PeerId,
    network: MemoryNetwork,
    events: EventBus<EndpointEvent>,
    links: RefCell<Vec<Weak<MemoryLink>>>,
    destroyed: Cell<bool>,
    me: Weak<MemoryEndpoint>,
}

impl fmt::Debug for MemoryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEndpoint")
            .field("id", &self.id)
            .field("destroyed", &self.destroyed.get())
            .finish()
    }
}

impl MemoryEndpoint {
    fn track(&self, link: &Rc<MemoryLink>) {
        let mut links = self.links.borrow_mut();
        links.retain(|l| l.strong_count() > 0);
        links.push(Rc::downgrade(link));
    }

    /// Number of links of this endpoint that are currently open.
    pub fn open_links(&self) -> usize {
        self.links
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|l| l.is_open())
            .count()
    }
}

impl Endpoint for MemoryEndpoint {
    fn id(&self) -> &PeerId {
        &self.id
    }

    fn open(&self, remote: &PeerId) -> Rc<dyn RawLink> {
        let link = MemoryLink::new(self.id.clone(), remote.clone());
        self.track(&link);

        let me = self.me.clone();
        let local = link.clone();
        let remote = remote.clone();
        tokio::task::spawn_local(async move {
            let Some(this) = me.upgrade() else {
                return;
            };
            if this.is_destroyed() {
                local.close();
                this.events.emit(EndpointEvent::Error {
                    peer: Some(remote),
                    error: TransportError::EndpointDestroyed(this.id.clone()),
                });
                return;
            }
            match this.network.lookup(&remote) {
                Some(target) => {
                    let far = MemoryLink::new(remote.clone(), this.id.clone());
                    target.track(&far);
                    MemoryLink::pair(&local, &far);
                    trace!(from = %this.id, to = %remote, "memory link paired");
                    target.events.emit(EndpointEvent::Incoming(far));
                }
                None => {
                    debug!(from = %this.id, to = %remote, "memory link target unavailable");
                    local.close();
                    this.events.emit(EndpointEvent::Error {
                        peer: Some(remote.clone()),
                        error: TransportError::PeerUnavailable(remote),
                    });
                }
            }
        });

        link
    }

    fn events(&self) -> &EventBus<EndpointEvent> {
        &self.events
    }

    fn network(&self) -> Rc<dyn Network> {
        Rc::new(self.network.clone())
    }

    fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        self.network.release(&self.id, &self.me);
        let links: Vec<Rc<MemoryLink>> = self
            .links
            .borrow_mut()
            .drain(..)
            .filter_map(|l| l.upgrade())
            .collect();
        for link in links {
            link.close();
        }
        debug!(peer = %self.id, "memory endpoint destroyed");
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }
}

/// Lifecycle of a [`MemoryLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
}

enum Delivery {
    Opened,
    Data(Vec<u8>),
    Closed,
}

/// One half of an in-memory link.
pub struct MemoryLink {
    local: PeerId,
    remote: PeerId,
    state: Cell<LinkState>,
    inbox: mpsc::UnboundedSender<Delivery>,
    outbound: RefCell<Option<mpsc::UnboundedSender<Delivery>>>,
    events: EventBus<LinkSignal>,
}

impl fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLink")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("state", &self.state.get())
            .finish()
    }
}

impl MemoryLink {
    fn new(local: PeerId, remote: PeerId) -> Rc<Self> {
        let (inbox, rx) = mpsc::unbounded_channel();
        let link = Rc::new(Self {
            local,
            remote,
            state: Cell::new(LinkState::Connecting),
            inbox,
            outbound: RefCell::new(None),
            events: EventBus::new(),
        });
        tokio::task::spawn_local(Self::pump(Rc::downgrade(&link), rx));
        link
    }

    fn pair(a: &Rc<Self>, b: &Rc<Self>) {
        *a.outbound.borrow_mut() = Some(b.inbox.clone());
        *b.outbound.borrow_mut() = Some(a.inbox.clone());
        a.state.set(LinkState::Open);
        b.state.set(LinkState::Open);
        let _ = a.inbox.send(Delivery::Opened);
        let _ = b.inbox.send(Delivery::Opened);
    }

    pub fn state(&self) -> LinkState {
        self.state.get()
    }

    async fn pump(link: Weak<Self>, mut rx: mpsc::UnboundedReceiver<Delivery>) {
        while let Some(delivery) = rx.recv().await {
            let Some(link) = link.upgrade() else {
                break;
            };
            match delivery {
                Delivery::Opened => {
                    if link.state.get() == LinkState::Open {
                        link.events.emit(LinkSignal::Opened);
                    }
                }
                Delivery::Data(bytes) => {
                    if link.state.get() == LinkState::Open {
                        link.events.emit(LinkSignal::Data(bytes));
                    } else {
                        trace!(
                            local = %link.local,
                            remote = %link.remote,
                            "dropping data on closed link"
                        );
                    }
                }
                Delivery::Closed => {
                    link.state.set(LinkState::Closed);
                    link.outbound.borrow_mut().take();
                    link.events.emit(LinkSignal::Closed);
                    break;
                }
            }
        }
    }
}

impl RawLink for MemoryLink {
    fn remote(&self) -> &PeerId {
        &self.remote
    }

    fn is_open(&self) -> bool {
        self.state.get() == LinkState::Open
    }

    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.state.get() != LinkState::Open {
            return Err(TransportError::LinkClosed(self.remote.clone()));
        }
        self.outbound
            .borrow()
            .as_ref()
            .ok_or_else(|| TransportError::LinkClosed(self.remote.clone()))?
            .send(Delivery::Data(bytes))
            .map_err(|_| TransportError::LinkClosed(self.remote.clone()))
    }

    fn close(&self) {
        if self.state.replace(LinkState::Closed) == LinkState::Closed {
            return;
        }
        if let Some(outbound) = self.outbound.borrow_mut().take() {
            let _ = outbound.send(Delivery::Closed);
        }
        let _ = self.inbox.send(Delivery::Closed);
    }

    fn events(&self) -> &EventBus<LinkSignal> {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DEFAULT_UNTIL_TIMEOUT;
    use crate::transport::{EndpointEventKind, LinkSignalKind};
    use tokio::task::LocalSet;

    #[test]
    fn test_bind_rejects_taken_id() {
        let network = MemoryNetwork::new();
        let _first = network.bind(Some(PeerId::new("room"))).unwrap();
        let second = network.bind(Some(PeerId::new("room")));
        assert!(matches!(second, Err(TransportError::IdTaken(id)) if id.as_str() == "room"));
    }

    #[test]
    fn test_destroy_releases_id() {
        let network = MemoryNetwork::new();
        let first = network.bind(Some(PeerId::new("room"))).unwrap();
        first.destroy();
        assert!(network.bind(Some(PeerId::new("room"))).is_ok());
    }

    #[test]
    fn test_anonymous_ids_are_unique() {
        let network = MemoryNetwork::new();
        let a = network.bind(None).unwrap();
        let b = network.bind(None).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(network.peers().len(), 2);
    }

    #[tokio::test]
    async fn test_link_delivers_in_order() {
        LocalSet::new()
            .run_until(async {
                let network = MemoryNetwork::new();
                let a = network.bind(Some(PeerId::new("a"))).unwrap();
                let b = network.bind(Some(PeerId::new("b"))).unwrap();

                let inbound = Rc::new(RefCell::new(None));
                let slot = inbound.clone();
                b.events().on(EndpointEventKind::Incoming, move |event| {
                    if let EndpointEvent::Incoming(link) = event {
                        *slot.borrow_mut() = Some(link.clone());
                    }
                });

                let link = a.open(&PeerId::new("b"));
                link.events()
                    .until(LinkSignalKind::Opened, DEFAULT_UNTIL_TIMEOUT)
                    .await
                    .unwrap();

                let far = inbound.borrow().clone().expect("incoming link");
                assert_eq!(far.remote().as_str(), "a");

                let received = Rc::new(RefCell::new(Vec::new()));
                let r = received.clone();
                far.events().on(LinkSignalKind::Data, move |signal| {
                    if let LinkSignal::Data(bytes) = signal {
                        r.borrow_mut().push(bytes.clone());
                    }
                });

                for n in 0u8..5 {
                    link.send(vec![n]).unwrap();
                }
                link.close();
                far.events()
                    .until(LinkSignalKind::Closed, DEFAULT_UNTIL_TIMEOUT)
                    .await
                    .unwrap();

                assert_eq!(*received.borrow(), vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
                assert!(link.send(vec![9]).is_err());
            })
            .await;
    }

    #[tokio::test]
    async fn test_open_unknown_peer_reports_error() {
        LocalSet::new()
            .run_until(async {
                let network = MemoryNetwork::new();
                let a = network.bind(None).unwrap();

                let link = a.open(&PeerId::new("nobody"));
                let event = a
                    .events()
                    .until(EndpointEventKind::Error, DEFAULT_UNTIL_TIMEOUT)
                    .await
                    .unwrap();

                assert!(matches!(
                    event,
                    EndpointEvent::Error { error: TransportError::PeerUnavailable(_), .. }
                ));
                assert!(!link.is_open());
            })
            .await;
    }

    #[tokio::test]
    async fn test_destroy_closes_remote_half() {
        LocalSet::new()
            .run_until(async {
                let network = MemoryNetwork::new();
                let a = network.bind_memory(None).unwrap();
                let b = network.bind_memory(None).unwrap();

                let link = a.open(b.id());
                link.events()
                    .until(LinkSignalKind::Opened, DEFAULT_UNTIL_TIMEOUT)
                    .await
                    .unwrap();
                assert_eq!(b.open_links(), 1);

                let closed = link.events().until(LinkSignalKind::Closed, DEFAULT_UNTIL_TIMEOUT);
                b.destroy();
                closed.await.unwrap();
                assert_eq!(a.open_links(), 0);
            })
            .await;
    }
}
