//! Connection registry and tag-routed messaging for one local identity.
//!
//! A [`LinkManager`] owns an [`Endpoint`] and every [`ReliableChannel`]
//! opened from or to it. Channels are registered when their link opens,
//! whichever side opened it, and removed when it closes. Packages received
//! on any registered channel are re-published on the manager's own bus as
//! [`LinkEvent::Package`], keyed by [`Tag`], so protocol layers subscribe
//! per tag without knowing which channel a package came in on.
//!
//! # Duplicate links
//!
//! Two peers that connect to each other at the same time end up with two
//! channels between them. Both stay registered; [`LinkManager::conn`] and
//! [`LinkManager::broadcast`] only ever use the first one per peer.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelEventKind, ReliableChannel, Responder};
use crate::config::MeshConfig;
use crate::error::{BusError, ChannelError, LinkError, TransportError};
use crate::events::{BusEvent, EventBus, Matcher, Retain, SubscriptionId};
use crate::transport::{
    Endpoint, EndpointEvent, EndpointEventKind, LinkSignalKind, Network, RawLink,
};
use crate::types::{Package, PeerId, Tag};

/// A package received on one of the manager's channels.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: PeerId,
    pub tag: Tag,
    pub data: Value,
    pub responder: Responder,
}

impl Delivery {
    /// Deserialize the package data.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// Events published by a [`LinkManager`].
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A channel to `peer` was registered.
    Opened(PeerId),
    /// A registered channel to `peer` closed.
    Closed(PeerId),
    Data(Delivery),
    Package(Delivery),
    Error {
        peer: Option<PeerId>,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkEventKind {
    Opened,
    Closed,
    Data,
    Package,
    Error,
}

impl BusEvent for LinkEvent {
    type Kind = LinkEventKind;
    type Key = Tag;

    fn kind(&self) -> LinkEventKind {
        match self {
            LinkEvent::Opened(_) => LinkEventKind::Opened,
            LinkEvent::Closed(_) => LinkEventKind::Closed,
            LinkEvent::Data(_) => LinkEventKind::Data,
            LinkEvent::Package(_) => LinkEventKind::Package,
            LinkEvent::Error { .. } => LinkEventKind::Error,
        }
    }

    fn key(&self) -> Option<&Tag> {
        match self {
            LinkEvent::Data(delivery) | LinkEvent::Package(delivery) => Some(&delivery.tag),
            _ => None,
        }
    }
}

impl LinkEvent {
    /// The peer an `Opened`, `Closed` or `Error` event is about.
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            LinkEvent::Opened(peer) | LinkEvent::Closed(peer) => Some(peer),
            LinkEvent::Data(delivery) | LinkEvent::Package(delivery) => Some(&delivery.from),
            LinkEvent::Error { peer, .. } => peer.as_ref(),
        }
    }
}

/// Ordered set of open channels.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RefCell<Vec<Rc<ReliableChannel>>>,
}

impl ChannelRegistry {
    pub fn insert(&self, channel: Rc<ReliableChannel>) {
        let mut channels = self.channels.borrow_mut();
        if !channels.iter().any(|c| Rc::ptr_eq(c, &channel)) {
            channels.push(channel);
        }
    }

    /// Remove this exact channel. Returns whether it was registered.
    pub fn remove(&self, channel: &Rc<ReliableChannel>) -> bool {
        let mut channels = self.channels.borrow_mut();
        let before = channels.len();
        channels.retain(|c| !Rc::ptr_eq(c, channel));
        channels.len() != before
    }

    /// First registered channel to `peer`.
    pub fn get(&self, peer: &PeerId) -> Option<Rc<ReliableChannel>> {
        self.channels
            .borrow()
            .iter()
            .find(|c| c.remote() == peer)
            .cloned()
    }

    /// Every channel to `peer`.
    pub fn all_to(&self, peer: &PeerId) -> Vec<Rc<ReliableChannel>> {
        self.channels
            .borrow()
            .iter()
            .filter(|c| c.remote() == peer)
            .cloned()
            .collect()
    }

    /// First channel per peer, in registration order.
    pub fn snapshot(&self) -> Vec<Rc<ReliableChannel>> {
        let mut unique: Vec<Rc<ReliableChannel>> = Vec::new();
        for channel in self.channels.borrow().iter() {
            if !unique.iter().any(|c| c.remote() == channel.remote()) {
                unique.push(channel.clone());
            }
        }
        unique
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.snapshot().iter().map(|c| c.remote().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.borrow().is_empty()
    }
}

/// Owns the local endpoint and its registry of channels.
///
/// # Single-Threaded Design
///
/// Always handled through `Rc<LinkManager>`; listeners capture `Weak`
/// handles so dropping the last `Rc` tears the manager down.
pub struct LinkManager {
    endpoint: Rc<dyn Endpoint>,
    config: MeshConfig,
    registry: ChannelRegistry,
    events: EventBus<LinkEvent>,
    endpoint_subscriptions: RefCell<Vec<(EndpointEventKind, SubscriptionId)>>,
    destroyed: Cell<bool>,
    me: Weak<LinkManager>,
}

impl fmt::Debug for LinkManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkManager")
            .field("id", self.id())
            .field("peers", &self.peers())
            .field("destroyed", &self.destroyed.get())
            .finish()
    }
}

impl LinkManager {
    pub fn new(endpoint: Rc<dyn Endpoint>, config: MeshConfig) -> Rc<Self> {
        let manager = Rc::new_cyclic(|me| Self {
            endpoint,
            config,
            registry: ChannelRegistry::default(),
            events: EventBus::new(),
            endpoint_subscriptions: RefCell::new(Vec::new()),
            destroyed: Cell::new(false),
            me: me.clone(),
        });

        let bus = manager.endpoint.events();
        let incoming = {
            let me = manager.me.clone();
            bus.on(EndpointEventKind::Incoming, move |event| {
                if let (Some(me), EndpointEvent::Incoming(link)) = (me.upgrade(), event) {
                    me.adopt(link.clone());
                }
            })
        };
        let errors = {
            let me = manager.me.clone();
            bus.on(EndpointEventKind::Error, move |event| {
                if let (Some(me), EndpointEvent::Error { peer, error }) = (me.upgrade(), event) {
                    me.events.emit(LinkEvent::Error {
                        peer: peer.clone(),
                        message: error.to_string(),
                    });
                }
            })
        };
        *manager.endpoint_subscriptions.borrow_mut() = vec![
            (EndpointEventKind::Incoming, incoming),
            (EndpointEventKind::Error, errors),
        ];

        debug!(peer = %manager.id(), "link manager created");
        manager
    }

    /// Bind a fresh anonymous endpoint on `network` and manage it.
    pub fn bind(network: &dyn Network, config: MeshConfig) -> Result<Rc<Self>, TransportError> {
        let endpoint = network.bind(None)?;
        Ok(Self::new(endpoint, config))
    }

    pub fn id(&self) -> &PeerId {
        self.endpoint.id()
    }

    pub fn events(&self) -> &EventBus<LinkEvent> {
        &self.events
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// The network the endpoint lives on.
    pub fn network(&self) -> Rc<dyn Network> {
        self.endpoint.network()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    /// Open (or reuse) a channel to `peer`.
    ///
    /// Connecting to our own id yields a loopback channel without touching
    /// the transport.
    ///
    /// # Errors
    ///
    /// - `LinkError::ConnectionTimeout` if the link does not open in time
    /// - `LinkError::PeerUnavailable` if the transport reports the peer
    ///   unreachable first
    pub async fn connect(
        &self,
        peer: &PeerId,
        timeout: Duration,
    ) -> Result<Rc<ReliableChannel>, LinkError> {
        if self.destroyed.get() {
            return Err(TransportError::EndpointDestroyed(self.id().clone()).into());
        }
        if let Some(channel) = self.registry.get(peer) {
            return Ok(channel);
        }

        if peer == self.id() {
            let channel = ReliableChannel::loopback(peer.clone());
            self.attach(&channel);
            self.register(&channel);
            return Ok(channel);
        }

        debug!(from = %self.id(), to = %peer, "connecting");
        let link = self.endpoint.open(peer);
        let channel =
            ReliableChannel::over_link(self.id().clone(), link.clone(), self.config.codec.clone());
        self.attach(&channel);

        let endpoint_events = self.endpoint.events();
        let outcome = tokio::select! {
            biased;
            opened = link.events().until(LinkSignalKind::Opened, timeout) => opened.map(|_| None),
            failed = endpoint_events.until_match(
                EndpointEventKind::Error,
                Matcher::value(peer.clone()),
                timeout,
            ) => failed.map(|event| match event {
                EndpointEvent::Error { error, .. } => Some(error.to_string()),
                EndpointEvent::Incoming(_) => Some("unexpected endpoint event".to_string()),
            }),
        };

        match outcome {
            Ok(None) if !channel.is_closed() => {
                self.register(&channel);
                Ok(channel)
            }
            Ok(None) => Err(LinkError::ConnectionLost { peer: peer.clone() }),
            Ok(Some(reason)) => {
                channel.close();
                debug!(to = %peer, reason = %reason, "peer unavailable");
                Err(LinkError::PeerUnavailable {
                    peer: peer.clone(),
                    reason,
                })
            }
            Err(BusError::Timeout { .. }) | Err(BusError::Closed) => {
                channel.close();
                warn!(to = %peer, timeout = ?timeout, "connection timed out");
                Err(LinkError::ConnectionTimeout {
                    peer: peer.clone(),
                    timeout,
                })
            }
        }
    }

    /// Channel to `peer`.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::ConnectionLost` if no channel is registered.
    pub fn conn(&self, peer: &PeerId) -> Result<Rc<ReliableChannel>, LinkError> {
        self.registry
            .get(peer)
            .ok_or_else(|| LinkError::ConnectionLost { peer: peer.clone() })
    }

    pub fn has_conn(&self, peer: &PeerId) -> bool {
        self.registry.get(peer).is_some()
    }

    /// Connected peers, in connection order.
    pub fn peers(&self) -> Vec<PeerId> {
        self.registry.peers()
    }

    /// Send a package on the channel to `peer` and wait for its ack.
    pub async fn send(&self, peer: &PeerId, package: Package) -> Result<Option<Value>, LinkError> {
        let channel = self.conn(peer)?;
        Ok(channel.send(package).await?)
    }

    pub async fn send_pkg(
        &self,
        peer: &PeerId,
        tag: Tag,
        data: Value,
    ) -> Result<Option<Value>, LinkError> {
        self.send(peer, Package::new(tag, data)).await
    }

    /// Send `package` to every connected peer concurrently.
    ///
    /// Returns one result per peer; a failed send never affects the others.
    pub async fn broadcast(
        &self,
        package: Package,
    ) -> Vec<(PeerId, Result<Option<Value>, ChannelError>)> {
        let channels = self.registry.snapshot();
        let results = join_all(channels.iter().map(|c| c.send(package.clone()))).await;
        channels
            .iter()
            .map(|c| c.remote().clone())
            .zip(results)
            .collect()
    }

    pub async fn broadcast_pkg(
        &self,
        tag: Tag,
        data: Value,
    ) -> Vec<(PeerId, Result<Option<Value>, ChannelError>)> {
        self.broadcast(Package::new(tag, data)).await
    }

    /// Close every channel to `peer`. Returns whether any was registered.
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        let channels = self.registry.all_to(peer);
        let mut removed = false;
        for channel in channels {
            if self.registry.remove(&channel) {
                removed = true;
            }
            channel.close();
        }
        if removed {
            debug!(from = %self.id(), to = %peer, "disconnected");
            self.events.emit(LinkEvent::Closed(peer.clone()));
        }
        removed
    }

    pub fn disconnect_all(&self) {
        for peer in self.peers() {
            self.disconnect(&peer);
        }
    }

    /// Close every channel and release the endpoint.
    pub fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        self.disconnect_all();
        for (kind, id) in self.endpoint_subscriptions.borrow_mut().drain(..) {
            self.endpoint.events().off(kind, id);
        }
        self.endpoint.destroy();
        info!(peer = %self.id(), "link manager destroyed");
    }

    /// Listen for packages tagged `tag`.
    pub fn on_pkg(&self, tag: Tag, listener: impl Fn(&Delivery) + 'static) -> SubscriptionId {
        self.events
            .on_match(LinkEventKind::Package, Matcher::value(tag), move |event| {
                if let LinkEvent::Package(delivery) = event {
                    listener(delivery);
                }
            })
    }

    /// Listen for the next package tagged `tag`.
    pub fn once_pkg(
        &self,
        tag: Tag,
        listener: impl Fn(&Delivery, &Retain) + 'static,
    ) -> SubscriptionId {
        self.events
            .once_match(LinkEventKind::Package, Matcher::value(tag), move |event, retain| {
                if let LinkEvent::Package(delivery) = event {
                    listener(delivery, retain);
                }
            })
    }

    /// Wait for the next package tagged `tag`.
    pub async fn until_pkg(&self, tag: Tag, timeout: Duration) -> Result<Delivery, BusError> {
        match self
            .events
            .until_match(LinkEventKind::Package, Matcher::value(tag), timeout)
            .await?
        {
            LinkEvent::Package(delivery) => Ok(delivery),
            _ => Err(BusError::Closed),
        }
    }

    pub fn off_pkg(&self, id: SubscriptionId) -> bool {
        self.events.off(LinkEventKind::Package, id)
    }

    fn adopt(&self, link: Rc<dyn RawLink>) {
        if self.destroyed.get() {
            link.close();
            return;
        }
        debug!(local = %self.id(), remote = %link.remote(), "adopting inbound link");
        let channel =
            ReliableChannel::over_link(self.id().clone(), link.clone(), self.config.codec.clone());
        self.attach(&channel);
        if link.is_open() {
            self.register(&channel);
            return;
        }

        let me = self.me.clone();
        link.events().once(LinkSignalKind::Opened, move |_, _| {
            if let Some(me) = me.upgrade() {
                me.register(&channel);
            }
        });
    }

    fn register(&self, channel: &Rc<ReliableChannel>) {
        if channel.is_closed() {
            return;
        }
        self.registry.insert(channel.clone());
        debug!(local = %self.id(), remote = %channel.remote(), "channel registered");
        self.events.emit(LinkEvent::Opened(channel.remote().clone()));
    }

    fn attach(&self, channel: &Rc<ReliableChannel>) {
        let bus = channel.events();

        for kind in [ChannelEventKind::Data, ChannelEventKind::Package] {
            let me = self.me.clone();
            bus.on(kind, move |event| {
                let Some(me) = me.upgrade() else {
                    return;
                };
                let (ChannelEvent::Data(inbound) | ChannelEvent::Package(inbound)) = event else {
                    return;
                };
                let delivery = Delivery {
                    from: inbound.from.clone(),
                    tag: inbound.package.tag.clone(),
                    data: inbound.package.data.clone(),
                    responder: inbound.responder.clone(),
                };
                me.events.emit(match event {
                    ChannelEvent::Data(_) => LinkEvent::Data(delivery),
                    _ => LinkEvent::Package(delivery),
                });
            });
        }

        {
            let me = self.me.clone();
            let weak = Rc::downgrade(channel);
            bus.on(ChannelEventKind::Closed, move |_| {
                if let (Some(me), Some(channel)) = (me.upgrade(), weak.upgrade()) {
                    me.on_channel_closed(&channel);
                }
            });
        }

        let me = self.me.clone();
        bus.on(ChannelEventKind::Error, move |event| {
            if let (Some(me), ChannelEvent::Error { peer, message }) = (me.upgrade(), event) {
                me.events.emit(LinkEvent::Error {
                    peer: Some(peer.clone()),
                    message: message.clone(),
                });
            }
        });
    }

    fn on_channel_closed(&self, channel: &Rc<ReliableChannel>) {
        if self.registry.remove(channel) {
            debug!(local = %self.id(), remote = %channel.remote(), "channel closed");
            self.events.emit(LinkEvent::Closed(channel.remote().clone()));
        }
    }
}
