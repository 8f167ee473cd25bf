//! Request/acknowledgment over a single link.
//!
//! A [`ReliableChannel`] turns a raw, fire-and-forget link into a request
//! channel: every outbound package gets a fresh [`CorrelationId`], and the
//! send resolves when the remote side acknowledges that id, optionally with
//! inline reply data.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ ReliableChannel                              │
//! │                                              │
//! │  backing: Link(raw link) | Loopback          │
//! │  pending: RefCell<HashMap<id, oneshot>>      │
//! │  events:  EventBus<ChannelEvent>             │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Receive path
//!
//! - a frame carrying a non-`Ack` package is published as
//!   [`ChannelEvent::Data`] and then [`ChannelEvent::Package`], both with the
//!   same [`Responder`]; once both emissions return, the channel answers with
//!   `Frame{id, Ack(reply)}` or a bare `Frame{id}`
//! - a frame with no payload or an `Ack` payload resolves the matching
//!   pending send
//!
//! Package listeners run synchronously. A reply must be set before the
//! listener returns; anything asynchronous has to be spawned and reported
//! through a later package.
//!
//! The loopback backing never serializes: frames are handed straight to the
//! receive path, so a loopback send resolves without yielding.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::codec::FrameCodec;
use crate::error::{ChannelError, TransportError};
use crate::events::{BusEvent, EventBus, SubscriptionId};
use crate::transport::{LinkSignal, LinkSignalKind, RawLink};
use crate::types::{CorrelationId, Frame, Package, PeerId, Tag};

type Waiter = oneshot::Sender<Result<Option<Value>, ChannelError>>;

/// Reply slot handed to package listeners.
///
/// Cloning shares the slot; the last value written wins.
#[derive(Clone, Default)]
pub struct Responder(Rc<RefCell<Option<Value>>>);

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Responder").field(&self.0.borrow()).finish()
    }
}

impl Responder {
    /// Attach `value` to the acknowledgment.
    pub fn reply(&self, value: Value) {
        *self.0.borrow_mut() = Some(value);
    }

    /// Serialize `value` and attach it to the acknowledgment.
    pub fn reply_with<T: Serialize>(&self, value: &T) -> Result<(), serde_json::Error> {
        self.reply(serde_json::to_value(value)?);
        Ok(())
    }

    pub fn has_reply(&self) -> bool {
        self.0.borrow().is_some()
    }

    fn take(&self) -> Option<Value> {
        self.0.borrow_mut().take()
    }
}

/// A package received on a channel.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: PeerId,
    pub package: Package,
    pub responder: Responder,
}

/// Events published by a [`ReliableChannel`].
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Any inbound package (published first).
    Data(Inbound),
    /// Any inbound package (published second), keyed by tag.
    Package(Inbound),
    /// The channel closed; pending sends have failed.
    Closed(PeerId),
    /// The link or the codec reported a problem.
    Error { peer: PeerId, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEventKind {
    Data,
    Package,
    Closed,
    Error,
}

impl BusEvent for ChannelEvent {
    type Kind = ChannelEventKind;
    type Key = Tag;

    fn kind(&self) -> ChannelEventKind {
        match self {
            ChannelEvent::Data(_) => ChannelEventKind::Data,
            ChannelEvent::Package(_) => ChannelEventKind::Package,
            ChannelEvent::Closed(_) => ChannelEventKind::Closed,
            ChannelEvent::Error { .. } => ChannelEventKind::Error,
        }
    }

    fn key(&self) -> Option<&Tag> {
        match self {
            ChannelEvent::Data(inbound) | ChannelEvent::Package(inbound) => {
                Some(&inbound.package.tag)
            }
            _ => None,
        }
    }
}

enum Backing {
    Link(Rc<dyn RawLink>),
    Loopback,
}

/// Acknowledged request channel to one remote peer (or to ourselves).
pub struct ReliableChannel {
    local: PeerId,
    remote: PeerId,
    backing: Backing,
    codec: Option<Rc<dyn FrameCodec>>,
    pending: RefCell<HashMap<CorrelationId, Waiter>>,
    closed: Cell<bool>,
    announced: Cell<bool>,
    link_subscriptions: RefCell<Vec<(LinkSignalKind, SubscriptionId)>>,
    events: EventBus<ChannelEvent>,
}

impl fmt::Debug for ReliableChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliableChannel")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("loopback", &self.is_loopback())
            .field("closed", &self.closed.get())
            .field("pending", &self.pending.borrow().len())
            .finish()
    }
}

impl ReliableChannel {
    /// Wrap a raw link. The channel subscribes to the link's signals
    /// immediately, so data arriving before `Opened` is not lost.
    pub fn over_link(local: PeerId, link: Rc<dyn RawLink>, codec: Rc<dyn FrameCodec>) -> Rc<Self> {
        let channel = Rc::new(Self {
            local,
            remote: link.remote().clone(),
            backing: Backing::Link(link.clone()),
            codec: Some(codec),
            pending: RefCell::new(HashMap::new()),
            closed: Cell::new(false),
            announced: Cell::new(false),
            link_subscriptions: RefCell::new(Vec::new()),
            events: EventBus::new(),
        });

        let bus = link.events();
        let subscriptions = vec![
            (LinkSignalKind::Data, {
                let me = Rc::downgrade(&channel);
                bus.on(LinkSignalKind::Data, move |signal| {
                    if let (Some(me), LinkSignal::Data(bytes)) = (me.upgrade(), signal) {
                        me.on_bytes(bytes);
                    }
                })
            }),
            (LinkSignalKind::Closed, {
                let me = Rc::downgrade(&channel);
                bus.on(LinkSignalKind::Closed, move |_| {
                    if let Some(me) = me.upgrade() {
                        me.shutdown();
                    }
                })
            }),
            (LinkSignalKind::Error, {
                let me: Weak<Self> = Rc::downgrade(&channel);
                bus.on(LinkSignalKind::Error, move |signal| {
                    if let (Some(me), LinkSignal::Error(error)) = (me.upgrade(), signal) {
                        me.on_link_error(error);
                    }
                })
            }),
        ];
        *channel.link_subscriptions.borrow_mut() = subscriptions;
        channel
    }

    /// A channel to ourselves. Sends are delivered synchronously.
    pub fn loopback(id: PeerId) -> Rc<Self> {
        Rc::new(Self {
            local: id.clone(),
            remote: id,
            backing: Backing::Loopback,
            codec: None,
            pending: RefCell::new(HashMap::new()),
            closed: Cell::new(false),
            announced: Cell::new(false),
            link_subscriptions: RefCell::new(Vec::new()),
            events: EventBus::new(),
        })
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn events(&self) -> &EventBus<ChannelEvent> {
        &self.events
    }

    pub fn is_loopback(&self) -> bool {
        matches!(self.backing, Backing::Loopback)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Number of sends still waiting for an acknowledgment.
    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Whether the underlying link is usable.
    pub fn is_open(&self) -> bool {
        !self.closed.get()
            && match &self.backing {
                Backing::Link(link) => link.is_open(),
                Backing::Loopback => true,
            }
    }

    /// Send `package` and wait for its acknowledgment.
    ///
    /// Resolves with the reply data attached to the acknowledgment, if any.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Closed` if the channel closes before the ack arrives
    /// - `ChannelError::Transport` if the link refuses the frame or fails
    /// - `ChannelError::Codec` if the frame cannot be encoded
    pub async fn send(&self, package: Package) -> Result<Option<Value>, ChannelError> {
        if self.closed.get() {
            return Err(ChannelError::Closed {
                peer: self.remote.clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.pending.borrow_mut();
            let id = loop {
                let candidate = CorrelationId::random();
                if !pending.contains_key(&candidate) {
                    break candidate;
                }
            };
            pending.insert(id, tx);
            id
        };

        trace!(to = %self.remote, id = %id, tag = %package.tag, "channel send");
        if let Err(error) = self.transmit(Frame::request(id, package)) {
            self.pending.borrow_mut().remove(&id);
            return Err(error);
        }

        rx.await.unwrap_or_else(|_| {
            Err(ChannelError::Closed {
                peer: self.remote.clone(),
            })
        })
    }

    /// Send a package built from `tag` and `data`.
    pub async fn send_pkg(&self, tag: Tag, data: Value) -> Result<Option<Value>, ChannelError> {
        self.send(Package::new(tag, data)).await
    }

    /// Close the channel and its link. Pending sends fail immediately.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        debug!(local = %self.local, remote = %self.remote, "closing channel");
        self.fail_pending(|peer| ChannelError::Closed { peer });
        match &self.backing {
            Backing::Link(link) => link.close(),
            Backing::Loopback => self.announce_closed(),
        }
    }

    fn transmit(&self, frame: Frame) -> Result<(), ChannelError> {
        match (&self.backing, &self.codec) {
            (Backing::Link(link), Some(codec)) => {
                let bytes = codec.encode(&frame)?;
                link.send(bytes)?;
                Ok(())
            }
            (Backing::Link(link), None) => {
                Err(TransportError::LinkClosed(link.remote().clone()).into())
            }
            (Backing::Loopback, _) => {
                self.receive(frame);
                Ok(())
            }
        }
    }

    fn on_bytes(&self, bytes: &[u8]) {
        let Some(codec) = &self.codec else {
            return;
        };
        match codec.decode(bytes) {
            Ok(frame) => self.receive(frame),
            Err(error) => {
                warn!(from = %self.remote, error = %error, "dropping undecodable frame");
                self.events.emit(ChannelEvent::Error {
                    peer: self.remote.clone(),
                    message: error.to_string(),
                });
            }
        }
    }

    fn receive(&self, frame: Frame) {
        if self.closed.get() {
            trace!(from = %self.remote, id = %frame.id, "dropping frame on closed channel");
            return;
        }

        if frame.is_ack() {
            let reply = frame.payload.map(|p| p.data);
            let waiter = self.pending.borrow_mut().remove(&frame.id);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(Ok(reply));
                }
                None => {
                    debug!(from = %self.remote, id = %frame.id, "ack for unknown correlation id")
                }
            }
            return;
        }

        let Some(package) = frame.payload else {
            return;
        };
        let responder = Responder::default();
        let inbound = Inbound {
            from: self.remote.clone(),
            package,
            responder: responder.clone(),
        };
        self.events.emit(ChannelEvent::Data(inbound.clone()));
        self.events.emit(ChannelEvent::Package(inbound));

        if self.closed.get() {
            return;
        }
        if let Err(error) = self.transmit(Frame::ack(frame.id, responder.take())) {
            warn!(to = %self.remote, id = %frame.id, error = %error, "failed to acknowledge frame");
        }
    }

    fn on_link_error(&self, error: &TransportError) {
        warn!(remote = %self.remote, error = %error, "link error");
        self.fail_pending(|_| ChannelError::Transport(error.clone()));
        self.events.emit(ChannelEvent::Error {
            peer: self.remote.clone(),
            message: error.to_string(),
        });
    }

    fn shutdown(&self) {
        self.closed.set(true);
        self.fail_pending(|peer| ChannelError::Closed { peer });
        self.announce_closed();
    }

    fn announce_closed(&self) {
        if self.announced.replace(true) {
            return;
        }
        if let Backing::Link(link) = &self.backing {
            for (kind, id) in self.link_subscriptions.borrow_mut().drain(..) {
                link.events().off(kind, id);
            }
        }
        debug!(local = %self.local, remote = %self.remote, "channel closed");
        self.events.emit(ChannelEvent::Closed(self.remote.clone()));
    }

    fn fail_pending(&self, error: impl Fn(PeerId) -> ChannelError) {
        let waiters: Vec<Waiter> = self.pending.borrow_mut().drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(error(self.remote.clone())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::events::DEFAULT_UNTIL_TIMEOUT;
    use crate::transport::{Endpoint, EndpointEvent, EndpointEventKind, MemoryNetwork, Network};
    use serde_json::json;
    use tokio::task::LocalSet;

    /// Open a link between two fresh endpoints and return both halves.
    async fn linked_pair(
        network: &MemoryNetwork,
    ) -> (Rc<dyn Endpoint>, Rc<dyn Endpoint>, Rc<dyn RawLink>, Rc<dyn RawLink>) {
        let a = network.bind(Some(PeerId::new("a"))).unwrap();
        let b = network.bind(Some(PeerId::new("b"))).unwrap();

        let inbound = Rc::new(RefCell::new(None));
        let slot = inbound.clone();
        b.events().on(EndpointEventKind::Incoming, move |event| {
            if let EndpointEvent::Incoming(link) = event {
                *slot.borrow_mut() = Some(link.clone());
            }
        });

        let near = a.open(b.id());
        near.events()
            .until(LinkSignalKind::Opened, DEFAULT_UNTIL_TIMEOUT)
            .await
            .unwrap();
        let far = inbound.borrow_mut().take().expect("incoming link");
        (a, b, near, far)
    }

    #[tokio::test]
    async fn test_send_resolves_with_inline_reply() {
        LocalSet::new()
            .run_until(async {
                let network = MemoryNetwork::new();
                let (_a, _b, near, far) = linked_pair(&network).await;
                let client = ReliableChannel::over_link(PeerId::new("a"), near, Rc::new(JsonCodec));
                let server = ReliableChannel::over_link(PeerId::new("b"), far, Rc::new(JsonCodec));

                server.events().on(ChannelEventKind::Package, |event| {
                    if let ChannelEvent::Package(inbound) = event {
                        inbound.responder.reply(json!({"echo": inbound.package.data}));
                    }
                });

                let reply = client
                    .send_pkg(Tag::App("echo".into()), json!(7))
                    .await
                    .unwrap();
                assert_eq!(reply, Some(json!({"echo": 7})));
                assert_eq!(client.pending_count(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_bare_ack_without_reply() {
        LocalSet::new()
            .run_until(async {
                let network = MemoryNetwork::new();
                let (_a, _b, near, far) = linked_pair(&network).await;
                let client = ReliableChannel::over_link(PeerId::new("a"), near, Rc::new(JsonCodec));
                let server = ReliableChannel::over_link(PeerId::new("b"), far, Rc::new(JsonCodec));

                let seen = Rc::new(RefCell::new(Vec::new()));
                let s = seen.clone();
                server.events().on_any(move |kind, _| s.borrow_mut().push(kind));

                let reply = client.send(Package::bare(Tag::Promote)).await.unwrap();
                assert_eq!(reply, None);
                assert_eq!(
                    *seen.borrow(),
                    vec![ChannelEventKind::Data, ChannelEventKind::Package]
                );
            })
            .await;
    }

    #[tokio::test]
    async fn test_loopback_resolves_synchronously() {
        let channel = ReliableChannel::loopback(PeerId::new("me"));
        channel.events().on(ChannelEventKind::Package, |event| {
            if let ChannelEvent::Package(inbound) = event {
                assert_eq!(inbound.from.as_str(), "me");
                inbound.responder.reply(json!("staged"));
            }
        });

        let reply = channel.send_pkg(Tag::Dispatch, json!(1)).await.unwrap();
        assert_eq!(reply, Some(json!("staged")));
        assert!(channel.is_loopback());
    }

    #[tokio::test]
    async fn test_close_fails_pending_send() {
        LocalSet::new()
            .run_until(async {
                let network = MemoryNetwork::new();
                let (_a, _b, near, _far) = linked_pair(&network).await;
                let client = ReliableChannel::over_link(PeerId::new("a"), near, Rc::new(JsonCodec));

                let (result, _) = tokio::join!(client.send(Package::bare(Tag::Cancel)), async {
                    tokio::task::yield_now().await;
                    assert_eq!(client.pending_count(), 1);
                    client.close();
                });

                assert!(matches!(result, Err(ChannelError::Closed { .. })));
                assert!(client.is_closed());
                assert!(client.send(Package::bare(Tag::Cancel)).await.is_err());
            })
            .await;
    }

    #[tokio::test]
    async fn test_remote_close_announces_once() {
        LocalSet::new()
            .run_until(async {
                let network = MemoryNetwork::new();
                let (_a, _b, near, far) = linked_pair(&network).await;
                let client = ReliableChannel::over_link(PeerId::new("a"), near, Rc::new(JsonCodec));
                let server = ReliableChannel::over_link(PeerId::new("b"), far, Rc::new(JsonCodec));

                let closed = Rc::new(Cell::new(0));
                let c = closed.clone();
                client.events().on(ChannelEventKind::Closed, move |_| c.set(c.get() + 1));

                server.close();
                client
                    .events()
                    .until(ChannelEventKind::Closed, DEFAULT_UNTIL_TIMEOUT)
                    .await
                    .unwrap();
                client.close();
                tokio::task::yield_now().await;

                assert_eq!(closed.get(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_loopback_close_is_synchronous() {
        let channel = ReliableChannel::loopback(PeerId::new("me"));
        let closed = Rc::new(Cell::new(false));
        let c = closed.clone();
        channel.events().on(ChannelEventKind::Closed, move |_| c.set(true));

        channel.close();
        assert!(closed.get());
        assert!(!channel.is_open());
    }
}
