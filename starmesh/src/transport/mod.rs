//! Transport seam: endpoints that open ordered, un-acknowledged frame links.
//!
//! The replication stack never talks to a concrete transport. It binds an
//! [`Endpoint`] through a [`Network`], opens [`RawLink`]s from it, and
//! listens to both on their event buses. Production deployments plug a
//! browser data-channel or socket implementation in here; the crate ships
//! [`MemoryNetwork`] for in-process peers and tests.
//!
//! # Contract
//!
//! - frames on one link arrive in order, exactly once, until the link closes
//! - `open` returns immediately; the link later signals `Opened`, or the
//!   endpoint emits an `Error` naming the unreachable peer
//! - closing either end eventually signals `Closed` on both ends

use std::fmt;
use std::rc::Rc;

use crate::error::TransportError;
use crate::events::{BusEvent, EventBus};
use crate::types::PeerId;

pub mod memory;

pub use memory::{MemoryEndpoint, MemoryLink, MemoryNetwork};

/// Something that hands out endpoints, i.e. assigns peer identities.
pub trait Network: fmt::Debug {
    /// Bind a new endpoint.
    ///
    /// `None` asks the network for a fresh anonymous id; `Some(id)` claims a
    /// specific id (a rendezvous name).
    ///
    /// # Errors
    ///
    /// Returns `TransportError::IdTaken` if another live endpoint holds `id`.
    fn bind(&self, id: Option<PeerId>) -> Result<Rc<dyn Endpoint>, TransportError>;
}

/// One bound identity on a network.
pub trait Endpoint: fmt::Debug {
    fn id(&self) -> &PeerId;

    /// Start opening a link to `remote`. Never blocks.
    fn open(&self, remote: &PeerId) -> Rc<dyn RawLink>;

    /// Inbound links and endpoint-level errors.
    fn events(&self) -> &EventBus<EndpointEvent>;

    /// The network this endpoint was bound on, for binding siblings.
    fn network(&self) -> Rc<dyn Network>;

    /// Release the id and close every link.
    fn destroy(&self);

    fn is_destroyed(&self) -> bool;
}

/// One direction-agnostic, ordered link to a remote endpoint.
pub trait RawLink: fmt::Debug {
    fn remote(&self) -> &PeerId;

    fn is_open(&self) -> bool;

    /// Queue `bytes` for delivery.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::LinkClosed` unless the link is open.
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Close both ends. Idempotent.
    fn close(&self);

    fn events(&self) -> &EventBus<LinkSignal>;
}

/// Events published by an [`Endpoint`].
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// A remote endpoint opened a link to us.
    Incoming(Rc<dyn RawLink>),
    /// Something went wrong; `peer` names the remote side when known.
    Error {
        peer: Option<PeerId>,
        error: TransportError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointEventKind {
    Incoming,
    Error,
}

impl BusEvent for EndpointEvent {
    type Kind = EndpointEventKind;
    type Key = PeerId;

    fn kind(&self) -> EndpointEventKind {
        match self {
            EndpointEvent::Incoming(_) => EndpointEventKind::Incoming,
            EndpointEvent::Error { .. } => EndpointEventKind::Error,
        }
    }

    fn key(&self) -> Option<&PeerId> {
        match self {
            EndpointEvent::Incoming(link) => Some(link.remote()),
            EndpointEvent::Error { peer, .. } => peer.as_ref(),
        }
    }
}

/// Events published by a [`RawLink`].
#[derive(Debug, Clone)]
pub enum LinkSignal {
    Opened,
    Data(Vec<u8>),
    Closed,
    Error(TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkSignalKind {
    Opened,
    Data,
    Closed,
    Error,
}

impl BusEvent for LinkSignal {
    type Kind = LinkSignalKind;
    type Key = ();

    fn kind(&self) -> LinkSignalKind {
        match self {
            LinkSignal::Opened => LinkSignalKind::Opened,
            LinkSignal::Data(_) => LinkSignalKind::Data,
            LinkSignal::Closed => LinkSignalKind::Closed,
            LinkSignal::Error(_) => LinkSignalKind::Error,
        }
    }
}
