//! # Starmesh
//!
//! Serverless state replication over a star of peer links.
//!
//! A handful of peers share one application state. One of them binds a
//! rendezvous name and acts as the discovery point; every peer connects to
//! every other, and state changes go through a two-phase stage/commit round
//! that any member can start. When the host disappears, the lowest
//! remaining member id takes over the name.
//!
//! ## Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ network     ReplicationNetwork: membership, host failover,  │
//! │             dispatch (DISPATCH / CANCEL / PROMOTE)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │ link        LinkManager: channel registry, tag routing      │
//! ├─────────────────────────────────────────────────────────────┤
//! │ channel     ReliableChannel: correlation ids + acks         │
//! ├─────────────────────────────────────────────────────────────┤
//! │ transport   Network / Endpoint / RawLink, MemoryNetwork     │
//! ├─────────────────────────────────────────────────────────────┤
//! │ events      EventBus: closed event kinds + wildcard         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use starmesh::prelude::*;
//!
//! let network = MemoryNetwork::new();
//! let local = LinkManager::bind(&network, MeshConfig::local_network())?;
//! let mesh = ReplicationNetwork::new(
//!     local,
//!     json!({}),
//!     Some(reducer(|state: &Value, action: &Value, _from: &PeerId| Ok(action.clone()))),
//!     MeshConfig::local_network(),
//! );
//!
//! mesh.join_or_host("room").await?;
//! mesh.dispatch(json!({"foo": 123})).await?;
//! ```
//!
//! Everything is single-threaded: run peers inside a
//! `tokio::task::LocalSet` on a current-thread runtime.

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod link;
pub mod network;
pub mod prelude;
pub mod transport;
pub mod types;

pub use channel::{ChannelEvent, ChannelEventKind, Inbound, ReliableChannel, Responder};
pub use codec::{CodecError, FrameCodec, JsonCodec};
pub use config::MeshConfig;
pub use error::{BusError, ChannelError, DispatchError, LinkError, MeshError, TransportError};
pub use events::{BusEvent, EventBus, Matcher, Retain, SubscriptionId, DEFAULT_UNTIL_TIMEOUT};
pub use link::{ChannelRegistry, Delivery, LinkEvent, LinkEventKind, LinkManager};
pub use network::{reducer, NetworkEvent, NetworkEventKind, Reducer, ReplicationNetwork};
pub use transport::{Endpoint, EndpointEvent, LinkSignal, MemoryNetwork, Network, RawLink};
pub use types::{CorrelationId, Frame, Package, PeerId, Tag};
