//! Shared fixtures for multi-peer tests over the in-memory transport.

#![allow(dead_code)]

use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use starmesh::prelude::*;
use starmesh::{Endpoint, EndpointEvent, LinkSignal, RawLink, TransportError};
use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;

/// Replicated document used by the tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Doc {
    pub foo: Option<i64>,
    pub log: Vec<i64>,
}

pub type Mesh = Rc<ReplicationNetwork<Doc, Value>>;

/// Accepts `SET_FOO` and `APPEND`, rejects everything else.
pub fn doc_reducer() -> Reducer<Doc, Value> {
    reducer(|state: &Doc, action: &Value, _from: &PeerId| {
        let value = action["value"].as_i64();
        match (action["type"].as_str(), value) {
            (Some("SET_FOO"), Some(value)) => Ok(Doc {
                foo: Some(value),
                ..state.clone()
            }),
            (Some("APPEND"), Some(value)) => {
                let mut next = state.clone();
                next.log.push(value);
                Ok(next)
            }
            _ => Err("invalid action".to_string()),
        }
    })
}

pub fn set_foo(value: i64) -> Value {
    json!({"type": "SET_FOO", "value": value})
}

pub fn append(value: i64) -> Value {
    json!({"type": "APPEND", "value": value})
}

/// Install a fmt subscriber that writes through the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Run `future` on a current-thread runtime inside a `LocalSet`.
pub fn run_local<F: Future>(future: F) -> F::Output {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("Failed to build local runtime");
    LocalSet::new().block_on(&runtime, future)
}

pub fn peer_with(
    network: &MemoryNetwork,
    id: &str,
    reducer: Option<Reducer<Doc, Value>>,
    config: MeshConfig,
) -> Mesh {
    let endpoint = network.bind(Some(PeerId::new(id))).expect("bind peer");
    let local = LinkManager::new(endpoint, config.clone());
    ReplicationNetwork::new(local, Doc::default(), reducer, config)
}

/// A peer whose every outbound frame is held back by `delay`.
pub fn slow_peer(network: &MemoryNetwork, id: &str, delay: Duration) -> Mesh {
    let config = MeshConfig::local_network();
    let endpoint = network.bind(Some(PeerId::new(id))).expect("bind peer");
    let local = LinkManager::new(DelayedEndpoint::wrap(endpoint, delay), config.clone());
    ReplicationNetwork::new(local, Doc::default(), Some(doc_reducer()), config)
}

/// Endpoint wrapper that delays sends on every link, opened or accepted.
#[derive(Debug)]
pub struct DelayedEndpoint {
    inner: Rc<dyn Endpoint>,
    delay: Duration,
    events: Rc<EventBus<EndpointEvent>>,
}

impl DelayedEndpoint {
    pub fn wrap(inner: Rc<dyn Endpoint>, delay: Duration) -> Rc<Self> {
        let events = Rc::new(EventBus::new());
        let relay = events.clone();
        inner.events().on_any(move |_, event| {
            relay.emit(match event {
                EndpointEvent::Incoming(link) => {
                    EndpointEvent::Incoming(DelayedLink::wrap(link.clone(), delay))
                }
                other => other.clone(),
            });
        });
        Rc::new(Self {
            inner,
            delay,
            events,
        })
    }
}

impl Endpoint for DelayedEndpoint {
    fn id(&self) -> &PeerId {
        self.inner.id()
    }

    fn open(&self, remote: &PeerId) -> Rc<dyn RawLink> {
        DelayedLink::wrap(self.inner.open(remote), self.delay)
    }

    fn events(&self) -> &EventBus<EndpointEvent> {
        &self.events
    }

    fn network(&self) -> Rc<dyn Network> {
        self.inner.network()
    }

    fn destroy(&self) {
        self.inner.destroy();
    }

    fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }
}

#[derive(Debug)]
pub struct DelayedLink {
    inner: Rc<dyn RawLink>,
    delay: Duration,
}

impl DelayedLink {
    pub fn wrap(inner: Rc<dyn RawLink>, delay: Duration) -> Rc<dyn RawLink> {
        Rc::new(Self { inner, delay })
    }
}

impl RawLink for DelayedLink {
    fn remote(&self) -> &PeerId {
        self.inner.remote()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.inner.is_open() {
            return Err(TransportError::LinkClosed(self.remote().clone()));
        }
        let inner = self.inner.clone();
        let delay = self.delay;
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            let _ = inner.send(bytes);
        });
        Ok(())
    }

    fn close(&self) {
        self.inner.close();
    }

    fn events(&self) -> &EventBus<LinkSignal> {
        self.inner.events()
    }
}

pub fn peer(network: &MemoryNetwork, id: &str) -> Mesh {
    peer_with(network, id, Some(doc_reducer()), MeshConfig::local_network())
}

pub fn named_peer(network: &MemoryNetwork, id: &str, display: &str) -> Mesh {
    peer_with(
        network,
        id,
        Some(doc_reducer()),
        MeshConfig::local_network().with_display_name(display),
    )
}

pub fn ids(raw: &[&str]) -> Vec<PeerId> {
    raw.iter().map(|s| PeerId::new(*s)).collect()
}

pub fn sorted_members(mesh: &Mesh) -> Vec<PeerId> {
    let mut members = mesh.members();
    members.sort();
    members
}

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Join `peers` in order under `name` and wait until every peer sees all
/// of them.
pub async fn session(name: &str, peers: &[&Mesh]) {
    for mesh in peers {
        mesh.join_or_host(name).await.expect("join_or_host");
    }
    let expected: Vec<PeerId> = {
        let mut all: Vec<PeerId> = peers.iter().map(|m| m.id().clone()).collect();
        all.sort();
        all
    };
    eventually("membership to converge", || {
        peers.iter().all(|m| {
            sorted_members(m) == expected && m.members().iter().all(|p| m.local().has_conn(p))
        })
    })
    .await;
}
