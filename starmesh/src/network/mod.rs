//! Star-topology state replication with host failover.
//!
//! A [`ReplicationNetwork`] keeps one application state `S` convergent across
//! every member of a session. Sessions are found by a rendezvous name: the
//! peer that manages to bind that name hosts the session, everyone else
//! connects to it.
//!
//! # Architecture
//!
//! ```text
//!                  ┌────────────────────┐
//!                  │ hosting LinkManager │  bound to the rendezvous name
//!                  │  (discovery +       │  MEMBER_CHANGE / SET_STATE /
//!                  │   membership only)  │  NEW_JOIN / CHANGE_HOST
//!                  └─────────┬──────────┘
//!            ┌───────────────┼───────────────┐
//!   ┌────────▼───────┐ ┌─────▼──────────┐ ┌──▼─────────────┐
//!   │ member (host)  │◄┤ member         ├►│ member         │
//!   │ local manager  │ │ local manager  │ │ local manager  │
//!   └────────────────┘ └────────────────┘ └────────────────┘
//!        full mesh between local managers: DISPATCH / CANCEL / PROMOTE
//! ```
//!
//! The host is only a discovery point and membership broadcaster. State
//! changes go through a two-phase round run by whichever member dispatches
//! (see [`ReplicationNetwork::dispatch`]), with the dispatcher reaching
//! itself through a loopback channel.
//!
//! # Consistency
//!
//! Best effort, not linearizable. Concurrent dispatchers are serialized only
//! by the busy reply and randomized retry. Each host announces a term with
//! its membership; stale terms are logged but not fenced, so a former host
//! that has not noticed its replacement can still deliver stray frames.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::error::{DispatchError, MeshError};
use crate::events::{BusEvent, EventBus, SubscriptionId};
use crate::link::{Delivery, LinkEvent, LinkEventKind, LinkManager};
use crate::types::{PeerId, Tag};

mod dispatch;
pub mod membership;
pub mod stage;

use membership::{HostAnnouncement, MemberChange, NameAnnouncement};
use stage::Staged;

/// Application state replicated by a network.
pub trait NetworkState: Clone + Serialize + DeserializeOwned + 'static {}

impl<T: Clone + Serialize + DeserializeOwned + 'static> NetworkState for T {}

/// Action proposed through [`ReplicationNetwork::dispatch`].
pub trait Action: Serialize + DeserializeOwned + 'static {}

impl<T: Serialize + DeserializeOwned + 'static> Action for T {}

/// `(current state, action, sender) -> next state`, or a rejection message.
pub type Reducer<S, A> = Rc<dyn Fn(&S, &A, &PeerId) -> Result<S, String>>;

/// Wrap a closure as a [`Reducer`].
pub fn reducer<S, A>(f: impl Fn(&S, &A, &PeerId) -> Result<S, String> + 'static) -> Reducer<S, A> {
    Rc::new(f)
}

/// Events published by a [`ReplicationNetwork`].
#[derive(Debug, Clone)]
pub enum NetworkEvent<S> {
    /// The committed state changed.
    StateChange(S),
    /// The member list changed; carries the new list.
    MembersChange(Vec<PeerId>),
    MembersJoin(Vec<PeerId>),
    MembersLeft(Vec<PeerId>),
    /// A different peer now hosts the session.
    HostChange(PeerId),
    MemberRenamed { peer: PeerId, name: String },
    /// Session-scoped failure nobody is waiting on.
    NetworkError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkEventKind {
    StateChange,
    MembersChange,
    MembersJoin,
    MembersLeft,
    HostChange,
    MemberRenamed,
    NetworkError,
}

impl<S: Clone + 'static> BusEvent for NetworkEvent<S> {
    type Kind = NetworkEventKind;
    type Key = PeerId;

    fn kind(&self) -> NetworkEventKind {
        match self {
            NetworkEvent::StateChange(_) => NetworkEventKind::StateChange,
            NetworkEvent::MembersChange(_) => NetworkEventKind::MembersChange,
            NetworkEvent::MembersJoin(_) => NetworkEventKind::MembersJoin,
            NetworkEvent::MembersLeft(_) => NetworkEventKind::MembersLeft,
            NetworkEvent::HostChange(_) => NetworkEventKind::HostChange,
            NetworkEvent::MemberRenamed { .. } => NetworkEventKind::MemberRenamed,
            NetworkEvent::NetworkError(_) => NetworkEventKind::NetworkError,
        }
    }

    fn key(&self) -> Option<&PeerId> {
        match self {
            NetworkEvent::HostChange(peer) | NetworkEvent::MemberRenamed { peer, .. } => Some(peer),
            _ => None,
        }
    }
}

/// The joined side of a session.
struct Session {
    name: String,
    watch: SubscriptionId,
}

/// The hosting side of a session.
struct Hosting {
    name: String,
    links: Rc<LinkManager>,
    members: Vec<PeerId>,
    names: BTreeMap<PeerId, String>,
    term: u64,
    subscriptions: Vec<(LinkEventKind, SubscriptionId)>,
}

struct Pending<A> {
    action: A,
    reply: oneshot::Sender<Result<(), DispatchError>>,
}

/// Replicated state machine over a [`LinkManager`].
///
/// Always handled as `Rc<ReplicationNetwork<S, A>>`.
pub struct ReplicationNetwork<S: NetworkState, A: Action> {
    local: Rc<LinkManager>,
    config: MeshConfig,
    initial: S,
    reducer: Option<Reducer<S, A>>,

    state: RefCell<S>,
    staged: RefCell<Option<Staged<S>>>,
    synced: Cell<bool>,

    members: RefCell<Vec<PeerId>>,
    host: RefCell<Option<PeerId>>,
    host_term: Cell<u64>,
    names: RefCell<BTreeMap<PeerId, String>>,
    session: RefCell<Option<Session>>,
    hosting: RefCell<Option<Hosting>>,

    queue: RefCell<VecDeque<Pending<A>>>,
    in_flight: Cell<bool>,

    events: EventBus<NetworkEvent<S>>,
    me: Weak<Self>,
}

impl<S: NetworkState, A: Action> fmt::Debug for ReplicationNetwork<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationNetwork")
            .field("id", self.id())
            .field("host", &self.host.borrow())
            .field("members", &self.members.borrow())
            .field("hosting", &self.is_host())
            .field("joined", &self.is_joined())
            .field("queued", &self.queue.borrow().len())
            .finish()
    }
}

impl<S: NetworkState, A: Action> ReplicationNetwork<S, A> {
    /// Create an unjoined network on top of `local`.
    ///
    /// Without a reducer the peer can follow a session but rejects every
    /// proposal it receives.
    pub fn new(
        local: Rc<LinkManager>,
        initial: S,
        reducer: Option<Reducer<S, A>>,
        config: MeshConfig,
    ) -> Rc<Self> {
        let network = Rc::new_cyclic(|me| Self {
            local,
            config,
            state: RefCell::new(initial.clone()),
            initial,
            reducer,
            staged: RefCell::new(None),
            synced: Cell::new(false),
            members: RefCell::new(Vec::new()),
            host: RefCell::new(None),
            host_term: Cell::new(0),
            names: RefCell::new(BTreeMap::new()),
            session: RefCell::new(None),
            hosting: RefCell::new(None),
            queue: RefCell::new(VecDeque::new()),
            in_flight: Cell::new(false),
            events: EventBus::new(),
            me: me.clone(),
        });
        network.install_handlers();
        network
    }

    fn install_handlers(&self) {
        let handlers: [(Tag, fn(&Self, &Delivery)); 8] = [
            (Tag::MemberChange, Self::on_member_change),
            (Tag::SetState, Self::on_set_state),
            (Tag::ChangeHost, Self::on_change_host),
            (Tag::NewJoin, Self::on_new_join),
            (Tag::Rename, Self::on_rename),
            (Tag::Dispatch, Self::on_dispatch),
            (Tag::Cancel, Self::on_cancel),
            (Tag::Promote, Self::on_promote),
        ];
        for (tag, handler) in handlers {
            let me = self.me.clone();
            self.local.on_pkg(tag, move |delivery| {
                if let Some(me) = me.upgrade() {
                    handler(&me, delivery);
                }
            });
        }
    }

    pub fn id(&self) -> &PeerId {
        self.local.id()
    }

    pub fn local(&self) -> &Rc<LinkManager> {
        &self.local
    }

    pub fn events(&self) -> &EventBus<NetworkEvent<S>> {
        &self.events
    }

    /// Snapshot of the committed state.
    pub fn state(&self) -> S {
        self.state.borrow().clone()
    }

    pub fn members(&self) -> Vec<PeerId> {
        self.members.borrow().clone()
    }

    pub fn host_id(&self) -> Option<PeerId> {
        self.host.borrow().clone()
    }

    /// Highest host term seen.
    pub fn host_term(&self) -> u64 {
        self.host_term.get()
    }

    /// Known display names by peer.
    pub fn names(&self) -> BTreeMap<PeerId, String> {
        self.names.borrow().clone()
    }

    pub fn is_host(&self) -> bool {
        self.hosting.borrow().is_some()
    }

    pub fn is_joined(&self) -> bool {
        self.session.borrow().is_some()
    }

    pub fn has_staged(&self) -> bool {
        self.staged.borrow().is_some()
    }

    /// Host `name` if nobody does yet, then join it.
    ///
    /// A failed hosting attempt is logged and otherwise ignored.
    pub async fn join_or_host(&self, name: &str) -> Result<(), MeshError> {
        if let Err(error) = self.host(name).await {
            debug!(peer = %self.id(), name, error = %error, "not hosting, joining existing host");
        }
        self.join(name).await
    }

    /// Bind the rendezvous name and start accepting members.
    ///
    /// With a non-empty member list this is a takeover: every member except
    /// the previous host is reconnected, told about the new host, and sent
    /// the refreshed membership.
    ///
    /// # Errors
    ///
    /// - `MeshError::AlreadyHosting` if this peer already hosts a session
    /// - `MeshError::Transport` if the name is taken
    pub async fn host(&self, name: &str) -> Result<(), MeshError> {
        if let Some(hosting) = self.hosting.borrow().as_ref() {
            return Err(MeshError::AlreadyHosting(hosting.name.clone()));
        }

        let endpoint = self.local.network().bind(Some(PeerId::new(name)))?;
        let links = LinkManager::new(endpoint, self.config.clone());
        let term = self.host_term.get() + 1;
        self.host_term.set(term);

        let previous = self.host_id();
        let seed: Vec<PeerId> = self
            .members()
            .into_iter()
            .filter(|m| Some(m) != previous.as_ref())
            .collect();

        let subscriptions = self.subscribe_hosting(&links);
        *self.hosting.borrow_mut() = Some(Hosting {
            name: name.to_string(),
            links: links.clone(),
            members: seed.clone(),
            names: self.names(),
            term,
            subscriptions,
        });
        info!(peer = %self.id(), name, term, "hosting");

        if !seed.is_empty() {
            self.take_over(&links, seed, term).await;
        }
        Ok(())
    }

    fn subscribe_hosting(&self, links: &Rc<LinkManager>) -> Vec<(LinkEventKind, SubscriptionId)> {
        let opened = {
            let me = self.me.clone();
            links.events().on(LinkEventKind::Opened, move |event| {
                if let (Some(me), LinkEvent::Opened(peer)) = (me.upgrade(), event) {
                    me.on_guest_opened(peer);
                }
            })
        };
        let closed = {
            let me = self.me.clone();
            links.events().on(LinkEventKind::Closed, move |event| {
                if let (Some(me), LinkEvent::Closed(peer)) = (me.upgrade(), event) {
                    me.on_guest_closed(peer);
                }
            })
        };
        let joins = {
            let me = self.me.clone();
            links.on_pkg(Tag::Join, move |delivery| {
                if let Some(me) = me.upgrade() {
                    me.on_guest_join(delivery);
                }
            })
        };
        vec![
            (LinkEventKind::Opened, opened),
            (LinkEventKind::Closed, closed),
            (LinkEventKind::Package, joins),
        ]
    }

    async fn take_over(&self, links: &Rc<LinkManager>, seed: Vec<PeerId>, term: u64) {
        info!(peer = %self.id(), members = ?seed, term, "taking over as host");
        let timeout = self.config.connect_timeout;
        let connects = seed.iter().map(|peer| links.connect(peer, timeout));
        let results = futures::future::join_all(connects).await;
        for (peer, result) in seed.iter().zip(results) {
            if let Err(error) = result {
                warn!(peer = %peer, error = %error, "member unreachable during takeover");
                if let Some(hosting) = self.hosting.borrow_mut().as_mut() {
                    hosting.members.retain(|m| m != peer);
                }
            }
        }

        let announcement = HostAnnouncement {
            host: self.id().clone(),
            term,
        };
        if let Some(data) = encode(&announcement) {
            for (peer, result) in links.broadcast_pkg(Tag::ChangeHost, data).await {
                if let Err(error) = result {
                    warn!(peer = %peer, error = %error, "CHANGE_HOST not delivered");
                }
            }
        }

        self.broadcast_members().await;
    }

    fn member_change(&self) -> Option<(Rc<LinkManager>, Value)> {
        let hosting = self.hosting.borrow();
        let hosting = hosting.as_ref()?;
        let change = MemberChange {
            host: self.id().clone(),
            members: hosting.members.clone(),
            term: hosting.term,
        };
        Some((hosting.links.clone(), encode(&change)?))
    }

    async fn broadcast_members(&self) {
        let Some((links, data)) = self.member_change() else {
            return;
        };
        debug!(peer = %self.id(), members = %data, "broadcasting MEMBER_CHANGE");
        for (peer, result) in links.broadcast_pkg(Tag::MemberChange, data).await {
            if let Err(error) = result {
                warn!(peer = %peer, error = %error, "MEMBER_CHANGE not delivered");
            }
        }
    }

    fn on_guest_opened(&self, peer: &PeerId) {
        let (links, names) = {
            let mut hosting = self.hosting.borrow_mut();
            let Some(hosting) = hosting.as_mut() else {
                return;
            };
            if hosting.members.contains(peer) {
                return;
            }
            hosting.members.push(peer.clone());
            (hosting.links.clone(), hosting.names.clone())
        };
        info!(host = %self.id(), peer = %peer, "member connected");

        let me = self.me.clone();
        let peer = peer.clone();
        tokio::task::spawn_local(async move {
            let Some(me) = me.upgrade() else {
                return;
            };
            me.broadcast_members().await;

            let state = encode(&*me.state.borrow());
            if let Some(state) = state {
                if let Err(error) = links.send_pkg(&peer, Tag::SetState, state).await {
                    warn!(peer = %peer, error = %error, "SET_STATE not delivered");
                }
            }

            for (id, name) in names {
                let Some(data) = encode(&NameAnnouncement { name, peer: id }) else {
                    continue;
                };
                if let Err(error) = links.send_pkg(&peer, Tag::NewJoin, data).await {
                    warn!(peer = %peer, error = %error, "NEW_JOIN not delivered");
                }
            }
        });
    }

    fn on_guest_closed(&self, peer: &PeerId) {
        {
            let mut hosting = self.hosting.borrow_mut();
            let Some(hosting) = hosting.as_mut() else {
                return;
            };
            if hosting.links.has_conn(peer) || !hosting.members.contains(peer) {
                return;
            }
            hosting.members.retain(|m| m != peer);
            hosting.names.remove(peer);
        }
        info!(host = %self.id(), peer = %peer, "member disconnected");

        let me = self.me.clone();
        tokio::task::spawn_local(async move {
            if let Some(me) = me.upgrade() {
                me.broadcast_members().await;
            }
        });
    }

    fn on_guest_join(&self, delivery: &Delivery) {
        let name: String = match delivery.parse() {
            Ok(name) => name,
            Err(error) => {
                self.report(format!("malformed JOIN from {}: {error}", delivery.from));
                return;
            }
        };
        let links = {
            let mut hosting = self.hosting.borrow_mut();
            let Some(hosting) = hosting.as_mut() else {
                return;
            };
            hosting.names.insert(delivery.from.clone(), name.clone());
            hosting.links.clone()
        };
        debug!(peer = %delivery.from, name = %name, "member named itself");

        let Some(data) = encode(&NameAnnouncement {
            name,
            peer: delivery.from.clone(),
        }) else {
            return;
        };
        tokio::task::spawn_local(async move {
            for (peer, result) in links.broadcast_pkg(Tag::NewJoin, data).await {
                if let Err(error) = result {
                    warn!(peer = %peer, error = %error, "NEW_JOIN not delivered");
                }
            }
        });
    }

    /// Connect to the host of `name` and wait until membership settles.
    ///
    /// Settled means: a member list arrived, the committed state was
    /// received, and a channel exists to every member. If the link to the
    /// host later closes and this peer is the successor, it takes over
    /// hosting under the same name.
    ///
    /// # Errors
    ///
    /// - `MeshError::AlreadyJoined` if a session is active
    /// - `MeshError::Link` if the host cannot be reached
    /// - `MeshError::JoinTimeout` if membership does not settle in time
    pub async fn join(&self, name: &str) -> Result<(), MeshError> {
        if let Some(session) = self.session.borrow().as_ref() {
            return Err(MeshError::AlreadyJoined(session.name.clone()));
        }

        let target = PeerId::new(name);
        self.local.connect(&target, self.config.connect_timeout).await?;

        let watch = {
            let me = self.me.clone();
            let target = target.clone();
            let name = name.to_string();
            self.local.events().on(LinkEventKind::Closed, move |event| {
                if event.peer() == Some(&target) {
                    if let Some(me) = me.upgrade() {
                        me.on_host_link_closed(&name);
                    }
                }
            })
        };
        *self.session.borrow_mut() = Some(Session {
            name: name.to_string(),
            watch,
        });
        info!(peer = %self.id(), name, "joining");

        if let Some(display) = self.config.display_name.clone() {
            if let Err(error) = self.local.send_pkg(&target, Tag::Join, json!(display)).await {
                warn!(name, error = %error, "JOIN not delivered");
            }
        }

        let deadline = Instant::now() + self.config.join_timeout;
        loop {
            if self.is_settled() {
                info!(peer = %self.id(), name, members = ?self.members(), "joined");
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(peer = %self.id(), name, "join did not settle");
                self.end_session();
                self.local.disconnect(&target);
                return Err(MeshError::JoinTimeout {
                    name: name.to_string(),
                    timeout: self.config.join_timeout,
                });
            }
            tokio::time::sleep(self.config.join_poll_interval).await;
        }
    }

    fn is_settled(&self) -> bool {
        let members = self.members.borrow();
        !members.is_empty() && self.synced.get() && members.iter().all(|m| self.local.has_conn(m))
    }

    fn end_session(&self) {
        if let Some(session) = self.session.borrow_mut().take() {
            self.local.events().off(LinkEventKind::Closed, session.watch);
        }
    }

    fn on_host_link_closed(&self, name: &str) {
        if self.is_host() || !self.is_joined() {
            return;
        }
        let members = self.members();
        if members.len() <= 1 {
            return;
        }
        let host = self.host_id();
        if membership::successor(&members, host.as_ref()) != Some(self.id()) {
            debug!(peer = %self.id(), host = ?host, "host link lost, waiting for successor");
            return;
        }

        info!(peer = %self.id(), host = ?host, name, "host link lost, promoting self");
        let me = self.me.clone();
        let name = name.to_string();
        tokio::task::spawn_local(async move {
            let Some(me) = me.upgrade() else {
                return;
            };
            if let Err(error) = me.host(&name).await {
                warn!(peer = %me.id(), name = %name, error = %error, "takeover failed");
                me.report(format!("takeover of {name} failed: {error}"));
            }
        });
    }

    /// Apply a MEMBER_CHANGE. Identical member sets are ignored.
    pub fn handle_member_change(&self, change: MemberChange) {
        let known = self.host_term.get();
        if change.term < known {
            warn!(
                peer = %self.id(),
                host = %change.host,
                term = change.term,
                known,
                "MEMBER_CHANGE from stale host term"
            );
        } else {
            self.host_term.set(change.term);
        }

        let previous = self.members();
        if membership::same_set(&previous, &change.members) {
            return;
        }

        let previous_host = self.host.replace(Some(change.host.clone()));
        let host_changed = previous_host.as_ref() != Some(&change.host);
        let diff = membership::diff(&previous, &change.members);
        *self.members.borrow_mut() = change.members.clone();
        debug!(peer = %self.id(), joined = ?diff.joined, left = ?diff.left, "membership changed");

        for peer in &diff.joined {
            if self.local.has_conn(peer) {
                continue;
            }
            let me = self.me.clone();
            let peer = peer.clone();
            tokio::task::spawn_local(async move {
                let Some(me) = me.upgrade() else {
                    return;
                };
                if let Err(error) = me.local.connect(&peer, me.config.connect_timeout).await {
                    warn!(peer = %peer, error = %error, "failed to reach new member");
                    me.report(format!("failed to reach {peer}: {error}"));
                }
            });
        }
        for peer in &diff.left {
            self.local.disconnect(peer);
            self.names.borrow_mut().remove(peer);
        }

        self.events.emit(NetworkEvent::MembersChange(change.members));
        if !diff.joined.is_empty() {
            self.events.emit(NetworkEvent::MembersJoin(diff.joined));
        }
        if !diff.left.is_empty() {
            self.events.emit(NetworkEvent::MembersLeft(diff.left));
        }
        if host_changed {
            self.events.emit(NetworkEvent::HostChange(change.host));
        }
    }

    fn on_member_change(&self, delivery: &Delivery) {
        match delivery.parse::<MemberChange>() {
            Ok(change) => self.handle_member_change(change),
            Err(error) => {
                self.report(format!("malformed MEMBER_CHANGE from {}: {error}", delivery.from))
            }
        }
    }

    fn on_set_state(&self, delivery: &Delivery) {
        match delivery.parse::<S>() {
            Ok(state) => {
                *self.state.borrow_mut() = state.clone();
                self.synced.set(true);
                debug!(peer = %self.id(), from = %delivery.from, "state received");
                self.events.emit(NetworkEvent::StateChange(state));
            }
            Err(error) => {
                self.report(format!("malformed SET_STATE from {}: {error}", delivery.from))
            }
        }
    }

    fn on_change_host(&self, delivery: &Delivery) {
        let announcement: HostAnnouncement = match delivery.parse() {
            Ok(announcement) => announcement,
            Err(error) => {
                self.report(format!("malformed CHANGE_HOST from {}: {error}", delivery.from));
                return;
            }
        };
        if announcement.term < self.host_term.get() {
            warn!(
                host = %announcement.host,
                term = announcement.term,
                known = self.host_term.get(),
                "CHANGE_HOST from stale host term"
            );
            return;
        }
        self.host_term.set(announcement.term);
        let previous = self.host.replace(Some(announcement.host.clone()));
        if previous.as_ref() != Some(&announcement.host) {
            info!(
                peer = %self.id(),
                host = %announcement.host,
                term = announcement.term,
                "host changed"
            );
            self.events.emit(NetworkEvent::HostChange(announcement.host));
        }
    }

    fn on_new_join(&self, delivery: &Delivery) {
        match delivery.parse::<NameAnnouncement>() {
            Ok(NameAnnouncement { name, peer }) => self.record_name(peer, name),
            Err(error) => {
                self.report(format!("malformed NEW_JOIN from {}: {error}", delivery.from))
            }
        }
    }

    fn on_rename(&self, delivery: &Delivery) {
        match delivery.parse::<String>() {
            Ok(name) => {
                if let Some(hosting) = self.hosting.borrow_mut().as_mut() {
                    hosting.names.insert(delivery.from.clone(), name.clone());
                }
                self.record_name(delivery.from.clone(), name);
            }
            Err(error) => self.report(format!("malformed RENAME from {}: {error}", delivery.from)),
        }
    }

    fn record_name(&self, peer: PeerId, name: String) {
        let previous = self.names.borrow_mut().insert(peer.clone(), name.clone());
        if previous.as_deref() != Some(name.as_str()) {
            self.events.emit(NetworkEvent::MemberRenamed { peer, name });
        }
    }

    /// Change this peer's display name and tell every member.
    pub async fn rename(&self, name: &str) {
        if let Some(hosting) = self.hosting.borrow_mut().as_mut() {
            hosting.names.insert(self.id().clone(), name.to_string());
        }
        self.record_name(self.id().clone(), name.to_string());

        let others: Vec<PeerId> = self.members().into_iter().filter(|m| m != self.id()).collect();
        let sends = others
            .iter()
            .map(|peer| self.local.send_pkg(peer, Tag::Rename, json!(name)));
        for (peer, result) in others.iter().zip(futures::future::join_all(sends).await) {
            if let Err(error) = result {
                warn!(peer = %peer, error = %error, "RENAME not delivered");
            }
        }
    }

    /// Leave the session: stop hosting, drop every link, and reset the
    /// state to the initial snapshot. Queued dispatches fail with
    /// `DispatchError::Left`.
    pub fn leave(&self) {
        self.end_session();
        let hosting = self.hosting.borrow_mut().take();
        if let Some(hosting) = hosting {
            for (kind, id) in hosting.subscriptions {
                hosting.links.events().off(kind, id);
            }
            hosting.links.destroy();
            info!(peer = %self.id(), name = %hosting.name, "stopped hosting");
        }
        self.local.disconnect_all();

        let old = std::mem::take(&mut *self.members.borrow_mut());
        self.host.replace(None);
        self.staged.replace(None);
        self.names.borrow_mut().clear();
        self.synced.set(false);
        *self.state.borrow_mut() = self.initial.clone();

        let pending: Vec<Pending<A>> = self.queue.borrow_mut().drain(..).collect();
        for pending in pending {
            let _ = pending.reply.send(Err(DispatchError::Left));
        }

        info!(peer = %self.id(), members = ?old, "left session");
        self.events.emit(NetworkEvent::MembersLeft(old));
        self.events.emit(NetworkEvent::MembersChange(Vec::new()));
        self.events.emit(NetworkEvent::StateChange(self.initial.clone()));
    }

    pub(crate) fn report(&self, message: String) {
        warn!(peer = %self.id(), "{message}");
        self.events.emit(NetworkEvent::NetworkError(message));
    }
}

/// Serialize an outbound payload, logging failures.
fn encode<T: Serialize>(value: &T) -> Option<Value> {
    serde_json::to_value(value)
        .map_err(|error| warn!(error = %error, "failed to encode payload"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DEFAULT_UNTIL_TIMEOUT;
    use crate::transport::{MemoryNetwork, Network};
    use tokio::task::LocalSet;

    type Node = Rc<ReplicationNetwork<Value, Value>>;

    async fn node(network: &MemoryNetwork, id: &str) -> Node {
        let config = MeshConfig::local_network();
        let endpoint = network.bind(Some(PeerId::new(id))).unwrap();
        let local = LinkManager::new(endpoint, config.clone());
        local.connect(&PeerId::new(id), DEFAULT_UNTIL_TIMEOUT).await.unwrap();
        ReplicationNetwork::new(local, Value::Null, None, config)
    }

    fn record(node: &Node) -> Rc<RefCell<Vec<NetworkEventKind>>> {
        let kinds = Rc::new(RefCell::new(Vec::new()));
        let k = kinds.clone();
        node.events().on_any(move |kind, _| k.borrow_mut().push(kind));
        kinds
    }

    fn change(host: &str, members: &[&str], term: u64) -> MemberChange {
        MemberChange {
            host: PeerId::new(host),
            members: members.iter().map(|m| PeerId::new(*m)).collect(),
            term,
        }
    }

    #[tokio::test]
    async fn test_member_change_with_same_set_is_ignored() {
        LocalSet::new()
            .run_until(async {
                let network = MemoryNetwork::new();
                let alice = node(&network, "alice").await;
                let _bob = node(&network, "bob").await;
                let kinds = record(&alice);

                alice.handle_member_change(change("alice", &["alice", "bob"], 1));
                alice.handle_member_change(change("alice", &["bob", "alice"], 1));

                assert_eq!(
                    *kinds.borrow(),
                    vec![
                        NetworkEventKind::MembersChange,
                        NetworkEventKind::MembersJoin,
                        NetworkEventKind::HostChange,
                    ]
                );
                assert_eq!(alice.members(), vec![PeerId::new("alice"), PeerId::new("bob")]);
                assert_eq!(alice.host_id(), Some(PeerId::new("alice")));
            })
            .await;
    }

    #[tokio::test]
    async fn test_member_change_reports_departures() {
        LocalSet::new()
            .run_until(async {
                let network = MemoryNetwork::new();
                let alice = node(&network, "alice").await;
                let bob = node(&network, "bob").await;
                alice
                    .local()
                    .connect(bob.id(), DEFAULT_UNTIL_TIMEOUT)
                    .await
                    .unwrap();
                alice.handle_member_change(change("alice", &["alice", "bob"], 1));

                let kinds = record(&alice);
                alice.handle_member_change(change("alice", &["alice"], 1));

                assert_eq!(
                    *kinds.borrow(),
                    vec![NetworkEventKind::MembersChange, NetworkEventKind::MembersLeft]
                );
                assert!(!alice.local().has_conn(bob.id()));
            })
            .await;
    }

    #[tokio::test]
    async fn test_stale_change_host_is_ignored() {
        LocalSet::new()
            .run_until(async {
                let network = MemoryNetwork::new();
                let alice = node(&network, "alice").await;
                let kinds = record(&alice);
                let me = PeerId::new("alice");

                let fresh = json!({"host": "carol", "term": 3});
                alice.local().send_pkg(&me, Tag::ChangeHost, fresh).await.unwrap();
                let stale = json!({"host": "bob", "term": 2});
                alice.local().send_pkg(&me, Tag::ChangeHost, stale).await.unwrap();

                assert_eq!(alice.host_id(), Some(PeerId::new("carol")));
                assert_eq!(alice.host_term(), 3);
                assert_eq!(*kinds.borrow(), vec![NetworkEventKind::HostChange]);
            })
            .await;
    }

    #[tokio::test]
    async fn test_names_follow_new_join_and_rename() {
        LocalSet::new()
            .run_until(async {
                let network = MemoryNetwork::new();
                let alice = node(&network, "alice").await;
                let me = PeerId::new("alice");

                let joined = json!({"name": "Bobby", "peer": "bob"});
                alice.local().send_pkg(&me, Tag::NewJoin, joined.clone()).await.unwrap();
                alice.local().send_pkg(&me, Tag::NewJoin, joined).await.unwrap();
                alice.local().send_pkg(&me, Tag::Rename, json!("Ally")).await.unwrap();

                let names = alice.names();
                assert_eq!(names.get(&PeerId::new("bob")).map(String::as_str), Some("Bobby"));
                assert_eq!(names.get(&me).map(String::as_str), Some("Ally"));
            })
            .await;
    }
}
