//! Synchronous publish/subscribe over a closed set of event kinds.
//!
//! Every layer of the stack talks upward through an [`EventBus`]: raw links
//! announce `Opened`/`Data`/`Closed`, channels announce received packages,
//! the link manager announces connections, and the replication network
//! announces state and membership changes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ EventBus<E>  (Rc<RefCell<Registry>>)      │
//! │                                          │
//! │  kind ─► persistent listeners (on)       │
//! │       └► one-shot listeners   (once)     │
//! │  any  ─► wildcard listeners   (on_any)   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! # Reentrancy
//!
//! `emit` snapshots the registrations before invoking anything:
//!
//! - a listener removed during the pass is skipped,
//! - a listener added during the pass waits for the next emission,
//! - a one-shot listener is removed *before* it runs and restored at its
//!   original position only if it called [`Retain::keep`].
//!
//! A listener that emits the kind it is currently handling still re-enters
//! `emit`. That works, but the nested emission completes before the outer
//! one continues; treat it as a hazard rather than a feature.
//!
//! # Single-Threaded Design
//!
//! Listeners are `Rc<dyn Fn>`; the bus is `!Send` and meant for a
//! current-thread runtime.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::BusError;

/// Default deadline for [`EventBus::until`].
pub const DEFAULT_UNTIL_TIMEOUT: Duration = Duration::from_millis(500);

/// An event that can travel on an [`EventBus`].
pub trait BusEvent: Clone + 'static {
    /// Closed enumeration of event kinds.
    type Kind: Copy + Eq + Hash + fmt::Debug + 'static;

    /// Type of the discriminating value compared by [`Matcher::Value`].
    type Key: PartialEq + 'static;

    /// The kind listeners subscribe to.
    fn kind(&self) -> Self::Kind;

    /// The event's leading argument, if it has one.
    fn key(&self) -> Option<&Self::Key> {
        None
    }
}

/// Handle returned by every subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Filter for match subscriptions.
pub enum Matcher<E: BusEvent> {
    /// Passes when the event's key equals this value.
    Value(E::Key),
    /// Passes when the predicate returns true.
    Predicate(Box<dyn Fn(&E) -> bool>),
}

impl<E: BusEvent> Matcher<E> {
    pub fn value(key: E::Key) -> Self {
        Matcher::Value(key)
    }

    pub fn predicate(f: impl Fn(&E) -> bool + 'static) -> Self {
        Matcher::Predicate(Box::new(f))
    }

    fn matches(&self, event: &E) -> bool {
        match self {
            Matcher::Value(key) => event.key() == Some(key),
            Matcher::Predicate(f) => f(event),
        }
    }
}

/// Passed to one-shot listeners; calling [`keep`](Retain::keep) re-arms the
/// listener for the next emission instead of removing it.
#[derive(Debug, Default)]
pub struct Retain(Cell<bool>);

impl Retain {
    pub fn keep(&self) {
        self.0.set(true);
    }

    pub fn is_kept(&self) -> bool {
        self.0.get()
    }
}

type EachFn<E> = Rc<dyn Fn(&E)>;
type OnceFn<E> = Rc<dyn Fn(&E, &Retain)>;
type AnyFn<E> = Rc<dyn Fn(<E as BusEvent>::Kind, &E)>;

struct Registration<F, E: BusEvent> {
    id: SubscriptionId,
    matcher: Option<Rc<Matcher<E>>>,
    listener: F,
}

impl<F: Clone, E: BusEvent> Clone for Registration<F, E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            matcher: self.matcher.clone(),
            listener: self.listener.clone(),
        }
    }
}

impl<F, E: BusEvent> Registration<F, E> {
    fn accepts(&self, event: &E) -> bool {
        self.matcher.as_ref().map_or(true, |m| m.matches(event))
    }
}

struct Slots<E: BusEvent> {
    each: Vec<Registration<EachFn<E>, E>>,
    once: Vec<Registration<OnceFn<E>, E>>,
}

impl<E: BusEvent> Default for Slots<E> {
    fn default() -> Self {
        Self {
            each: Vec::new(),
            once: Vec::new(),
        }
    }
}

struct Registry<E: BusEvent> {
    next_id: u64,
    slots: HashMap<E::Kind, Slots<E>>,
    any: Vec<(SubscriptionId, AnyFn<E>)>,
}

impl<E: BusEvent> Registry<E> {
    fn allocate(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }
}

/// Synchronous event bus keyed by [`BusEvent::Kind`].
///
/// Cloning the bus yields another handle on the same registrations.
pub struct EventBus<E: BusEvent> {
    registry: Rc<RefCell<Registry<E>>>,
}

impl<E: BusEvent> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.borrow();
        f.debug_struct("EventBus")
            .field("kinds", &registry.slots.len())
            .field("wildcards", &registry.any.len())
            .finish()
    }
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            registry: Rc::new(RefCell::new(Registry {
                next_id: 0,
                slots: HashMap::new(),
                any: Vec::new(),
            })),
        }
    }

    /// Register a persistent listener.
    pub fn on(&self, kind: E::Kind, listener: impl Fn(&E) + 'static) -> SubscriptionId {
        self.add_each(kind, None, Rc::new(listener))
    }

    /// Register a persistent listener that only sees events passing `matcher`.
    pub fn on_match(
        &self,
        kind: E::Kind,
        matcher: Matcher<E>,
        listener: impl Fn(&E) + 'static,
    ) -> SubscriptionId {
        self.add_each(kind, Some(Rc::new(matcher)), Rc::new(listener))
    }

    /// Register a listener that is removed after its first invocation unless
    /// it calls [`Retain::keep`].
    pub fn once(&self, kind: E::Kind, listener: impl Fn(&E, &Retain) + 'static) -> SubscriptionId {
        self.add_once(kind, None, Rc::new(listener))
    }

    /// One-shot variant of [`on_match`](Self::on_match). Events rejected by
    /// the matcher do not consume the listener.
    pub fn once_match(
        &self,
        kind: E::Kind,
        matcher: Matcher<E>,
        listener: impl Fn(&E, &Retain) + 'static,
    ) -> SubscriptionId {
        self.add_once(kind, Some(Rc::new(matcher)), Rc::new(listener))
    }

    /// Register a wildcard listener receiving every event with its kind.
    pub fn on_any(&self, listener: impl Fn(E::Kind, &E) + 'static) -> SubscriptionId {
        let mut registry = self.registry.borrow_mut();
        let id = registry.allocate();
        registry.any.push((id, Rc::new(listener)));
        id
    }

    /// Remove a registration made with `on`, `once` or their match variants.
    ///
    /// Returns `true` if it was still registered.
    pub fn off(&self, kind: E::Kind, id: SubscriptionId) -> bool {
        let mut registry = self.registry.borrow_mut();
        let Some(slots) = registry.slots.get_mut(&kind) else {
            return false;
        };
        let before = slots.each.len() + slots.once.len();
        slots.each.retain(|r| r.id != id);
        slots.once.retain(|r| r.id != id);
        before != slots.each.len() + slots.once.len()
    }

    /// Remove a wildcard registration.
    pub fn off_any(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.borrow_mut();
        let before = registry.any.len();
        registry.any.retain(|(sub, _)| *sub != id);
        before != registry.any.len()
    }

    /// Number of listeners (persistent and one-shot) registered for `kind`.
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.registry
            .borrow()
            .slots
            .get(&kind)
            .map_or(0, |s| s.each.len() + s.once.len())
    }

    /// Drop every registration. Pending `until` futures fail with
    /// [`BusError::Closed`].
    pub fn clear(&self) {
        let mut registry = self.registry.borrow_mut();
        registry.slots.clear();
        registry.any.clear();
    }

    /// Deliver `event` to persistent, then one-shot, then wildcard listeners.
    pub fn emit(&self, event: E) {
        let kind = event.kind();
        let (each, once, any) = {
            let registry = self.registry.borrow();
            let (each, once) = registry
                .slots
                .get(&kind)
                .map(|s| (s.each.clone(), s.once.clone()))
                .unwrap_or_default();
            (each, once, registry.any.clone())
        };

        for registration in each {
            if self.has_each(kind, registration.id) && registration.accepts(&event) {
                (registration.listener)(&event);
            }
        }

        for registration in once {
            if !self.has_once(kind, registration.id) || !registration.accepts(&event) {
                continue;
            }
            self.off(kind, registration.id);
            let retain = Retain::default();
            (registration.listener)(&event, &retain);
            if retain.is_kept() {
                self.restore_once(kind, registration);
            }
        }

        for (id, listener) in any {
            if self.has_any(id) {
                listener(kind, &event);
            }
        }
    }

    /// Wait for the next event of `kind`.
    ///
    /// Fails with [`BusError::Timeout`] once `timeout` elapses. Dropping the
    /// returned future removes the underlying listener.
    pub async fn until(&self, kind: E::Kind, timeout: Duration) -> Result<E, BusError> {
        self.wait(kind, None, timeout).await
    }

    /// Wait for the next event of `kind` passing `matcher`.
    pub async fn until_match(
        &self,
        kind: E::Kind,
        matcher: Matcher<E>,
        timeout: Duration,
    ) -> Result<E, BusError> {
        self.wait(kind, Some(Rc::new(matcher)), timeout).await
    }

    async fn wait(
        &self,
        kind: E::Kind,
        matcher: Option<Rc<Matcher<E>>>,
        timeout: Duration,
    ) -> Result<E, BusError> {
        let (tx, rx) = oneshot::channel();
        let slot = RefCell::new(Some(tx));
        let id = self.add_once(
            kind,
            matcher,
            Rc::new(move |event: &E, _: &Retain| {
                if let Some(tx) = slot.borrow_mut().take() {
                    let _ = tx.send(event.clone());
                }
            }),
        );
        let _guard = Unsubscribe {
            bus: self,
            kind,
            id,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout {
                kind: format!("{kind:?}"),
                timeout,
            }),
        }
    }

    fn add_each(
        &self,
        kind: E::Kind,
        matcher: Option<Rc<Matcher<E>>>,
        listener: EachFn<E>,
    ) -> SubscriptionId {
        let mut registry = self.registry.borrow_mut();
        let id = registry.allocate();
        registry
            .slots
            .entry(kind)
            .or_default()
            .each
            .push(Registration {
                id,
                matcher,
                listener,
            });
        id
    }

    fn add_once(
        &self,
        kind: E::Kind,
        matcher: Option<Rc<Matcher<E>>>,
        listener: OnceFn<E>,
    ) -> SubscriptionId {
        let mut registry = self.registry.borrow_mut();
        let id = registry.allocate();
        registry
            .slots
            .entry(kind)
            .or_default()
            .once
            .push(Registration {
                id,
                matcher,
                listener,
            });
        id
    }

    fn restore_once(&self, kind: E::Kind, registration: Registration<OnceFn<E>, E>) {
        let mut registry = self.registry.borrow_mut();
        let once = &mut registry.slots.entry(kind).or_default().once;
        let position = once
            .iter()
            .position(|r| r.id > registration.id)
            .unwrap_or(once.len());
        once.insert(position, registration);
    }

    fn has_each(&self, kind: E::Kind, id: SubscriptionId) -> bool {
        self.registry
            .borrow()
            .slots
            .get(&kind)
            .is_some_and(|s| s.each.iter().any(|r| r.id == id))
    }

    fn has_once(&self, kind: E::Kind, id: SubscriptionId) -> bool {
        self.registry
            .borrow()
            .slots
            .get(&kind)
            .is_some_and(|s| s.once.iter().any(|r| r.id == id))
    }

    fn has_any(&self, id: SubscriptionId) -> bool {
        self.registry.borrow().any.iter().any(|(sub, _)| *sub == id)
    }
}

struct Unsubscribe<'a, E: BusEvent> {
    bus: &'a EventBus<E>,
    kind: E::Kind,
    id: SubscriptionId,
}

impl<E: BusEvent> Drop for Unsubscribe<'_, E> {
    fn drop(&mut self) {
        self.bus.off(self.kind, self.id);
    }
}
