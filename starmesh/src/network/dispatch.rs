//! Two-phase stage/commit dispatch.
//!
//! # Round
//!
//! 1. DISPATCH `{round, action}` to every member, ourselves included
//! 2. every member reduces into a staged state and answers `staged`, or
//!    `busy` if it already holds one, or `{"rejected": msg}`
//! 3. any rejection or unreachable member: CANCEL everywhere and fail;
//!    any busy: CANCEL everywhere, back off, retry at the head of the queue;
//!    otherwise PROMOTE everywhere
//! 4. CANCEL and PROMOTE are answered `applied` or `missed`; a member that
//!    missed a PROMOTE (its stage expired) is sent SET_STATE with the
//!    dispatcher's committed state
//!
//! One round is in flight per local peer; later dispatches queue behind it
//! in submission order.

use futures::future::join_all;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::stage::{Proposal, RoundReply, RoundRef, StageReply, Staged};
use super::{encode, Action, NetworkEvent, NetworkState, Pending, ReplicationNetwork};
use crate::error::DispatchError;
use crate::link::Delivery;
use crate::types::{PeerId, Tag};

enum Outcome {
    Done(Result<(), DispatchError>),
    Busy,
}

impl<S: NetworkState, A: Action> ReplicationNetwork<S, A> {
    /// Propose `action` to every member and commit it if all accept.
    ///
    /// # Errors
    ///
    /// - `DispatchError::NotJoined` without members
    /// - `DispatchError::Rejected` if any reducer refused the action; state
    ///   is unchanged everywhere
    /// - `DispatchError::Unreachable` if a member did not answer
    /// - `DispatchError::Diverged` if members lost their staged state before
    ///   PROMOTE and could not be resynchronized
    /// - `DispatchError::Left` if the session ended while queued
    pub async fn dispatch(&self, action: A) -> Result<(), DispatchError> {
        if self.members.borrow().is_empty() {
            return Err(DispatchError::NotJoined);
        }

        let (reply, done) = oneshot::channel();
        self.queue.borrow_mut().push_back(Pending { action, reply });
        self.pump();
        done.await.unwrap_or(Err(DispatchError::Abandoned))
    }

    /// Reduce and commit `action` locally, bypassing the session.
    pub fn dispatch_local(&self, action: &A) -> Result<(), DispatchError> {
        let reducer = self.reducer.as_ref().ok_or(DispatchError::NoReducer)?;
        let next = reducer(&self.state.borrow(), action, self.id())
            .map_err(|reason| DispatchError::Rejected { reasons: vec![reason] })?;
        *self.state.borrow_mut() = next.clone();
        self.events.emit(NetworkEvent::StateChange(next));
        Ok(())
    }

    /// Number of dispatches waiting behind the one in flight.
    pub fn queued(&self) -> usize {
        self.queue.borrow().len()
    }

    fn pump(&self) {
        if self.in_flight.get() {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        self.in_flight.set(true);
        tokio::task::spawn_local(async move {
            me.drain().await;
            me.in_flight.set(false);
        });
    }

    async fn drain(&self) {
        loop {
            let next = self.queue.borrow_mut().pop_front();
            let Some(pending) = next else {
                break;
            };
            if pending.reply.is_closed() {
                debug!(peer = %self.id(), "dropping dispatch abandoned by caller");
                continue;
            }

            match self.run_round(&pending.action).await {
                Outcome::Done(result) => {
                    let _ = pending.reply.send(result);
                }
                Outcome::Busy => {
                    let delay = self.config.busy_backoff();
                    debug!(peer = %self.id(), delay = ?delay, "members busy, retrying");
                    tokio::time::sleep(delay).await;
                    if self.members.borrow().is_empty() {
                        let _ = pending.reply.send(Err(DispatchError::Left));
                    } else {
                        self.queue.borrow_mut().push_front(pending);
                    }
                }
            }
        }
    }

    async fn run_round(&self, action: &A) -> Outcome {
        let members = self.members();
        if members.is_empty() {
            return Outcome::Done(Err(DispatchError::NotJoined));
        }

        let round = rand::random::<u64>();
        let proposal = match serde_json::to_value(Proposal { round, action }) {
            Ok(proposal) => proposal,
            Err(error) => {
                return Outcome::Done(Err(DispatchError::Rejected {
                    reasons: vec![format!("unserializable action: {error}")],
                }))
            }
        };
        debug!(peer = %self.id(), round, members = ?members, "proposing");

        let sends = members
            .iter()
            .map(|peer| self.local.send_pkg(peer, Tag::Dispatch, proposal.clone()));
        let replies = join_all(sends).await;

        let mut rejections: Vec<String> = Vec::new();
        let mut unreachable: Vec<PeerId> = Vec::new();
        let mut busy = false;
        for (peer, reply) in members.iter().zip(replies) {
            let parsed = match reply {
                Ok(Some(data)) => serde_json::from_value::<StageReply>(data).ok(),
                Ok(None) => None,
                Err(error) => {
                    warn!(peer = %peer, round, error = %error, "DISPATCH not delivered");
                    None
                }
            };
            match parsed {
                Some(StageReply::Staged) => {}
                Some(StageReply::Busy) => busy = true,
                Some(StageReply::Rejected(reason)) => {
                    if !rejections.contains(&reason) {
                        rejections.push(reason);
                    }
                }
                None => unreachable.push(peer.clone()),
            }
        }

        let commit = rejections.is_empty() && unreachable.is_empty() && !busy;
        let missed = self.finish_round(&members, round, commit).await;

        if !rejections.is_empty() {
            debug!(peer = %self.id(), round, reasons = ?rejections, "round rejected");
            Outcome::Done(Err(DispatchError::Rejected { reasons: rejections }))
        } else if !unreachable.is_empty() {
            Outcome::Done(Err(DispatchError::Unreachable { peers: unreachable }))
        } else if busy {
            Outcome::Busy
        } else {
            Outcome::Done(self.settle_missed(round, missed).await)
        }
    }

    /// Send CANCEL or PROMOTE for `round` to every member.
    ///
    /// Returns the members that did not apply a PROMOTE. CANCEL misses are
    /// expected from members that answered busy and are not reported.
    async fn finish_round(&self, members: &[PeerId], round: u64, commit: bool) -> Vec<PeerId> {
        let tag = if commit { Tag::Promote } else { Tag::Cancel };
        let Some(data) = encode(&RoundRef { round }) else {
            return Vec::new();
        };
        trace!(peer = %self.id(), round, tag = %tag, "finishing round");
        let sends = members
            .iter()
            .map(|peer| self.local.send_pkg(peer, tag.clone(), data.clone()));

        let mut missed = Vec::new();
        for (peer, result) in members.iter().zip(join_all(sends).await) {
            let reply = match result {
                Ok(Some(data)) => serde_json::from_value::<RoundReply>(data).ok(),
                Ok(None) => None,
                Err(error) => {
                    warn!(
                        peer = %peer,
                        round,
                        tag = %tag,
                        error = %error,
                        "round outcome not delivered"
                    );
                    None
                }
            };
            if commit && reply != Some(RoundReply::Applied) {
                missed.push(peer.clone());
            }
        }
        missed
    }

    /// Bring members that missed the PROMOTE of `round` back in line by
    /// pushing this peer's committed state to them.
    async fn settle_missed(&self, round: u64, missed: Vec<PeerId>) -> Result<(), DispatchError> {
        if missed.is_empty() {
            return Ok(());
        }
        self.report(format!("round {round} not applied by {missed:?}"));
        if missed.contains(self.id()) {
            return Err(DispatchError::Diverged { peers: missed });
        }

        let Some(state) = encode(&*self.state.borrow()) else {
            return Err(DispatchError::Diverged { peers: missed });
        };
        let mut diverged = Vec::new();
        for peer in missed {
            match self.local.send_pkg(&peer, Tag::SetState, state.clone()).await {
                Ok(_) => debug!(peer = %peer, round, "resynchronized member"),
                Err(error) => {
                    warn!(peer = %peer, round, error = %error, "SET_STATE not delivered");
                    diverged.push(peer);
                }
            }
        }
        if diverged.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::Diverged { peers: diverged })
        }
    }

    pub(super) fn on_dispatch(&self, delivery: &Delivery) {
        let reply = self.stage(delivery);
        trace!(peer = %self.id(), from = %delivery.from, reply = ?reply, "stage reply");
        if let Err(error) = delivery.responder.reply_with(&reply) {
            warn!(error = %error, "failed to encode stage reply");
        }
    }

    fn stage(&self, delivery: &Delivery) -> StageReply {
        let proposal: Proposal<A> = match delivery.parse() {
            Ok(proposal) => proposal,
            Err(error) => {
                let message = format!("malformed DISPATCH from {}: {error}", delivery.from);
                self.report(message.clone());
                return StageReply::Rejected(message);
            }
        };

        if self.staged.borrow().is_some() {
            return StageReply::Busy;
        }

        let Some(reducer) = &self.reducer else {
            self.report(format!("DISPATCH from {} but no reducer configured", delivery.from));
            return StageReply::Rejected("no reducer configured".to_string());
        };

        let next = match reducer(&self.state.borrow(), &proposal.action, &delivery.from) {
            Ok(next) => next,
            Err(reason) => return StageReply::Rejected(reason),
        };

        *self.staged.borrow_mut() = Some(Staged {
            round: proposal.round,
            proposer: delivery.from.clone(),
            state: next,
        });
        self.expire_stage(proposal.round);
        StageReply::Staged
    }

    /// Drop the staged state of `round` if it is still unresolved after the
    /// stale timeout.
    fn expire_stage(&self, round: u64) {
        let timeout = self.config.stale_stage_timeout;
        if timeout.is_zero() {
            return;
        }
        let me = self.me.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(timeout).await;
            let Some(me) = me.upgrade() else {
                return;
            };
            let expired = {
                let mut staged = me.staged.borrow_mut();
                if staged.as_ref().is_some_and(|s| s.round == round) {
                    staged.take()
                } else {
                    None
                }
            };
            if let Some(expired) = expired {
                warn!(
                    peer = %me.id(),
                    round,
                    proposer = %expired.proposer,
                    "discarding stale staged state"
                );
            }
        });
    }

    fn resolve(&self, delivery: &Delivery) -> Option<Staged<S>> {
        let RoundRef { round } = match delivery.parse() {
            Ok(round) => round,
            Err(error) => {
                self.report(format!("malformed {} from {}: {error}", delivery.tag, delivery.from));
                return None;
            }
        };
        let mut staged = self.staged.borrow_mut();
        if staged.as_ref().is_some_and(|s| s.round == round) {
            return staged.take();
        }
        trace!(peer = %self.id(), round, tag = %delivery.tag, "no staged state for round");
        None
    }

    pub(super) fn on_cancel(&self, delivery: &Delivery) {
        let reply = match self.resolve(delivery) {
            Some(staged) => {
                debug!(peer = %self.id(), round = staged.round, "staged state cancelled");
                RoundReply::Applied
            }
            None => RoundReply::Missed,
        };
        answer(delivery, reply);
    }

    pub(super) fn on_promote(&self, delivery: &Delivery) {
        let Some(staged) = self.resolve(delivery) else {
            self.report(format!("PROMOTE from {} has no staged state", delivery.from));
            answer(delivery, RoundReply::Missed);
            return;
        };
        debug!(
            peer = %self.id(),
            round = staged.round,
            proposer = %staged.proposer,
            "promoting staged state"
        );
        *self.state.borrow_mut() = staged.state.clone();
        self.events.emit(NetworkEvent::StateChange(staged.state));
        answer(delivery, RoundReply::Applied);
    }
}

fn answer(delivery: &Delivery, reply: RoundReply) {
    if let Err(error) = delivery.responder.reply_with(&reply) {
        warn!(error = %error, "failed to encode round reply");
    }
}
