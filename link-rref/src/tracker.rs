// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! The fork-tracking core (spec §4.3): the node-local state machine that
//! maintains the owner table, the set of live forks per owned reference, and
//! the two pending-user tables that compensate for non-FIFO delivery.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    agent::{Agent, WorkerInfo},
    error::Error,
    ident::{ForkId, IdAllocator, RRefId, WorkerId},
    message::Message,
    pin::{self, PendingArgs, Pinned},
    rref::{ForkDescriptor, Owner, Reference, User},
};

/// All tables protected by the tracker's single mutex (spec §3, §5).
pub(crate) struct State<V> {
    owners: HashMap<RRefId, Arc<Owner<V>>>,
    forks: HashMap<RRefId, HashSet<ForkId>>,
    pending_users: HashMap<ForkId, Arc<User>>,
    pending_fork_requests: HashMap<ForkId, Arc<User>>,
    pending_accepted_users: HashSet<ForkId>,
    pending_rref_args: PendingArgs,
}

impl<V> Default for State<V> {
    fn default() -> Self {
        Self {
            owners: HashMap::new(),
            forks: HashMap::new(),
            pending_users: HashMap::new(),
            pending_fork_requests: HashMap::new(),
            pending_accepted_users: HashSet::new(),
            pending_rref_args: PendingArgs::new(),
        }
    }
}

struct Inner<A, V> {
    self_worker: WorkerId,
    alloc: IdAllocator,
    agent: A,
    spawner: link_async::Spawner,
    state: Mutex<State<V>>,
}

/// Node-local distributed reference count tracker.
///
/// Cheaply `Clone`-able (an `Arc` around the actual state), following the
/// `Hpv<Rng, Addr>` pattern used elsewhere in this workspace for shared,
/// mutex-guarded protocol state.
pub struct Tracker<A, V> {
    inner: Arc<Inner<A, V>>,
}

impl<A, V> Clone for Tracker<A, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn erase<T: Send + Sync + 'static>(r: Arc<T>) -> Pinned {
    r
}

impl<A, V> Tracker<A, V>
where
    A: Agent,
    V: Send + Sync + 'static,
{
    /// Construct a tracker for `self_worker`, using `agent` to talk to the
    /// rest of the cluster. Fails only if there is no ambient async runtime
    /// to spawn continuation tasks on (see [`link_async::Spawner::from_current`]).
    pub fn new(self_worker: WorkerId, agent: A) -> Result<Self, Error> {
        let spawner = link_async::Spawner::from_current().ok_or(Error::NoAsyncContext)?;
        Ok(Self {
            inner: Arc::new(Inner {
                self_worker,
                alloc: IdAllocator::new(self_worker),
                agent,
                spawner,
                state: Mutex::new(State::default()),
            }),
        })
    }

    pub fn self_worker(&self) -> WorkerId {
        self.inner.self_worker
    }

    pub fn worker_info(&self, id: WorkerId) -> WorkerInfo {
        self.inner.agent.worker_info(id)
    }

    /// This node's identifier allocator, for callers that need to mint an
    /// `RRefId`/`ForkId` ahead of registering it (e.g. an embedder relaying
    /// an id it learned out-of-band).
    pub fn alloc(&self) -> &IdAllocator {
        &self.inner.alloc
    }

    fn dispatch(&self, dst: WorkerId, msg: Message) {
        debug_assert!(
            msg.is_fire_and_forget(),
            "dispatch() called with a message that expects a structured reply: {:?}",
            msg
        );
        let this = self.clone();
        self.inner
            .spawner
            .spawn(async move {
                if let Err(e) = this.inner.agent.send(dst, msg).await {
                    tracing::error!(error = %e, worker = %dst, "fire-and-forget send failed");
                }
            })
            .detach();
    }

    fn spawn_reply<F, Fut>(&self, dst: WorkerId, msg: Message, on_reply: F)
    where
        F: FnOnce(Result<Message, Error>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug_assert!(
            !msg.is_fire_and_forget(),
            "spawn_reply() called with a fire-and-forget message: {:?}",
            msg
        );
        let this = self.clone();
        self.inner
            .spawner
            .spawn(async move {
                let reply = this.inner.agent.send(dst, msg).await;
                on_reply(reply).await;
            })
            .detach();
    }

    /// Owner-side: register a newly-known fork and build the `USER_ACCEPT`
    /// reply addressed to its holder.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn accept_user_rref(&self, rref_id: RRefId, fork_id: ForkId) -> Result<Message, Error> {
        self.add_fork_of_owner(rref_id, fork_id)?;
        Ok(Message::user_accept(rref_id, fork_id))
    }

    /// Owner-side: a `FORK_NOTIFY` arrived for a user-to-user fork. Registers
    /// the new fork, dispatches `USER_ACCEPT` to `dst`, and returns the
    /// `FORK_ACCEPT` to send back to the forking user.
    ///
    /// The spec's §4.3 prose additionally describes deleting the newly
    /// registered fork once `dst` acks the `USER_ACCEPT` send; this
    /// implementation does not do so -- see DESIGN.md for why (in short: it
    /// would violate invariant 4 and testable property 1, which only allow
    /// draining `forks[rref_id]` on `USER_DELETE`).
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn accept_fork_request(
        &self,
        rref_id: RRefId,
        fork_id: ForkId,
        dst: WorkerId,
    ) -> Result<Message, Error> {
        let user_accept = self.accept_user_rref(rref_id, fork_id)?;
        self.dispatch(dst, user_accept);
        Ok(Message::fork_accept(fork_id))
    }

    /// Forking user-side: the owner's `FORK_ACCEPT` reached this node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn finish_fork_request(&self, fork_id: ForkId) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        state
            .pending_fork_requests
            .remove(&fork_id)
            .map(|_| ())
            .ok_or(Error::NoPendingForkRequest(fork_id))
    }

    /// New-user-side: `USER_ACCEPT` reached this node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn finish_user_rref(&self, rref_id: RRefId, fork_id: ForkId) -> Result<(), Error> {
        let _ = rref_id;
        let mut state = self.inner.state.lock();
        if state.pending_users.remove(&fork_id).is_some() {
            return Ok(());
        }
        if state.pending_accepted_users.insert(fork_id) {
            Ok(())
        } else {
            Err(Error::DuplicateAcceptedUser(fork_id))
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn add_fork_of_owner(&self, rref_id: RRefId, fork_id: ForkId) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        let inserted = state.forks.entry(rref_id).or_default().insert(fork_id);
        if inserted {
            Ok(())
        } else {
            Err(Error::DuplicateFork { rref_id, fork_id })
        }
    }

    /// Removes `fork_id` from `forks[rref_id]`; when the set becomes empty,
    /// drops both the `forks` entry and the `owners` entry -- the terminal
    /// event releasing the underlying owned object. Erases `fork_id`, not
    /// `rref_id`, resolving the spec's noted `erase(rrefId)` vs.
    /// `erase(forkId)` ambiguity in favour of the documented invariant (§3.4).
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn del_fork_of_owner(&self, rref_id: RRefId, fork_id: ForkId) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        let empty = {
            let set = state
                .forks
                .get_mut(&rref_id)
                .ok_or(Error::UnknownFork { rref_id, fork_id })?;
            if !set.remove(&fork_id) {
                return Err(Error::UnknownFork { rref_id, fork_id });
            }
            set.is_empty()
        };
        if empty {
            state.forks.remove(&rref_id);
            state.owners.remove(&rref_id);
            tracing::debug!(%rref_id, "owner released: no live forks remain");
        }
        Ok(())
    }

    /// Construct a `User` for a reference owned by `owner`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn create_user(&self, owner: WorkerId, rref_id: RRefId, fork_id: ForkId) -> Result<Arc<User>, Error> {
        if owner == self.inner.self_worker {
            return Err(Error::SelfOwner);
        }
        let mut state = self.inner.state.lock();
        if state.pending_users.contains_key(&fork_id) {
            return Err(Error::DuplicatePendingUser(fork_id));
        }
        let user = Arc::new(User::new(rref_id, fork_id, owner));
        if !state.pending_accepted_users.remove(&fork_id) {
            state.pending_users.insert(fork_id, user.clone());
        }
        Ok(user)
    }

    /// Shorthand: mint a fresh `rref_id`/`fork_id` pair and construct a User
    /// for it. Used when this node is originating the reference to a remote
    /// owner, rather than learning of an existing one.
    pub fn create_user_fresh(&self, owner: WorkerId) -> Result<Arc<User>, Error> {
        let rref_id = self.inner.alloc.next_rref_id();
        let fork_id = self.inner.alloc.next_fork_id();
        self.create_user(owner, rref_id, fork_id)
    }

    /// Create a new owned reference with `value`, registering it in `owners`.
    pub fn own(&self, value: V) -> Reference<V> {
        let rref_id = self.inner.alloc.next_rref_id();
        let owner = Arc::new(Owner::new(rref_id, Arc::new(value)));
        self.inner.state.lock().owners.insert(rref_id, owner.clone());
        Reference::Owner(owner)
    }
}

impl<A, V> Tracker<A, V>
where
    A: Agent,
    V: Send + Sync + Default + 'static,
{
    /// Returns the existing owner for `rref_id`, or constructs one with a
    /// default value and inserts it. Idempotent: `k` calls return the same
    /// `Owner` and leave exactly one entry in `owners` (testable property 4).
    ///
    /// The spec's `get_or_create_owner(rref_id)` takes no value; since the
    /// payload type system is out of this crate's scope (§1), this resolves
    /// the gap by requiring `V: Default` for the convenience path, while
    /// [`Tracker::own`] remains the entry point for constructing a reference
    /// around an actual value.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn get_or_create_owner(&self, rref_id: RRefId) -> Arc<Owner<V>> {
        self.inner
            .state
            .lock()
            .owners
            .entry(rref_id)
            .or_insert_with(|| Arc::new(Owner::new(rref_id, Arc::new(V::default()))))
            .clone()
    }

    /// Dispatches to [`Tracker::get_or_create_owner`] or [`Tracker::create_user`]
    /// depending on whether `owner` is this worker.
    pub fn get_or_create_rref(
        &self,
        owner: WorkerId,
        rref_id: RRefId,
        fork_id: ForkId,
    ) -> Result<Reference<V>, Error> {
        if owner == self.inner.self_worker {
            Ok(Reference::Owner(self.get_or_create_owner(rref_id)))
        } else {
            Ok(Reference::User(self.create_user(owner, rref_id, fork_id)?))
        }
    }
}

impl<A, V> Tracker<A, V>
where
    A: Agent,
    V: Send + Sync + 'static,
{
    /// Fork `rref` to `dst`, performing whatever cross-node registration and
    /// messaging the three cases of spec §4.3 require, and returning the
    /// descriptor to place on the wire. The reference is also pinned into the
    /// current task's `rref_args` scratch (§4.4) for the duration of the
    /// enclosing RPC.
    #[tracing::instrument(level = "debug", skip(self, rref))]
    pub fn fork_to(&self, rref: &Reference<V>, dst: WorkerId) -> Result<ForkDescriptor, Error> {
        let rref_id = rref.rref_id();
        let owner_worker = rref.owner_worker();

        if dst == owner_worker {
            // Case 1: the callee is the owner itself; it will resolve the
            // descriptor to its own local `Owner` entry. No messaging.
            let descriptor = rref.fork(&self.inner.alloc);
            self.pin(rref);
            return Ok(descriptor);
        }

        if rref.is_owner() {
            return self.fork_to_third_party(rref_id, dst, rref);
        }

        self.fork_user_to_user(rref, rref_id, owner_worker, dst)
    }

    fn fork_to_third_party(
        &self,
        rref_id: RRefId,
        dst: WorkerId,
        rref: &Reference<V>,
    ) -> Result<ForkDescriptor, Error> {
        let new_fork_id = self.inner.alloc.next_fork_id();
        let user_accept = self.accept_user_rref(rref_id, new_fork_id)?;
        self.dispatch(dst, user_accept);
        self.pin(rref);
        Ok(ForkDescriptor {
            rref_id,
            fork_id: new_fork_id,
            parent: self.inner.self_worker,
        })
    }

    fn fork_user_to_user(
        &self,
        rref: &Reference<V>,
        rref_id: RRefId,
        owner_worker: WorkerId,
        dst: WorkerId,
    ) -> Result<ForkDescriptor, Error> {
        let user = match rref {
            Reference::User(u) => u.clone(),
            Reference::Owner(_) => unreachable!("owner case handled by fork_to_third_party"),
        };
        let new_fork_id = self.inner.alloc.next_fork_id();
        self.inner
            .state
            .lock()
            .pending_fork_requests
            .insert(new_fork_id, user);
        self.pin(rref);

        let this = self.clone();
        self.spawn_reply(
            owner_worker,
            Message::fork_notify(rref_id, new_fork_id, dst),
            move |reply| async move {
                match reply {
                    Ok(Message::ForkAccept { fork_id }) if fork_id == new_fork_id => {
                        if let Err(e) = this.finish_fork_request(fork_id) {
                            tracing::error!(error = %e, %fork_id, "finish_fork_request");
                        }
                    },
                    Ok(_) => tracing::warn!(%new_fork_id, "unexpected reply to FORK_NOTIFY"),
                    Err(e) => tracing::error!(
                        error = %e,
                        %new_fork_id,
                        "FORK_NOTIFY send failed; fork request left pinned"
                    ),
                }
            },
        );
        Ok(ForkDescriptor {
            rref_id,
            fork_id: new_fork_id,
            parent: self.inner.self_worker,
        })
    }

    fn pin(&self, rref: &Reference<V>) {
        let pinned = match rref {
            Reference::Owner(o) => erase(o.clone()),
            Reference::User(u) => erase(u.clone()),
        };
        pin::push(pinned);
    }

    /// Dispatch an incoming message, producing the reply (if any) the
    /// embedding agent should send back to the sender. `FORK_NOTIFY`'s reply
    /// is computed synchronously; its side-effect (sending `USER_ACCEPT` to
    /// the new user) is dispatched as a detached task.
    #[tracing::instrument(level = "debug", skip(self, msg))]
    pub fn handle_message(&self, from: WorkerId, msg: Message) -> Result<Option<Message>, Error> {
        match msg {
            Message::UserAccept { rref_id, fork_id } => {
                self.finish_user_rref(rref_id, fork_id)?;
                Ok(None)
            },
            Message::ForkNotify {
                rref_id,
                fork_id,
                fork_dst,
            } => Ok(Some(self.accept_fork_request(rref_id, fork_id, fork_dst)?)),
            Message::ForkAccept { fork_id } => {
                self.finish_fork_request(fork_id)?;
                Ok(None)
            },
            Message::UserDelete { rref_id, fork_id } => {
                self.del_fork_of_owner(rref_id, fork_id)?;
                Ok(None)
            },
            Message::Exception { reason } => {
                tracing::warn!(worker = %from, %reason, "remote exception");
                Err(Error::Remote { worker: from, reason })
            },
        }
    }

    /// Move the current task's pinned `rref_args` into `pending_rref_args[message_id]`.
    pub fn add_rref_args(&self, message_id: i64) {
        self.inner.state.lock().pending_rref_args.move_in(message_id);
    }

    /// Release the pinned references for `message_id` once the callee has
    /// acked processing of it.
    pub fn del_rref_args(&self, message_id: i64) -> Result<(), Error> {
        self.inner.state.lock().pending_rref_args.release(message_id)
    }

    /// Local teardown entry point (spec §4.3 `delete_user`, §9 design notes):
    /// called by the embedding application once its own reference counting
    /// determines `user` has no more external holders. Checks that neither
    /// `pending_users` nor any `pending_fork_requests` entry still pins
    /// `user`, per the non-FIFO rationale in §4.3; if either does, returns
    /// [`Error::UserStillPinned`] rather than sending `USER_DELETE` early.
    #[tracing::instrument(level = "debug", skip(self, user))]
    pub fn delete_user(&self, user: &Arc<User>) -> Result<(), Error> {
        {
            let state = self.inner.state.lock();
            if state.pending_users.contains_key(&user.fork_id()) {
                return Err(Error::UserStillPinned(user.fork_id()));
            }
            if state
                .pending_fork_requests
                .values()
                .any(|pinned| Arc::ptr_eq(pinned, user))
            {
                return Err(Error::UserStillPinned(user.fork_id()));
            }
        }
        self.dispatch(user.owner(), Message::user_delete(user.rref_id(), user.fork_id()));
        Ok(())
    }
}


/// Randomised checks for the quantified invariants of testable properties
/// 2, 4, 5 and 6. Property 1 and 3 (global drain-to-empty, full round-trip
/// across two nodes) are covered end-to-end instead, in `tests/scenarios.rs`,
/// since they are naturally expressed against the public API across several
/// workers rather than against this module's private tables.
#[cfg(test)]
mod proptests {
    use super::*;
    use crate::agent::Agent;
    use async_trait::async_trait;
    use proptest::prelude::*;

    struct NullAgent;

    #[async_trait]
    impl Agent for NullAgent {
        async fn send(&self, _destination: WorkerId, _message: Message) -> Result<Message, Error> {
            Ok(Message::exception("unused in proptests"))
        }

        fn worker_info(&self, id: WorkerId) -> WorkerInfo {
            WorkerInfo {
                id,
                name: format!("worker-{}", id.0),
            }
        }

        fn self_worker(&self) -> WorkerInfo {
            self.worker_info(WorkerId(0))
        }
    }

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().build().unwrap()
    }

    proptest! {
        // Property 4: k calls to `get_or_create_owner` return the same Owner
        // and leave exactly one entry in `owners`.
        #[test]
        fn get_or_create_owner_is_idempotent_for_k_calls(k in 1usize..20) {
            let tracker = rt().block_on(async { Tracker::new(WorkerId(0), NullAgent).unwrap() });
            let rref_id = tracker.inner.alloc.next_rref_id();
            let first = tracker.get_or_create_owner(rref_id);
            for _ in 1..k {
                let again = tracker.get_or_create_owner(rref_id);
                prop_assert!(Arc::ptr_eq(&first, &again));
            }
            prop_assert_eq!(tracker.inner.state.lock().owners.len(), 1);
        }

        // Property 5: no rref_id/fork_id is ever reused, and local_id is
        // monotonic per worker, for any interleaving of the two mint calls.
        #[test]
        fn identifiers_are_never_reused(calls in proptest::collection::vec(any::<bool>(), 1..200)) {
            let alloc = IdAllocator::new(WorkerId(3));
            let mut seen = std::collections::HashSet::new();
            let mut last = None;
            for mint_fork in calls {
                let local_id = if mint_fork {
                    alloc.next_fork_id().local_id
                } else {
                    alloc.next_rref_id().local_id
                };
                prop_assert!(seen.insert(local_id));
                if let Some(prev) = last {
                    prop_assert!(local_id > prev);
                }
                last = Some(local_id);
            }
        }

        // Property 2: pending_users and pending_accepted_users never both
        // hold the same fork_id, for any ordering of create/accept.
        #[test]
        fn pending_tables_are_mutually_exclusive(ops in proptest::collection::vec(any::<bool>(), 1..30)) {
            let tracker = rt().block_on(async { Tracker::new(WorkerId(0), NullAgent).unwrap() });
            for (i, accept_first) in ops.into_iter().enumerate() {
                let rref_id = RRefId { worker_id: WorkerId(1), local_id: i as u64 };
                let fork_id = ForkId { worker_id: WorkerId(0), local_id: i as u64 };
                if accept_first {
                    let _ = tracker.finish_user_rref(rref_id, fork_id);
                    let _ = tracker.create_user(WorkerId(1), rref_id, fork_id);
                } else {
                    let _ = tracker.create_user(WorkerId(1), rref_id, fork_id);
                    let _ = tracker.finish_user_rref(rref_id, fork_id);
                }
                let state = tracker.inner.state.lock();
                let in_pending = state.pending_users.contains_key(&fork_id);
                let in_accepted = state.pending_accepted_users.contains(&fork_id);
                prop_assert!(!(in_pending && in_accepted));
            }
        }

        // Property 6: every reference pinned during a message's preparation
        // stays reachable from `pending_rref_args[message_id]` until release.
        #[test]
        fn pinned_args_survive_until_release(n in 1usize..10, message_id in 0i64..1000) {
            let mut pending = PendingArgs::new();
            rt().block_on(pin::with_scratch(async {
                for i in 0..n {
                    pin::push(Arc::new(i));
                }
                pending.move_in(message_id);
            }));
            prop_assert_eq!(pending.len_for(message_id), n);
            prop_assert!(pending.release(message_id).is_ok());
            prop_assert_eq!(pending.len_for(message_id), 0);
        }
    }
}
