// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Reference objects: the two variants ([`Owner`], [`User`]) held in the
//! tracker's tables, and the sum type ([`Reference`]) the application deals
//! with. Neither variant mutates tracker state on its own -- `fork()` only
//! mints an identifier and describes the fork; registering it is the
//! fork-tracking core's job (see [`crate::tracker::Tracker::fork_to`]).

use std::sync::Arc;

use crate::ident::{ForkId, IdAllocator, RRefId, WorkerId};

/// The authoritative holder of a value on this worker.
///
/// `V` is the payload type; this crate is payload-agnostic (the payload type
/// system -- values vs. scripting-language objects -- lives outside this
/// crate, see spec §1/§9). A `V` that is itself a future-of-a-value is the
/// embedding application's concern: `Owner` just holds whatever `V` is handed
/// to it at construction.
#[derive(Debug)]
pub struct Owner<V> {
    rref_id: RRefId,
    value: Arc<V>,
}

impl<V> Owner<V> {
    pub fn new(rref_id: RRefId, value: Arc<V>) -> Self {
        Self { rref_id, value }
    }

    pub fn rref_id(&self) -> RRefId {
        self.rref_id
    }

    /// An owner's implicit fork id equals its `rref_id` (same bit pattern).
    pub fn fork_id(&self) -> ForkId {
        ForkId {
            worker_id: self.rref_id.worker_id,
            local_id: self.rref_id.local_id,
        }
    }

    pub fn value(&self) -> &Arc<V> {
        &self.value
    }
}

/// A remote handle to an object owned by `owner`.
#[derive(Debug)]
pub struct User {
    rref_id: RRefId,
    fork_id: ForkId,
    owner: WorkerId,
}

impl User {
    pub fn new(rref_id: RRefId, fork_id: ForkId, owner: WorkerId) -> Self {
        Self {
            rref_id,
            fork_id,
            owner,
        }
    }

    pub fn rref_id(&self) -> RRefId {
        self.rref_id
    }

    pub fn fork_id(&self) -> ForkId {
        self.fork_id
    }

    pub fn owner(&self) -> WorkerId {
        self.owner
    }
}

/// A descriptor for a forked reference, suitable for placing on the wire as
/// an RPC argument. Producing one does not by itself register anything with
/// the fork-tracking core -- see `Tracker::fork_to`, which both produces this
/// descriptor and performs the associated bookkeeping/messaging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
#[cbor(array)]
pub struct ForkDescriptor {
    #[n(0)]
    pub rref_id: RRefId,
    #[n(1)]
    pub fork_id: ForkId,
    #[n(2)]
    pub parent: WorkerId,
}

/// The sum type the application deals with: either this worker's own
/// [`Owner`], or a [`User`] handle to something owned elsewhere.
pub enum Reference<V> {
    Owner(Arc<Owner<V>>),
    User(Arc<User>),
}

// Written by hand rather than derived: `#[derive(Clone)]` would add a
// spurious `V: Clone` bound even though only the `Arc`s are ever cloned.
impl<V> Clone for Reference<V> {
    fn clone(&self) -> Self {
        match self {
            Reference::Owner(o) => Reference::Owner(Arc::clone(o)),
            Reference::User(u) => Reference::User(Arc::clone(u)),
        }
    }
}

impl<V> Reference<V> {
    pub fn is_owner(&self) -> bool {
        matches!(self, Reference::Owner(_))
    }

    pub fn rref_id(&self) -> RRefId {
        match self {
            Reference::Owner(o) => o.rref_id(),
            Reference::User(u) => u.rref_id(),
        }
    }

    pub fn fork_id(&self) -> ForkId {
        match self {
            Reference::Owner(o) => o.fork_id(),
            Reference::User(u) => u.fork_id(),
        }
    }

    /// The worker that owns this reference's referent.
    pub fn owner_worker(&self) -> WorkerId {
        match self {
            Reference::Owner(o) => o.rref_id().worker_id,
            Reference::User(u) => u.owner(),
        }
    }

    /// Mint a fresh fork id for `self` and describe the resulting fork.
    /// Does not mutate any tracker state.
    pub fn fork(&self, alloc: &IdAllocator) -> ForkDescriptor {
        ForkDescriptor {
            rref_id: self.rref_id(),
            fork_id: alloc.next_fork_id(),
            parent: alloc.worker_id(),
        }
    }
}
