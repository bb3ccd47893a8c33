// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// A worker in the cluster, identified by a small integer.
///
/// Distinct from [`crate::agent::WorkerInfo`], which additionally carries a
/// human-readable name: this is the wire-level identity used as the first
/// component of every [`RRefId`] and [`ForkId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode)]
#[cbor(transparent)]
pub struct WorkerId(#[n(0)] pub u16);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker:{}", self.0)
    }
}

/// Structurally identical to [`ForkId`]: a globally unique identifier minted
/// by the [`IdAllocator`] of the worker that owns the referent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
#[cbor(array)]
pub struct RRefId {
    #[n(0)]
    pub worker_id: WorkerId,
    #[n(1)]
    pub local_id: u64,
}

impl fmt::Display for RRefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rref:{}:{}", self.worker_id.0, self.local_id)
    }
}

/// Identifies a single fork (i.e. a single User reference) of an [`RRefId`].
/// Minted by the same allocator and with the same shape as `RRefId`, but the
/// two are never interchangeable: a `ForkId` always denotes *one particular*
/// holder, while an `RRefId` denotes the referent itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
#[cbor(array)]
pub struct ForkId {
    #[n(0)]
    pub worker_id: WorkerId,
    #[n(1)]
    pub local_id: u64,
}

impl fmt::Display for ForkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fork:{}:{}", self.worker_id.0, self.local_id)
    }
}

/// Mints [`RRefId`]s and [`ForkId`]s for a single worker.
///
/// `local_id` is a 64-bit counter, so wraparound is out of scope (see the
/// identifier allocator's scope note). The counter is accessed without the
/// tracker's mutex -- it is independent of all other tracker state.
pub struct IdAllocator {
    worker_id: WorkerId,
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            next: AtomicU64::new(0),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn next_local(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_rref_id(&self) -> RRefId {
        RRefId {
            worker_id: self.worker_id,
            local_id: self.next_local(),
        }
    }

    pub fn next_fork_id(&self) -> ForkId {
        ForkId {
            worker_id: self.worker_id,
            local_id: self.next_local(),
        }
    }
}
