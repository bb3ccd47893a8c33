// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use thiserror::Error;

use crate::ident::{ForkId, RRefId, WorkerId};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("cannot create a user reference for an owner on this worker")]
    SelfOwner,

    #[error("fork {0} already pending acknowledgement")]
    DuplicatePendingUser(ForkId),

    #[error("fork {0} already marked as accepted before construction")]
    DuplicateAcceptedUser(ForkId),

    #[error("no pending fork request for {0}")]
    NoPendingForkRequest(ForkId),

    #[error("fork {fork_id} not present in forks[{rref_id}]")]
    UnknownFork { rref_id: RRefId, fork_id: ForkId },

    #[error("fork {fork_id} already present in forks[{rref_id}]")]
    DuplicateFork { rref_id: RRefId, fork_id: ForkId },

    #[error("message {0} has no pending rref arguments")]
    NoPendingArgs(i64),

    #[error("user {0} still has outstanding pending acknowledgements")]
    UserStillPinned(ForkId),

    #[error("no ambient async runtime to spawn continuations on")]
    NoAsyncContext,

    #[error("remote exception from {worker}: {reason}")]
    Remote { worker: WorkerId, reason: String },

    #[error("rref tracker already initialized")]
    AlreadyInitialized,

    #[error("rref tracker not initialized")]
    NotInitialized,
}
