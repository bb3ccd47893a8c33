// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Wire messages exchanged between fork-tracking cores.
//!
//! Encoding is delegated to `minicbor`, matching the rest of this workspace's
//! wire types (cf. `librad::net::protocol::broadcast::Message`). This module
//! only describes the schema; actual framing and transport are the agent's
//! concern (see [`crate::agent`]).

use crate::ident::{ForkId, RRefId, WorkerId};

#[derive(Clone, Debug, PartialEq, minicbor::Encode, minicbor::Decode)]
pub enum Message {
    /// Sent by the owner to a new user, registering the fork at the owner
    /// and informing the recipient that it may now consider its `User`
    /// acknowledged.
    #[n(0)]
    #[cbor(array)]
    UserAccept {
        #[n(0)]
        rref_id: RRefId,
        #[n(1)]
        fork_id: ForkId,
    },

    /// Sent by a user forking to another user, notifying the owner that a
    /// new fork should be registered on behalf of `fork_dst`.
    #[n(1)]
    #[cbor(array)]
    ForkNotify {
        #[n(0)]
        rref_id: RRefId,
        #[n(1)]
        fork_id: ForkId,
        #[n(2)]
        fork_dst: WorkerId,
    },

    /// Sent by the owner back to the forking user once the child fork has
    /// been registered and `UserAccept` has been dispatched to the child.
    #[n(2)]
    #[cbor(array)]
    ForkAccept {
        #[n(0)]
        fork_id: ForkId,
    },

    /// Sent by a user to the owner when its last strong ref is dropped.
    #[n(3)]
    #[cbor(array)]
    UserDelete {
        #[n(0)]
        rref_id: RRefId,
        #[n(1)]
        fork_id: ForkId,
    },

    /// An error reply in place of any of the above.
    #[n(4)]
    #[cbor(array)]
    Exception {
        #[n(0)]
        reason: String,
    },
}

impl Message {
    pub fn user_accept(rref_id: RRefId, fork_id: ForkId) -> Self {
        Message::UserAccept { rref_id, fork_id }
    }

    pub fn fork_notify(rref_id: RRefId, fork_id: ForkId, fork_dst: WorkerId) -> Self {
        Message::ForkNotify {
            rref_id,
            fork_id,
            fork_dst,
        }
    }

    pub fn fork_accept(fork_id: ForkId) -> Self {
        Message::ForkAccept { fork_id }
    }

    pub fn user_delete(rref_id: RRefId, fork_id: ForkId) -> Self {
        Message::UserDelete { rref_id, fork_id }
    }

    pub fn exception(reason: impl Into<String>) -> Self {
        Message::Exception {
            reason: reason.into(),
        }
    }

    /// `true` if this message expects no structured reply from its
    /// recipient: the sender dispatches it and moves on, rather than
    /// awaiting and pattern-matching a specific reply variant. `UserAccept`
    /// and `UserDelete` are the two messages this crate's tracker dispatches
    /// this way (see `Tracker::dispatch`); `ForkNotify` is not, since its
    /// sender awaits a `ForkAccept` reply (see `Tracker::spawn_reply`).
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, Message::UserAccept { .. } | Message::UserDelete { .. })
    }
}
