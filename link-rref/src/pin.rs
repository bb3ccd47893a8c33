// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Argument pinning registry (spec §4.4).
//!
//! The outgoing wire message holds only a [`crate::rref::ForkDescriptor`],
//! not a strong ref. Without pinning, a caller-side destructor racing the
//! in-flight message could delete the owner before the callee constructs its
//! user. This module keeps the strong refs alive from the moment a reference
//! is used as an RPC argument until the callee acks the enclosing message.
//!
//! The per-call scratch (`rref_args`) is *task*-local and lock-free, per §5.
//! It is task-local rather than thread-local: call preparation in this
//! codebase is `async` and may suspend across `.await` points, which a
//! `thread_local!` would silently get wrong (see DESIGN.md). The durable
//! per-message table (`pending_rref_args`) is, per §5, protected by the same
//! single mutex as the rest of the tracker's state -- see
//! [`crate::tracker::State`], which embeds [`PendingArgs`] directly rather
//! than giving it its own lock.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Error;

/// A type-erased strong ref to a pinned reference object ([`crate::rref::Owner<V>`]
/// or [`crate::rref::User`] for some `V`). Pinning only needs to keep the
/// value alive, not inspect it, so erasing `V` lets the registry be shared
/// across every payload type the tracker is monomorphized over.
pub type Pinned = Arc<dyn Send + Sync + 'static>;

tokio::task_local! {
    static RREF_ARGS: RefCell<Vec<Pinned>>;
}

/// Run `fut` with a fresh, empty `rref_args` scratch list in scope. All RPC
/// call-preparation code must run inside this scope for pinning to take
/// effect.
pub async fn with_scratch<F, T>(fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    RREF_ARGS.scope(RefCell::new(Vec::new()), fut).await
}

/// Push a reference onto the current task's scratch list. A no-op (with a
/// debug log) outside of [`with_scratch`] -- that indicates call-preparation
/// code running without the expected task-local context, which is a bug in
/// the embedding application, not in the tracker.
pub fn push(r: Pinned) {
    let pushed = RREF_ARGS.try_with(|scratch| scratch.borrow_mut().push(r)).is_ok();
    if !pushed {
        tracing::debug!("rref_args pushed outside of an rref call-preparation scope");
    }
}

fn take_scratch() -> Vec<Pinned> {
    RREF_ARGS
        .try_with(|scratch| scratch.borrow_mut().drain(..).collect::<Vec<_>>())
        .unwrap_or_default()
}

/// The `pending_rref_args` table: mapping an in-flight RPC's message id to
/// the list of references pinned during its preparation. Plain data, mutated
/// only while the caller holds the tracker's mutex.
#[derive(Default)]
pub struct PendingArgs {
    inner: HashMap<i64, Vec<Pinned>>,
}

impl PendingArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically move the current task's scratch list into
    /// `pending_rref_args[message_id]`, clearing the scratch.
    pub fn move_in(&mut self, message_id: i64) {
        let taken = take_scratch();
        if taken.is_empty() {
            return;
        }
        self.inner.entry(message_id).or_default().extend(taken);
    }

    /// Drop the pinned references for `message_id`, releasing the strong
    /// refs. Called once the callee has acked processing of the message.
    pub fn release(&mut self, message_id: i64) -> Result<(), Error> {
        self.inner
            .remove(&message_id)
            .map(|_| ())
            .ok_or(Error::NoPendingArgs(message_id))
    }

    #[cfg(test)]
    pub fn len_for(&self, message_id: i64) -> usize {
        self.inner.get(&message_id).map(|v| v.len()).unwrap_or(0)
    }
}
