// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! The agent facade: a thin adapter over the RPC transport, consumed by the
//! fork-tracking core. The transport itself -- connection management, wire
//! framing, method dispatch -- lives outside this crate; `Agent` describes
//! only the two operations the tracker needs from it.

use std::fmt;

use async_trait::async_trait;

use crate::{error::Error, ident::WorkerId, message::Message};

/// Identity and addressing information for a worker, as handed out by the
/// agent. Analogous to `librad::net::protocol::info::PeerInfo`, but scoped to
/// what the tracker needs: an id and a human-readable name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub name: String,
}

impl fmt::Display for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Ambient configuration for an [`Agent`] implementation, in the same shape as
/// `net::protocol::config` types elsewhere in this workspace.
///
/// `link-rref` does not construct one of these for itself -- the RPC
/// transport is an external collaborator (see the module-level docs) -- but
/// every `Agent` impl, including the simulated-cluster harness in
/// `tests/scenarios.rs`, takes one programmatically. No file/CLI config
/// surface is in scope for this crate; this struct is how an embedding
/// application wires its own config loader in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Capacity of the per-node-pair channel an `Agent` uses to relay
    /// messages between workers.
    pub channel_buffer: usize,
    /// Override the ambient `tracing` level for this agent; `None` defers to
    /// whatever subscriber the embedding process has already installed.
    pub tracing_level: Option<tracing::Level>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel_buffer: 16,
            tracing_level: None,
        }
    }
}

/// Adapter over the RPC agent.
///
/// The spec describes `send` as returning a future with an `on_reply`
/// callback; in an async/await codebase that is simply an `async fn`, and
/// "register a callback on the future" becomes "spawn a task that awaits the
/// future and re-enters the tracker" (see `Tracker::spawn_reply`). Agent
/// implementations are free to deliver replies out of order across distinct
/// `send` calls -- see §5 of the design for why the tracker does not assume
/// otherwise.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Send `message` to `destination` and await its reply.
    async fn send(&self, destination: WorkerId, message: Message) -> Result<Message, Error>;

    /// Look up routing/display information for a worker.
    fn worker_info(&self, id: WorkerId) -> WorkerInfo;

    /// This node's own worker identity.
    fn self_worker(&self) -> WorkerInfo;
}
