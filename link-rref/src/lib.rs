// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Distributed reference counting for objects shared across the nodes of a
//! peer-to-peer RPC cluster, tolerant of out-of-order message delivery.
//!
//! [`tracker::Tracker`] is the fork-tracking core; [`rref::Reference`] is the
//! handle application code holds onto. [`context`] provides an optional
//! process-wide singleton for embedders that want one tracker per process
//! rather than threading a `Tracker` through explicitly.

pub mod agent;
pub mod context;
pub mod error;
pub mod ident;
pub mod message;
pub mod pin;
pub mod rref;
pub mod tracker;

pub use agent::{Agent, Config, WorkerInfo};
pub use error::Error;
pub use ident::{ForkId, IdAllocator, RRefId, WorkerId};
pub use message::Message;
pub use rref::{ForkDescriptor, Owner, Reference, User};
pub use tracker::Tracker;
