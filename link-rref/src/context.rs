// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Process-wide tracker lifecycle (spec §4.6).
//!
//! A single node process runs exactly one fork-tracking core for a given
//! `(Agent, payload)` pair. [`Tracker`] is generic, but a `static` item
//! cannot be -- the same limitation that pushed argument pinning onto
//! `task_local!` in [`crate::pin`] -- so the instance is stored behind one
//! type-erased [`OnceCell`], downcast back to the caller's concrete
//! `Tracker<A, V>` on lookup.

use std::any::Any;

use once_cell::sync::OnceCell;

use crate::{agent::Agent, error::Error, ident::WorkerId, tracker::Tracker};

static INSTANCE: OnceCell<Box<dyn Any + Send + Sync>> = OnceCell::new();

/// Construct the process-wide tracker and install it as the singleton.
/// Fails with [`Error::AlreadyInitialized`] if called more than once
/// (regardless of `A`/`V`, since only one instance can live behind the cell
/// at a time), or with whatever [`Tracker::new`] fails with otherwise.
pub fn init<A, V>(self_worker: WorkerId, agent: A) -> Result<Tracker<A, V>, Error>
where
    A: Agent,
    V: Send + Sync + 'static,
{
    let tracker = Tracker::new(self_worker, agent)?;
    INSTANCE
        .set(Box::new(tracker.clone()))
        .map_err(|_| Error::AlreadyInitialized)?;
    Ok(tracker)
}

/// Fetch the process-wide tracker, downcasting it to `Tracker<A, V>`.
/// Returns [`Error::NotInitialized`] both when [`init`] has not been called
/// yet and when it was called with different `A`/`V` type parameters --
/// from the caller's perspective the two are indistinguishable: there is no
/// tracker of the type it asked for.
pub fn instance<A, V>() -> Result<Tracker<A, V>, Error>
where
    A: Agent,
    V: Send + Sync + 'static,
{
    INSTANCE
        .get()
        .ok_or(Error::NotInitialized)?
        .downcast_ref::<Tracker<A, V>>()
        .cloned()
        .ok_or(Error::NotInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{agent::WorkerInfo, message::Message};
    use async_trait::async_trait;

    struct NullAgent;

    #[async_trait]
    impl Agent for NullAgent {
        async fn send(&self, _destination: WorkerId, _message: Message) -> Result<Message, Error> {
            Ok(Message::exception("unreachable in this test"))
        }

        fn worker_info(&self, id: WorkerId) -> WorkerInfo {
            WorkerInfo {
                id,
                name: "null".into(),
            }
        }

        fn self_worker(&self) -> WorkerInfo {
            self.worker_info(WorkerId(0))
        }
    }

    // Exercises the full lifecycle in a single test: the singleton is a
    // genuine process-wide global, so splitting this across multiple
    // `#[test]` functions would race against the default parallel test
    // runner.
    #[tokio::test]
    async fn lifecycle() {
        assert!(matches!(
            instance::<NullAgent, u32>(),
            Err(Error::NotInitialized)
        ));

        let first = init::<NullAgent, u32>(WorkerId(0), NullAgent).unwrap();
        assert_eq!(first.self_worker(), WorkerId(0));

        assert!(matches!(
            init::<NullAgent, u32>(WorkerId(1), NullAgent),
            Err(Error::AlreadyInitialized)
        ));

        let fetched = instance::<NullAgent, u32>().unwrap();
        assert_eq!(fetched.self_worker(), first.self_worker());
    }
}
