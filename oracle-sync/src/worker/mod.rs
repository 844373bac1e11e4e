// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Periodic per-chain jobs with at most one execution per chain in flight.

mod lock;
mod queue;
mod scheduler;
mod singleton;

pub use lock::{DistributedLock, InMemoryLock, PgLock};
pub use queue::{InMemoryJobQueue, Job, JobQueue};
pub use scheduler::Scheduler;
pub use singleton::{JobHandler, JobOutcome, SingletonWorker};
