// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod memory;
pub mod models;
pub mod pg;
pub mod schema;
pub mod store;

pub use memory::InMemoryStore;
pub use models::*;
pub use pg::PgStore;
pub use store::{InsertOutcome, MappingStore, OracleStore, StoreError, StoreResult};
