//! Durable state for the webfleet control plane.
//!
//! Two tables back the whole system: `sites` (lifecycle state, one row per
//! tenant) and `jobs` (the durable retry-aware work queue). This crate
//! exposes them behind the [`StateStore`] trait with two implementations:
//!
//! - [`MySqlStore`]: the production MariaDB store. Job claiming uses
//!   `FOR UPDATE SKIP LOCKED` row locking so concurrent workers never
//!   contend for the same job; lifecycle transitions are read-modify-write
//!   inside one transaction so concurrent movers of the same site produce
//!   one winner.
//! - [`MemoryStore`]: an in-memory store with identical semantics for
//!   tests.
//!
//! All lifecycle changes go through the transition matrix in
//! `webfleet-core`; the store is the enforcement point, not just a record.

#![forbid(unsafe_code)]

mod error;
mod memory;
mod mysql;
mod store;
pub mod types;

pub use error::{StateError, StateResult};
pub use memory::MemoryStore;
pub use mysql::MySqlStore;
pub use store::StateStore;
pub use types::{JobKind, JobRecord, JobStatus, SiteRecord};
