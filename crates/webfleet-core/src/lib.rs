//! Core rules shared by every webfleet component.
//!
//! This crate holds the two things that must never disagree between the
//! state store, the orchestrators, and the reconciliation probes:
//!
//! - **Naming**: every infrastructure resource name (database, user,
//!   volume, containers, edge snippet, default domain) derives from the
//!   site identifier through [`naming`]. No other module concatenates
//!   resource names.
//! - **Lifecycle**: the [`lifecycle::SiteStatus`] state machine with its
//!   validated transition matrix, plus site-name and custom-domain format
//!   validation.
//!
//! Everything here is pure and synchronous; no I/O.

#![forbid(unsafe_code)]

pub mod lifecycle;
pub mod naming;

pub use lifecycle::{SiteStatus, ValidationError};
