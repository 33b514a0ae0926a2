//! Webfleet control plane.
//!
//! This crate is the orchestration layer of the hosting fleet. It owns:
//!
//! - **Configuration**: one immutable [`WebfleetConfig`] loaded at
//!   startup and injected into every component.
//! - **Orchestrators**: the multi-step provisioning, destruction,
//!   static-provisioning, and domain-attachment transactions, each
//!   delegating every side effect to the `webfleet-infra` capability
//!   traits and every state change to the `webfleet-state` store.
//! - **Worker**: the single polling scheduler that drains the job queue:
//!   claim, execute, complete or retry, with crash recovery on startup.
//! - **API**: the authenticated HTTP surface that validates requests,
//!   enqueues jobs, and exposes stored state enriched with live
//!   infrastructure probes.
//!
//! Ordering and uniqueness guarantees live in the state store; nothing in
//! this crate holds an in-process lock around business logic.

#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod probes;
pub mod render;
pub mod service;
pub mod worker;

pub use config::WebfleetConfig;
pub use error::{ControlError, ControlResult};
pub use orchestrator::{DomainManager, Destroyer, Provisioner, SiteKind, StaticProvisioner};
pub use service::SiteService;
pub use worker::Worker;
