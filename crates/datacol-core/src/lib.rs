//! datacol-core — the shared vocabulary of the deployment engine.
//!
//! This crate holds everything the higher layers agree on:
//!
//! - **`types`** — `DeployRequest`/`DeployResponse`, the process read model,
//!   and the object-naming and labelling conventions that form the de-facto
//!   contract with the cluster
//! - **`provider`** — the cloud provider capability table (ingress path
//!   syntax, class annotation, controller bootstrap)
//! - **`resources`** — Kubernetes quantity parsing and the
//!   limit/request constraint merger
//! - **`config`** — engine configuration (poll budgets, timeouts)
//! - **`error`** — the error taxonomy shared by all engine crates

pub mod config;
pub mod error;
pub mod provider;
pub mod resources;
pub mod types;

pub use config::{EngineConfig, LogBudget, RolloutBudget, RunBudget};
pub use error::{Error, Result, is_already_exists, is_conflict, is_not_found};
pub use provider::Provider;
pub use types::{DeployRequest, DeployResponse, Heartbeat, Process};
