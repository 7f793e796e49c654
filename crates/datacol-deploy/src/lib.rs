//! datacol-deploy — converging workloads onto the cluster.
//!
//! The [`Deployer`] takes a `DeployRequest` and makes the cluster match it:
//! namespace, Deployment, Service, shared ingress rules, then blocks until
//! the rollout is healthy or diagnosably failed.
//!
//! # Components
//!
//! - **`builder`** — pod template construction (container, probes, sidecar)
//! - **`deployer`** — the get-or-create/patch reconciliation itself
//! - **`rollout`** — generation and readiness waits with failure diagnosis
//! - **`pod`** — pod listing, event inspection, derived pod status
//! - **`app`** — app-level operations built on the reconciler (scale,
//!   env updates, deletion, endpoint lookup, limit updates)

pub mod app;
pub mod builder;
pub mod deployer;
pub mod pod;
pub mod rollout;

pub use app::{delete_app, process_limits, scale, service_endpoint, set_env};
pub use deployer::Deployer;
