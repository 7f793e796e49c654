//! datacol-ingress — the shared ingress of a stack.
//!
//! Every app in a namespace routes through one Ingress object named
//! `<namespace>-ing`. An app's reconciliation contributes only its own
//! rules; the merge is non-destructive to rules owned by co-tenant apps.
//!
//! # Components
//!
//! - **`merge`** — rule manifests and the per-app rule merge algorithm
//! - **`update`** — get-or-create plus a bounded retry-on-conflict update loop
//! - **`tls`** — TLS certificate attachment and the backing secrets
//! - **`controller`** — nginx ingress-controller bootstrap for providers
//!   without a managed one

pub mod controller;
pub mod merge;
pub mod tls;
pub mod update;

pub use merge::{app_ingress, ingress_rules_manifest, merge_ingress_rules};
pub use tls::{delete_tls_certificate, update_tls_certificate};
pub use update::reconcile_ingress;
