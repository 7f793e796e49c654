//! Deploy request model and object-naming conventions.
//!
//! The names and labels produced here are the de-facto contract with the
//! cluster: a Deployment/Service is named by its `service_id`
//! (`<app>-<proctype>`), the shared ingress is derived from the namespace,
//! and every owned object carries the `app`/`type`/`managed-by` labels used
//! for listing and cleanup.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::provider::Provider;

/// Label carrying the application name.
pub const APP_LABEL: &str = "app";
/// Label carrying the process type (web, worker, run, ...).
pub const TYPE_LABEL: &str = "type";
/// Label carrying the release version an object was deployed at.
pub const VERSION_LABEL: &str = "version";
/// Ownership label; objects without it are never touched by the engine.
pub const MANAGED_BY_LABEL: &str = "managed-by";
/// Value of the ownership label.
pub const HERITAGE: &str = "datacol.io";

/// Proctype of ephemeral one-off pods created for `process_run`.
pub const RUN_PROCESS_KIND: &str = "run";

/// Domain used for ingress hosts when an app has no domains of its own.
pub const DEFAULT_INGRESS_DOMAIN: &str = "datacol.io";

/// Optional HTTP health probes attached to the app container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Path probed by the liveness and readiness checks.
    pub path: String,
    /// Seconds before the first liveness probe.
    pub initial_delay_liveness: i32,
    /// Seconds before the first readiness probe.
    pub initial_delay_readiness: i32,
    /// Probe timeout in seconds.
    pub timeout_seconds: i32,
}

/// Desired state for one (app, proctype) workload.
///
/// Immutable per call; the reconciler converges the cluster onto it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Logical application name.
    pub app: String,
    /// Process role within the app: web, worker, cmd, run, or custom.
    pub proctype: String,
    /// Object name for this (app, proctype) pair; see [`service_id`].
    pub service_id: String,
    /// Container image to run.
    pub image: String,
    /// Container entrypoint override (empty = image default).
    pub entrypoint: Vec<String>,
    /// Container arguments.
    pub args: Vec<String>,
    /// Port the container listens on; 0 means not network-exposed.
    pub container_port: i32,
    /// Environment variables (keys unique).
    pub env_vars: BTreeMap<String, String>,
    /// Hostnames routed to this workload; empty means an automatic
    /// load balancer instead of the shared ingress.
    pub domains: Vec<String>,
    /// Desired replica count; `None` leaves the live count untouched.
    pub replicas: Option<i32>,
    /// Add the Cloud SQL proxy sidecar to the pod.
    pub enable_cloudsql_proxy: bool,
    /// Cloud the stack runs on; selects ingress behavior.
    pub provider: Provider,
    /// Stack namespace the workload lives in.
    pub namespace: String,
    /// Release version, recorded as a pod label.
    pub version: String,
    /// CPU constraint, `<limit>` or `<limit>/<request>`.
    pub cpu_req_limit: String,
    /// Memory constraint, `<limit>` or `<limit>/<request>`.
    pub memory_req_limit: String,
    /// Pass-through annotations for owned objects.
    pub tags: BTreeMap<String, String>,
    /// Optional HTTP health probes.
    pub heartbeat: Option<Heartbeat>,
}

/// Outcome of a reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResponse {
    /// The request that was converged.
    pub request: DeployRequest,
    /// Node port allocated to the service; 0 for load-balancer or
    /// unexposed workloads.
    pub node_port: i32,
}

/// Read model for one running process type of an app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub proctype: String,
    /// Desired replica count.
    pub count: i32,
    /// Derived status string (Pending, Running, Failed, ...).
    pub status: String,
    /// Container arguments the process runs with.
    pub command: Vec<String>,
    /// CPU constraint string, `<limit>` or `<limit>/<request>`.
    pub cpu: String,
    /// Memory constraint string.
    pub memory: String,
}

/// Object name for an (app, proctype) pair.
pub fn service_id(app: &str, proctype: &str) -> String {
    format!("{app}-{proctype}")
}

/// Object name for an ephemeral run pod: `<app>-run-<6 random chars>`.
pub fn run_service_id(app: &str) -> String {
    format!("{app}-{RUN_PROCESS_KIND}-{}", random_suffix(6))
}

/// Name of the shared ingress for a namespace.
///
/// Deriving it from the namespace provisions one load balancer per stack;
/// every app in the stack merges its rules into this one object.
pub fn ingress_name(namespace: &str) -> String {
    format!("{namespace}-ing")
}

/// Name of the TLS secret for an (app, domain) pair.
pub fn tls_secret_name(app: &str, domain: &str) -> String {
    format!("{app}-{}", domain.replace('.', "-"))
}

/// Labels identifying objects of an app, without the process type.
pub fn app_labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), app.to_string()),
        (MANAGED_BY_LABEL.to_string(), HERITAGE.to_string()),
    ])
}

/// Labels identifying objects of one (app, proctype) workload.
pub fn process_labels(app: &str, proctype: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), app.to_string()),
        (TYPE_LABEL.to_string(), proctype.to_string()),
        (MANAGED_BY_LABEL.to_string(), HERITAGE.to_string()),
    ])
}

/// Render labels as a list-request label selector.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn random_suffix(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut buf = vec![0u8; len];
    getrandom::getrandom(&mut buf).expect("system rng");
    buf.iter()
        .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_id_is_app_dash_proctype() {
        assert_eq!(service_id("myapp", "web"), "myapp-web");
    }

    #[test]
    fn service_id_ignores_version() {
        // Releases patch objects in place: the object name depends only on
        // (app, proctype), so a new version never accumulates new objects.
        let mut req = DeployRequest {
            app: "myapp".into(),
            proctype: "web".into(),
            version: "1".into(),
            ..Default::default()
        };
        req.service_id = service_id(&req.app, &req.proctype);
        let first = req.service_id.clone();

        req.version = "2".into();
        req.service_id = service_id(&req.app, &req.proctype);
        assert_eq!(first, req.service_id);
    }

    #[test]
    fn run_service_id_shape() {
        let id = run_service_id("myapp");
        assert!(id.starts_with("myapp-run-"));
        assert_eq!(id.len(), "myapp-run-".len() + 6);
        assert_ne!(run_service_id("myapp"), run_service_id("myapp"));
    }

    #[test]
    fn ingress_name_derives_from_namespace() {
        assert_eq!(ingress_name("prod"), "prod-ing");
    }

    #[test]
    fn tls_secret_name_replaces_dots() {
        assert_eq!(tls_secret_name("myapp", "www.example.com"), "myapp-www-example-com");
    }

    #[test]
    fn selector_renders_sorted_pairs() {
        let labels = process_labels("myapp", "web");
        assert_eq!(
            label_selector(&labels),
            "app=myapp,managed-by=datacol.io,type=web"
        );
    }
}
