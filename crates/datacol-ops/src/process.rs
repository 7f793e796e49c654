//! Process list read model.
//!
//! Built by listing an app's deployments and deriving, per process type,
//! the desired count, a status string from the most recent pod, the
//! command, and the formatted resource constraints.

use tracing::debug;

use kube::Client;

use datacol_core::resources::format_request_limit;
use datacol_core::types::{TYPE_LABEL, service_id};
use datacol_core::{Process, Result};
use datacol_deploy::app::{list_deployments, pods_for_deployment};
use datacol_deploy::pod::pod_status;

/// List the running process types of an app.
pub async fn process_list(client: &Client, namespace: &str, app: &str) -> Result<Vec<Process>> {
    let mut items = Vec::new();

    for dp in list_deployments(client, namespace, app).await? {
        let name = dp.metadata.name.clone().unwrap_or_default();
        let pods = pods_for_deployment(client, &dp).await?;
        debug!(deployment = %name, pods = pods.len(), "building process entry");

        let Some(target) = pods.last() else {
            continue;
        };
        let status = pod_status(client, target).await;

        let proctype = dp
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(TYPE_LABEL))
            .cloned()
            .unwrap_or_default();

        let container_name = service_id(app, &proctype);
        let container = dp
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.iter().find(|c| c.name == container_name));

        let Some(container) = container else {
            continue;
        };

        items.push(Process {
            proctype,
            count: dp.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
            status,
            command: container.args.clone().unwrap_or_default(),
            cpu: format_request_limit(container, "cpu"),
            memory: format_request_limit(container, "memory"),
        });
    }

    Ok(items)
}
