//! Rollout health waits.
//!
//! Two phases after a deployment is applied: wait for the controller to
//! observe the new generation, then wait for every replica to become
//! available. Failures are diagnosed from replica-set and pod events so the
//! caller can tell an image-pull failure from a probe failure from a plain
//! timeout.

use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Event;
use kube::api::{Api, GetParams, ListParams};
use kube::Client;
use tracing::{debug, info, warn};

use datacol_core::config::RolloutBudget;
use datacol_core::types::label_selector;
use datacol_core::{Error, Result, is_not_found};

/// Wait until the deployment controller has observed the latest generation.
///
/// Transient not-found responses are tolerated; running out of attempts is
/// not an error, the readiness wait will catch a stuck rollout.
pub async fn wait_until_updated(
    client: &Client,
    namespace: &str,
    name: &str,
    budget: &RolloutBudget,
) -> Result<()> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    debug!(deployment = name, "waiting for a newer generation");

    for _ in 0..budget.generation_attempts {
        match deployments.get_opt(name).await {
            Ok(None) => {}
            Ok(Some(dp)) => {
                let generation = dp.metadata.generation.unwrap_or(0);
                let observed = dp
                    .status
                    .as_ref()
                    .and_then(|s| s.observed_generation)
                    .unwrap_or(0);
                if observed >= generation {
                    debug!(deployment = name, generation, "newer generation observed");
                    return Ok(());
                }
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    Ok(())
}

/// Wait until every replica of the deployment is updated and available.
///
/// Aborts immediately on a `FailedCreate` replica-set event. While polling,
/// pending pods are inspected every `pending_check_secs` and unrecoverable
/// conditions fail fast; legitimately-starting pods may extend the budget.
/// On timeout the not-ready pods' events decide between a diagnosed failure
/// and a generic timeout.
pub async fn wait_until_ready(
    client: &Client,
    namespace: &str,
    name: &str,
    budget: &RolloutBudget,
) -> Result<()> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let dp = deployments.get(name).await?;

    let labels = dp
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    let selector = label_selector(&labels);
    let resource_version = dp.metadata.resource_version.clone();

    check_replica_set_failures(client, namespace, &selector).await?;

    let mut timeout = budget.ready_timeout_secs;
    let mut waited = 0u64;
    let check_every = budget.pending_check_secs.max(1);

    info!(deployment = name, timeout, "waiting for pods to get ready");

    while waited < timeout {
        tokio::time::sleep(Duration::from_secs(1)).await;
        waited += 1;

        if fetch_ready(&deployments, name, &resource_version).await {
            break;
        }

        // Periodic failure sweep; ready pods are the deployment's business.
        if waited % check_every == 0 {
            let extra = crate::pod::inspect_pending_pods(client, namespace, &selector).await?;
            timeout += extra;
            info!(deployment = name, waited, "still waiting on pods");
        }
    }

    if fetch_ready(&deployments, name, &resource_version).await {
        return Ok(());
    }

    let container_name = crate::pod::container_name_from_labels(&labels);
    crate::pod::diagnose_not_ready_pods(client, namespace, &selector, &container_name).await?;

    Err(Error::RolloutTimeout(format!(
        "deployment {name} not ready after {waited}s"
    )))
}

/// Whether every replica of the deployment is updated and available.
///
/// A deployment with no desired count is trivially ready; one reporting any
/// unavailable replica never is.
pub fn replicas_ready(dp: &Deployment) -> bool {
    let Some(desired) = dp.spec.as_ref().and_then(|s| s.replicas) else {
        return true;
    };
    let Some(status) = dp.status.as_ref() else {
        return false;
    };

    status.unavailable_replicas.unwrap_or(0) == 0
        && status.replicas.unwrap_or(0) == desired
        && status.updated_replicas.unwrap_or(0) == desired
        && status.available_replicas.unwrap_or(0) == desired
}

/// Re-read the deployment no older than `resource_version` and evaluate
/// readiness; read errors count as not ready and are retried by the caller.
async fn fetch_ready(
    deployments: &Api<Deployment>,
    name: &str,
    resource_version: &Option<String>,
) -> bool {
    let gp = GetParams {
        resource_version: resource_version.clone(),
        ..Default::default()
    };
    match deployments.get_with(name, &gp).await {
        Ok(dp) => replicas_ready(&dp),
        Err(e) => {
            warn!(deployment = name, error = %e, "reading deployment status");
            false
        }
    }
}

/// Scan the deployment's replica sets for `FailedCreate` events, which mean
/// the rollout can never make progress (quota, admission, missing secrets).
async fn check_replica_set_failures(
    client: &Client,
    namespace: &str,
    selector: &str,
) -> Result<()> {
    let replica_sets: Api<ReplicaSet> = Api::namespaced(client.clone(), namespace);
    let sets = replica_sets
        .list(&ListParams::default().labels(selector))
        .await?
        .items;

    let Some(rs) = sets.first() else {
        return Ok(());
    };

    let fields = format!(
        "involvedObject.kind=ReplicaSet,involvedObject.name={},involvedObject.namespace={},involvedObject.uid={}",
        rs.metadata.name.clone().unwrap_or_default(),
        namespace,
        rs.metadata.uid.clone().unwrap_or_default(),
    );
    let events: Api<Event> = Api::namespaced(client.clone(), namespace);
    for event in events.list(&ListParams::default().fields(&fields)).await?.items {
        let reason = event.reason.clone().unwrap_or_default();
        debug!(reason, message = ?event.message, "replica set event");

        if reason == "FailedCreate" {
            return Err(Error::PodFailed(event.message.unwrap_or_default()));
        }
    }

    Ok(())
}
