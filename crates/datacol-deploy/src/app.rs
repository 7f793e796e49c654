//! App-level operations built on the reconciler.
//!
//! Scaling, environment updates, whole-app deletion, endpoint lookup and
//! resource-limit changes all work through the same labels and naming the
//! reconciler applies, so anything it created they can find.

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{EnvVar, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use datacol_core::resources::merge_resource_constraints;
use datacol_core::types::{
    HERITAGE, MANAGED_BY_LABEL, TYPE_LABEL, app_labels, ingress_name, label_selector, service_id,
};
use datacol_core::{DeployRequest, Provider, Result};
use datacol_ingress::controller::IngressController;
use datacol_ingress::merge::INGRESS_CLASS_ANNOTATION;

use crate::deployer::Deployer;
use crate::rollout;

/// All deployments belonging to an app.
pub async fn list_deployments(client: &Client, namespace: &str, app: &str) -> Result<Vec<Deployment>> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(&label_selector(&app_labels(app)));
    Ok(deployments.list(&lp).await?.items)
}

/// Pods currently selected by one deployment.
pub async fn pods_for_deployment(client: &Client, dp: &Deployment) -> Result<Vec<Pod>> {
    let namespace = dp.metadata.namespace.clone().unwrap_or_default();
    let labels = dp
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.clone())
        .unwrap_or_default();

    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let lp = ListParams::default().labels(&label_selector(&labels));
    Ok(pods.list(&lp).await?.items)
}

/// Scale one process type by re-running the reconciler with a replica count.
pub async fn scale(deployer: &Deployer, template: &DeployRequest, replicas: i32) -> Result<()> {
    let mut req = template.clone();
    req.replicas = Some(replicas);
    req.service_id = service_id(&req.app, &req.proctype);
    deployer.run(&req).await.map(|_| ())
}

/// Rewrite the environment of every deployment of an app and wait for the
/// restarted rollouts to settle.
pub async fn set_env(
    deployer: &Deployer,
    namespace: &str,
    app: &str,
    env: &std::collections::BTreeMap<String, String>,
) -> Result<()> {
    let client = deployer.client();
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);

    let env_vars: Vec<EnvVar> = env
        .iter()
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| EnvVar {
            name: k.clone(),
            value: Some(v.clone()),
            ..Default::default()
        })
        .collect();

    let mut updated = Vec::new();
    for mut dp in list_deployments(client, namespace, app).await? {
        let name = dp.metadata.name.clone().unwrap_or_default();
        let Some(container) = dp
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
            .and_then(|p| p.containers.first_mut())
        else {
            continue;
        };

        debug!(deployment = %name, vars = env_vars.len(), "setting environment");
        container.env = Some(env_vars.clone());
        deployments.replace(&name, &PostParams::default(), &dp).await?;
        updated.push(name);
    }

    for name in &updated {
        rollout::wait_until_updated(client, namespace, name, &deployer.config().rollout).await?;
        rollout::wait_until_ready(client, namespace, name, &deployer.config().rollout).await?;
    }

    info!(app, restarted = updated.len(), "environment updated");
    Ok(())
}

/// Delete every object of an app, and the shared ingress once the
/// namespace has no managed services left.
pub async fn delete_app(
    client: &Client,
    namespace: &str,
    app: &str,
    provider: Provider,
) -> Result<()> {
    let selector = label_selector(&app_labels(app));
    let lp = ListParams::default().labels(&selector);

    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    for svc in services.list(&lp).await?.items {
        let name = svc.metadata.name.clone().unwrap_or_default();
        services.delete(&name, &DeleteParams::default()).await?;
        debug!(service = %name, "service deleted");
    }

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let replica_sets: Api<ReplicaSet> = Api::namespaced(client.clone(), namespace);
    for mut dp in deployments.list(&lp).await?.items {
        let name = dp.metadata.name.clone().unwrap_or_default();

        // Scale down first so pods drain before the object goes.
        if let Some(spec) = dp.spec.as_mut() {
            spec.replicas = Some(0);
        }
        deployments.replace(&name, &PostParams::default(), &dp).await?;
        rollout::wait_until_updated(client, namespace, &name, &Default::default()).await?;

        deployments.delete(&name, &DeleteParams::default()).await?;
        debug!(deployment = %name, "deployment deleted");

        for rs in replica_sets.list(&lp).await?.items {
            let rs_name = rs.metadata.name.clone().unwrap_or_default();
            if let Err(e) = replica_sets.delete(&rs_name, &DeleteParams::default()).await {
                warn!(replica_set = %rs_name, error = %e, "deleting replica set");
            }
        }
    }

    let managed = ListParams::default().labels(&format!("{MANAGED_BY_LABEL}={HERITAGE}"));
    if services.list(&managed).await?.items.is_empty() {
        let ingresses: Api<Ingress> = Api::namespaced(client.clone(), namespace);
        for ing in ingresses.list(&managed).await?.items {
            let name = ing.metadata.name.clone().unwrap_or_default();
            debug!(ingress = %name, "deleting shared ingress");
            if let Err(e) = ingresses.delete(&name, &DeleteParams::default()).await {
                warn!(ingress = %name, error = %e, "deleting ingress");
            }
        }

        if provider.manages_ingress_controller() {
            IngressController::new(client.clone(), namespace).remove().await;
        }
    }

    info!(app, "app deleted");
    Ok(())
}

/// Externally reachable endpoint of a service, when one exists yet.
///
/// LoadBalancer services answer directly; NodePort services are reached
/// through the shared ingress (or the nginx controller's own balancer).
pub async fn service_endpoint(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<Option<String>> {
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    let Some(svc) = services.get_opt(name).await? else {
        return Ok(None);
    };

    let type_ = svc
        .spec
        .as_ref()
        .and_then(|s| s.type_.clone())
        .unwrap_or_default();

    if type_ == "LoadBalancer" {
        let ingress = svc
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .and_then(|list| list.first());

        let Some(lb) = ingress else { return Ok(None) };
        if let Some(hostname) = lb.hostname.clone() {
            return Ok(Some(hostname));
        }
        if let Some(ip) = lb.ip.clone() {
            let port = svc
                .spec
                .as_ref()
                .and_then(|s| s.ports.as_ref())
                .and_then(|p| p.first())
                .map(|p| p.port)
                .unwrap_or(80);
            return Ok(Some(format!("{ip}:{port}")));
        }
        return Ok(None);
    }

    if type_ == "NodePort" {
        let ingresses: Api<Ingress> = Api::namespaced(client.clone(), namespace);
        let Some(ing) = ingresses.get_opt(&ingress_name(namespace)).await? else {
            return Ok(None);
        };

        if let Some(ip) = ing
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .and_then(|list| list.first())
            .and_then(|i| i.ip.clone())
        {
            return Ok(Some(ip));
        }

        // Behind our own nginx controller the balancer fronts the
        // controller service, not the ingress.
        let has_class = ing
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(INGRESS_CLASS_ANNOTATION));
        if has_class {
            if let Some(controller) = services.get_opt("ingress-nginx").await? {
                let hostname = controller
                    .status
                    .as_ref()
                    .and_then(|s| s.load_balancer.as_ref())
                    .and_then(|lb| lb.ingress.as_ref())
                    .and_then(|list| list.first())
                    .and_then(|i| i.hostname.clone());
                return Ok(hostname);
            }
        }
    }

    warn!(service = name, "no load balancer endpoint found");
    Ok(None)
}

/// Apply resource-limit specs, keyed by proctype, to an app's deployments.
pub async fn process_limits(
    client: &Client,
    namespace: &str,
    app: &str,
    resource: &str,
    limits: &std::collections::BTreeMap<String, String>,
) -> Result<()> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);

    for mut dp in list_deployments(client, namespace, app).await? {
        let proctype = dp
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(TYPE_LABEL))
            .cloned()
            .unwrap_or_default();
        let Some(spec) = limits.get(&proctype) else {
            continue;
        };

        let container_name = service_id(app, &proctype);
        let name = dp.metadata.name.clone().unwrap_or_default();

        let Some(container) = dp
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
            .and_then(|p| p.containers.iter_mut().find(|c| c.name == container_name))
        else {
            warn!(deployment = %name, container = %container_name, "container not found");
            continue;
        };

        merge_resource_constraints(resource, container, spec)?;
        debug!(deployment = %name, resource, spec = %spec, "limits updated");
        deployments.replace(&name, &PostParams::default(), &dp).await?;
    }

    Ok(())
}
