//! The deployment reconciler.
//!
//! `Deployer::run` converges the cluster onto a `DeployRequest`: namespace
//! and default limit range, the Deployment itself (created fresh or patched
//! container-only), the fronting Service when a port is exposed, the shared
//! ingress when domains are set, then blocks on rollout health.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::core::v1::{
    Container, LimitRange, LimitRangeItem, LimitRangeSpec, Namespace, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info};

use datacol_core::types::{
    APP_LABEL, HERITAGE, MANAGED_BY_LABEL, app_labels, process_labels, service_id,
};
use datacol_core::{DeployRequest, DeployResponse, EngineConfig, Error, Result, is_already_exists};
use datacol_ingress::reconcile_ingress;

use crate::builder::{new_container, new_pod_metadata, new_pod_spec};
use crate::rollout;

const DEFAULT_LIMIT_RANGE_NAME: &str = "default-limit-range";

/// Reconciles workloads onto the cluster.
pub struct Deployer {
    client: Client,
    config: EngineConfig,
}

impl Deployer {
    pub fn new(client: Client) -> Self {
        Self::with_config(client, EngineConfig::default())
    }

    pub fn with_config(client: Client, config: EngineConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Converge the cluster onto the request and wait for rollout health.
    pub async fn run(&self, payload: &DeployRequest) -> Result<DeployResponse> {
        let req = validated(payload)?;
        debug!(
            app = %req.app,
            proctype = %req.proctype,
            request = %serde_json::to_string(&req).unwrap_or_default(),
            "deploy request"
        );

        self.ensure_namespace(&req.namespace).await?;
        self.ensure_default_limit_range(&req.namespace).await?;

        let dp = self.create_or_update_deployment(&req).await?;

        let mut response = DeployResponse {
            request: req.clone(),
            node_port: 0,
        };

        if req.container_port > 0 {
            let svc = self
                .create_or_update_service(new_service(&req), &req.namespace)
                .await?;
            response.node_port = svc
                .spec
                .as_ref()
                .and_then(|s| s.ports.as_ref())
                .and_then(|p| p.first())
                .and_then(|p| p.node_port)
                .unwrap_or(0);

            if !req.domains.is_empty() {
                reconcile_ingress(&self.client, &response).await?;
            }
        }

        let name = dp.metadata.name.clone().unwrap_or_default();
        rollout::wait_until_updated(&self.client, &req.namespace, &name, &self.config.rollout)
            .await?;
        rollout::wait_until_ready(&self.client, &req.namespace, &name, &self.config.rollout)
            .await?;

        info!(app = %req.app, proctype = %req.proctype, "deployed");
        Ok(response)
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match namespaces.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                debug!(namespace, "namespace created");
                Ok(())
            }
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_default_limit_range(&self, namespace: &str) -> Result<()> {
        let ranges: Api<LimitRange> = Api::namespaced(self.client.clone(), namespace);
        match ranges
            .create(&PostParams::default(), &default_limit_range())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Create the deployment, or patch only the matching container (and the
    /// replica count when the request sets one) of the existing object.
    async fn create_or_update_deployment(&self, req: &DeployRequest) -> Result<Deployment> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &req.namespace);

        match deployments.get_opt(&req.service_id).await? {
            Some(mut existing) => {
                let container = new_container(req)?;
                patch_deployment_container(&mut existing, req, container);
                let updated = deployments
                    .replace(&req.service_id, &PostParams::default(), &existing)
                    .await?;
                debug!(deployment = %req.service_id, "deployment updated");
                Ok(updated)
            }
            None => {
                let created = deployments
                    .create(&PostParams::default(), &new_deployment(req)?)
                    .await?;
                debug!(deployment = %req.service_id, "deployment created");
                Ok(created)
            }
        }
    }

    /// Create the service, or update it preserving the allocated ClusterIP
    /// and NodePort so in-flight traffic is not broken.
    async fn create_or_update_service(&self, mut svc: Service, namespace: &str) -> Result<Service> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let name = svc.metadata.name.clone().unwrap_or_default();

        match services.create(&PostParams::default(), &svc).await {
            Ok(created) => {
                debug!(service = %name, "service created");
                Ok(created)
            }
            Err(e) if is_already_exists(&e) => {
                let old = services.get(&name).await?;
                svc.metadata.resource_version = old.metadata.resource_version.clone();

                let old_spec = old.spec.as_ref();
                let spec = svc.spec.get_or_insert_with(Default::default);
                spec.cluster_ip = old_spec.and_then(|s| s.cluster_ip.clone());
                if let (Some(ports), Some(old_ports)) =
                    (spec.ports.as_mut(), old_spec.and_then(|s| s.ports.as_ref()))
                {
                    if let (Some(port), Some(old_port)) = (ports.first_mut(), old_ports.first()) {
                        port.node_port = old_port.node_port;
                    }
                }

                let updated = services.replace(&name, &PostParams::default(), &svc).await?;
                debug!(service = %name, "service updated");
                Ok(updated)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Validate the request and fill in the derived service id.
fn validated(payload: &DeployRequest) -> Result<DeployRequest> {
    if payload.namespace.is_empty() {
        return Err(Error::validation("namespace not set for deploy request"));
    }
    if payload.app.is_empty() {
        return Err(Error::validation("app not set for deploy request"));
    }
    if payload.proctype.is_empty() {
        return Err(Error::validation("proctype not set for deploy request"));
    }

    let mut req = payload.clone();
    if req.service_id.is_empty() {
        req.service_id = service_id(&req.app, &req.proctype);
    }
    Ok(req)
}

/// Desired deployment manifest for a fresh workload.
fn new_deployment(req: &DeployRequest) -> Result<Deployment> {
    let labels = process_labels(&req.app, &req.proctype);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(req.service_id.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: req.replicas,
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::String("25%".to_string())),
                    max_surge: Some(IntOrString::String("25%".to_string())),
                }),
            }),
            template: k8s_openapi::api::core::v1::PodTemplateSpec {
                metadata: Some(new_pod_metadata(req)),
                spec: Some(new_pod_spec(req)?),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Patch only the workload's own container inside an existing deployment,
/// leaving every other field as the live object has it. Prior resource
/// constraints persist across releases; replicas change only when the
/// request sets them.
fn patch_deployment_container(dp: &mut Deployment, req: &DeployRequest, mut container: Container) {
    let Some(spec) = dp.spec.as_mut() else { return };
    let Some(pod_spec) = spec.template.spec.as_mut() else {
        return;
    };

    let Some(i) = pod_spec
        .containers
        .iter()
        .position(|c| c.name == req.service_id)
    else {
        return;
    };

    if req.replicas.is_some() {
        spec.replicas = req.replicas;
    }

    container.resources = pod_spec.containers[i].resources.clone();
    pod_spec.containers[i] = container;
}

/// Desired service manifest: NodePort behind the shared ingress when
/// domains are set, a plain LoadBalancer on port 80 otherwise.
fn new_service(req: &DeployRequest) -> Service {
    let (type_, port) = if req.domains.is_empty() {
        ("LoadBalancer", 80)
    } else {
        ("NodePort", req.container_port)
    };

    Service {
        metadata: ObjectMeta {
            name: Some(req.service_id.clone()),
            namespace: Some(req.namespace.clone()),
            labels: Some(app_labels(&req.app)),
            annotations: (!req.tags.is_empty()).then(|| req.tags.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            ports: Some(vec![ServicePort {
                port,
                target_port: Some(IntOrString::Int(req.container_port)),
                ..Default::default()
            }]),
            selector: Some(BTreeMap::from([(
                APP_LABEL.to_string(),
                req.app.clone(),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn default_limit_range() -> LimitRange {
    LimitRange {
        metadata: ObjectMeta {
            name: Some(DEFAULT_LIMIT_RANGE_NAME.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                HERITAGE.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(LimitRangeSpec {
            limits: vec![LimitRangeItem {
                type_: "Container".to_string(),
                default: Some(BTreeMap::from([(
                    "memory".to_string(),
                    Quantity("512Mi".to_string()),
                )])),
                default_request: Some(BTreeMap::from([(
                    "memory".to_string(),
                    Quantity("256Mi".to_string()),
                )])),
                ..Default::default()
            }],
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DeployRequest {
        DeployRequest {
            app: "myapp".into(),
            proctype: "web".into(),
            service_id: "myapp-web".into(),
            namespace: "prod".into(),
            image: "registry/myapp:1".into(),
            container_port: 8080,
            ..Default::default()
        }
    }

    #[test]
    fn validation_requires_namespace_app_proctype() {
        for field in ["namespace", "app", "proctype"] {
            let mut req = request();
            match field {
                "namespace" => req.namespace.clear(),
                "app" => req.app.clear(),
                _ => req.proctype.clear(),
            }
            assert!(matches!(validated(&req), Err(Error::Validation(_))), "{field}");
        }
    }

    #[test]
    fn validation_derives_a_missing_service_id() {
        let mut req = request();
        req.service_id.clear();
        assert_eq!(validated(&req).unwrap().service_id, "myapp-web");
    }

    #[test]
    fn service_type_follows_domains() {
        let mut req = request();
        let svc = new_service(&req);
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(spec.ports.unwrap()[0].port, 80);

        req.domains = vec!["example.com".into()];
        let svc = new_service(&req);
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(spec.ports.unwrap()[0].port, 8080);
    }

    #[test]
    fn service_selects_pods_by_app() {
        let svc = new_service(&request());
        let selector = svc.spec.unwrap().selector.unwrap();
        assert_eq!(selector.get("app").map(String::as_str), Some("myapp"));
    }

    #[test]
    fn deployment_uses_rolling_update_quarters() {
        let dp = new_deployment(&request()).unwrap();
        let strategy = dp.spec.as_ref().unwrap().strategy.as_ref().unwrap();
        assert_eq!(strategy.type_.as_deref(), Some("RollingUpdate"));
        let rolling = strategy.rolling_update.as_ref().unwrap();
        assert_eq!(
            rolling.max_unavailable,
            Some(IntOrString::String("25%".to_string()))
        );
        assert_eq!(rolling.max_surge, Some(IntOrString::String("25%".to_string())));
    }

    #[test]
    fn deployment_selector_matches_template_labels() {
        let dp = new_deployment(&request()).unwrap();
        let spec = dp.spec.unwrap();
        let selector = spec.selector.match_labels.unwrap();
        let template_labels = spec.template.metadata.unwrap().labels.unwrap();
        for (k, v) in &selector {
            assert_eq!(template_labels.get(k), Some(v));
        }
    }

    #[test]
    fn patch_replaces_only_the_matching_container() {
        let mut req = request();
        let mut dp = new_deployment(&req).unwrap();

        // Live object gained resources out of band.
        {
            let containers = &mut dp
                .spec
                .as_mut()
                .unwrap()
                .template
                .spec
                .as_mut()
                .unwrap()
                .containers;
            datacol_core::resources::merge_resource_constraints(
                "cpu",
                &mut containers[0],
                "500m/250m",
            )
            .unwrap();
        }

        req.image = "registry/myapp:2".into();
        req.replicas = Some(4);
        let container = new_container(&req).unwrap();
        patch_deployment_container(&mut dp, &req, container);

        let spec = dp.spec.unwrap();
        assert_eq!(spec.replicas, Some(4));
        let patched = &spec.template.spec.unwrap().containers[0];
        assert_eq!(patched.image.as_deref(), Some("registry/myapp:2"));
        // Prior constraints persist across releases.
        assert_eq!(
            datacol_core::resources::format_request_limit(patched, "cpu"),
            "500m/250m"
        );
    }

    #[test]
    fn patch_without_replicas_leaves_count_alone() {
        let mut req = request();
        req.replicas = Some(3);
        let mut dp = new_deployment(&req).unwrap();

        req.replicas = None;
        let container = new_container(&req).unwrap();
        patch_deployment_container(&mut dp, &req, container);
        assert_eq!(dp.spec.unwrap().replicas, Some(3));
    }

    #[test]
    fn limit_range_defaults_memory() {
        let lr = default_limit_range();
        let item = &lr.spec.unwrap().limits[0];
        assert_eq!(item.type_, "Container");
        assert_eq!(
            item.default.as_ref().unwrap().get("memory").unwrap().0,
            "512Mi"
        );
        assert_eq!(
            item.default_request.as_ref().unwrap().get("memory").unwrap().0,
            "256Mi"
        );
    }
}
