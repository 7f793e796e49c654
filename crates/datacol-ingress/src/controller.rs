//! nginx ingress-controller bootstrap.
//!
//! Providers without a managed ingress controller get one deployed into the
//! stack namespace: a service account with the RBAC the controller needs, a
//! default backend, the controller deployment, and a LoadBalancer service
//! fronting it. Every sub-resource is get-or-create, so the bootstrap is
//! idempotent and safe to run on every deploy.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction,
    ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe, Service, ServiceAccount,
    ServicePort, ServiceSpec,
};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use datacol_core::types::APP_LABEL;
use datacol_core::{Result, is_already_exists};

const NGINX_APP_NAME: &str = "ingress-nginx";
const NGINX_CONFIG_NAME: &str = "nginx-configuration";
const NGINX_CONTROLLER_NAME: &str = "nginx-ingress-controller";
const NGINX_CONTROLLER_IMAGE: &str =
    "quay.io/kubernetes-ingress-controller/nginx-ingress-controller:0.10.2";

const DEFAULT_BACKEND_NAME: &str = "default-http-backend";
const DEFAULT_BACKEND_IMAGE: &str = "gcr.io/google_containers/defaultbackend:1.4";

const SERVICE_ACCOUNT_NAME: &str = "nginx-ingress-serviceaccount";
const ROLE_NAME: &str = "nginx-ingress-role";
const CLUSTER_ROLE_NAME: &str = "nginx-ingress-clusterrole";
const ROLE_BINDING_NAME: &str = "nginx-ingress-role-nisa-binding";
const CLUSTER_ROLE_BINDING_NAME: &str = "nginx-ingress-clusterrole-nisa-binding";

/// Bootstraps and tears down the per-stack nginx ingress controller.
pub struct IngressController {
    client: Client,
    namespace: String,
}

impl IngressController {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    /// Create every controller sub-resource that does not exist yet.
    pub async fn reconcile(&self) -> Result<()> {
        let ns = &self.namespace;

        ensure(&Api::namespaced(self.client.clone(), ns), &service_account()).await?;
        self.reconcile_rbac().await?;

        ensure(&Api::namespaced(self.client.clone(), ns), &nginx_configmap()).await?;
        ensure(&Api::namespaced(self.client.clone(), ns), &default_backend_deployment()).await?;
        ensure(&Api::namespaced(self.client.clone(), ns), &default_backend_service()).await?;

        // The controller expects the default backend service to exist.
        ensure(&Api::namespaced(self.client.clone(), ns), &controller_service()).await?;
        ensure(&Api::namespaced(self.client.clone(), ns), &controller_deployment(ns)).await?;

        debug!(namespace = %ns, "ingress controller reconciled");
        Ok(())
    }

    async fn reconcile_rbac(&self) -> Result<()> {
        let ns = &self.namespace;

        ensure(&Api::all(self.client.clone()), &cluster_role()).await?;
        ensure(&Api::namespaced(self.client.clone(), ns), &role()).await?;
        ensure(&Api::namespaced(self.client.clone(), ns), &role_binding(ns)).await?;
        ensure(&Api::all(self.client.clone()), &cluster_role_binding(ns)).await?;

        Ok(())
    }

    /// Best-effort teardown of everything [`reconcile`](Self::reconcile)
    /// creates. Failures are logged, not surfaced; the caller is deleting
    /// the stack anyway.
    pub async fn remove(&self) {
        let ns = &self.namespace;
        debug!(namespace = %ns, "removing ingress controller");

        remove::<Service>(&Api::namespaced(self.client.clone(), ns), DEFAULT_BACKEND_NAME).await;
        remove::<Deployment>(&Api::namespaced(self.client.clone(), ns), DEFAULT_BACKEND_NAME)
            .await;
        remove::<ConfigMap>(&Api::namespaced(self.client.clone(), ns), NGINX_CONFIG_NAME).await;
        remove::<Service>(&Api::namespaced(self.client.clone(), ns), NGINX_APP_NAME).await;
        remove::<Deployment>(&Api::namespaced(self.client.clone(), ns), NGINX_CONTROLLER_NAME)
            .await;
        remove::<ServiceAccount>(&Api::namespaced(self.client.clone(), ns), SERVICE_ACCOUNT_NAME)
            .await;
        remove::<Role>(&Api::namespaced(self.client.clone(), ns), ROLE_NAME).await;
        remove::<RoleBinding>(&Api::namespaced(self.client.clone(), ns), ROLE_BINDING_NAME).await;
        remove::<ClusterRole>(&Api::all(self.client.clone()), CLUSTER_ROLE_NAME).await;
        remove::<ClusterRoleBinding>(&Api::all(self.client.clone()), CLUSTER_ROLE_BINDING_NAME)
            .await;
    }
}

/// Create an object, treating "already exists" as success.
async fn ensure<K>(api: &Api<K>, value: &K) -> Result<()>
where
    K: Resource + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
{
    match api.create(&PostParams::default(), value).await {
        Ok(_) => Ok(()),
        Err(e) if is_already_exists(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn remove<K>(api: &Api<K>, name: &str)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    if let Err(e) = api.delete(name, &DeleteParams::default()).await {
        warn!(name, error = %e, "ingress controller teardown");
    }
}

fn nginx_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), NGINX_APP_NAME.to_string())])
}

fn backend_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), DEFAULT_BACKEND_NAME.to_string())])
}

fn service_account() -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(SERVICE_ACCOUNT_NAME.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(api_groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn cluster_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_NAME.to_string()),
            ..Default::default()
        },
        rules: Some(vec![
            rule(
                &[""],
                &["configmaps", "endpoints", "nodes", "pods", "secrets"],
                &["list", "watch"],
            ),
            rule(&[""], &["nodes"], &["get"]),
            rule(&[""], &["services"], &["get", "list", "watch"]),
            rule(&["networking.k8s.io"], &["ingresses"], &["get", "list", "watch"]),
            rule(&[""], &["events"], &["create", "patch"]),
            rule(&["networking.k8s.io"], &["ingresses/status"], &["update"]),
        ]),
        ..Default::default()
    }
}

fn role() -> Role {
    let mut leader_rule = rule(&[""], &["configmaps"], &["get", "update"]);
    leader_rule.resource_names = Some(vec!["ingress-controller-leader-nginx".to_string()]);

    Role {
        metadata: ObjectMeta {
            name: Some(ROLE_NAME.to_string()),
            ..Default::default()
        },
        rules: Some(vec![
            rule(
                &[""],
                &["configmaps", "pods", "secrets", "namespaces"],
                &["get"],
            ),
            leader_rule,
            rule(&[""], &["endpoints"], &["get"]),
            rule(&[""], &["configmaps"], &["create"]),
        ]),
    }
}

fn service_account_subject(namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: SERVICE_ACCOUNT_NAME.to_string(),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

fn role_binding(namespace: &str) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(ROLE_BINDING_NAME.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: ROLE_NAME.to_string(),
        },
        subjects: Some(vec![service_account_subject(namespace)]),
    }
}

fn cluster_role_binding(namespace: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_BINDING_NAME.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CLUSTER_ROLE_NAME.to_string(),
        },
        subjects: Some(vec![service_account_subject(namespace)]),
    }
}

fn nginx_configmap() -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(NGINX_CONFIG_NAME.to_string()),
            labels: Some(nginx_labels()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "use-proxy-protocol".to_string(),
            "true".to_string(),
        )])),
        ..Default::default()
    }
}

fn default_backend_deployment() -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(DEFAULT_BACKEND_NAME.to_string()),
            labels: Some(backend_labels()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(backend_labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(backend_labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: DEFAULT_BACKEND_NAME.to_string(),
                        image: Some(DEFAULT_BACKEND_IMAGE.to_string()),
                        liveness_probe: Some(Probe {
                            http_get: Some(HTTPGetAction {
                                path: Some("/healthz".to_string()),
                                port: IntOrString::Int(8080),
                                scheme: Some("HTTP".to_string()),
                                ..Default::default()
                            }),
                            initial_delay_seconds: Some(30),
                            timeout_seconds: Some(5),
                            ..Default::default()
                        }),
                        ports: Some(vec![ContainerPort {
                            container_port: 8080,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn default_backend_service() -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(DEFAULT_BACKEND_NAME.to_string()),
            labels: Some(backend_labels()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port: 80,
                target_port: Some(IntOrString::Int(8080)),
                ..Default::default()
            }]),
            selector: Some(backend_labels()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn controller_service() -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(NGINX_APP_NAME.to_string()),
            annotations: Some(BTreeMap::from([
                (
                    "service.beta.kubernetes.io/aws-load-balancer-proxy-protocol".to_string(),
                    "*".to_string(),
                ),
                (
                    "service.beta.kubernetes.io/aws-load-balancer-connection-idle-timeout"
                        .to_string(),
                    "3600".to_string(),
                ),
            ])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            selector: Some(nginx_labels()),
            ports: Some(vec![
                ServicePort {
                    name: Some("http".to_string()),
                    port: 80,
                    target_port: Some(IntOrString::String("http".to_string())),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("https".to_string()),
                    port: 443,
                    target_port: Some(IntOrString::String("https".to_string())),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn controller_deployment(namespace: &str) -> Deployment {
    let probe_action = HTTPGetAction {
        path: Some("/healthz".to_string()),
        port: IntOrString::Int(10254),
        scheme: Some("HTTP".to_string()),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(NGINX_CONTROLLER_NAME.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(nginx_labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(NGINX_CONTROLLER_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(nginx_labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(SERVICE_ACCOUNT_NAME.to_string()),
                    containers: vec![Container {
                        name: NGINX_CONTROLLER_NAME.to_string(),
                        image: Some(NGINX_CONTROLLER_IMAGE.to_string()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        env: Some(vec![
                            field_env("POD_NAME", "metadata.name"),
                            field_env("POD_NAMESPACE", "metadata.namespace"),
                        ]),
                        liveness_probe: Some(Probe {
                            http_get: Some(probe_action.clone()),
                            initial_delay_seconds: Some(30),
                            timeout_seconds: Some(5),
                            ..Default::default()
                        }),
                        readiness_probe: Some(Probe {
                            http_get: Some(probe_action),
                            failure_threshold: Some(3),
                            ..Default::default()
                        }),
                        args: Some(vec![
                            "/nginx-ingress-controller".to_string(),
                            format!("--default-backend-service=$(POD_NAMESPACE)/{DEFAULT_BACKEND_NAME}"),
                            format!("--configmap=$(POD_NAMESPACE)/{NGINX_CONFIG_NAME}"),
                            format!("--publish-service=$(POD_NAMESPACE)/{NGINX_APP_NAME}"),
                            "--annotations-prefix=kubernetes.io".to_string(),
                        ]),
                        ports: Some(vec![
                            ContainerPort {
                                name: Some("http".to_string()),
                                container_port: 80,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            },
                            ContainerPort {
                                name: Some("https".to_string()),
                                container_port: 443,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_runs_under_its_service_account() {
        let dp = controller_deployment("prod");
        let pod_spec = dp.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            pod_spec.service_account_name.as_deref(),
            Some(SERVICE_ACCOUNT_NAME)
        );
        let args = pod_spec.containers[0].args.clone().unwrap();
        assert!(args.iter().any(|a| a.contains(DEFAULT_BACKEND_NAME)));
        assert!(args.iter().any(|a| a.contains(NGINX_CONFIG_NAME)));
    }

    #[test]
    fn controller_service_is_a_load_balancer() {
        let svc = controller_service();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
        let ports: Vec<i32> = spec.ports.unwrap().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![80, 443]);
    }

    #[test]
    fn bindings_reference_the_service_account() {
        let rb = role_binding("prod");
        assert_eq!(rb.role_ref.kind, "Role");
        let subject = &rb.subjects.unwrap()[0];
        assert_eq!(subject.name, SERVICE_ACCOUNT_NAME);
        assert_eq!(subject.namespace.as_deref(), Some("prod"));

        let crb = cluster_role_binding("prod");
        assert_eq!(crb.role_ref.kind, "ClusterRole");
        assert_eq!(crb.role_ref.name, CLUSTER_ROLE_NAME);
    }

    #[test]
    fn cluster_role_watches_ingresses() {
        let rules = cluster_role().rules.unwrap();
        let ingress_rule = rules
            .iter()
            .find(|r| {
                r.resources
                    .as_ref()
                    .is_some_and(|res| res.contains(&"ingresses".to_string()))
            })
            .unwrap();
        assert!(ingress_rule.verbs.contains(&"watch".to_string()));
    }
}
