//! Pod template construction.
//!
//! Turns a `DeployRequest` into the container and pod spec the reconciler
//! submits: env vars, ports, probes, resource constraints, and the optional
//! Cloud SQL proxy sidecar.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HTTPGetAction, PodSpec,
    Probe, SecretVolumeSource, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::debug;

use datacol_core::resources::merge_resource_constraints;
use datacol_core::types::{VERSION_LABEL, process_labels};
use datacol_core::{DeployRequest, Error, Result};

const CLOUDSQL_CONTAINER_NAME: &str = "cloudsql-proxy";
const CLOUDSQL_IMAGE: &str = "gcr.io/cloudsql-docker/gce-proxy:1.09";
const CLOUDSQL_CRED_VOLUME: &str = "cloudsql-instance-credentials";
const CLOUDSQL_SECRET_SUFFIX: &str = "cloudsql-secret";

/// Metadata applied to pods (and their template) of one workload.
pub fn new_pod_metadata(req: &DeployRequest) -> ObjectMeta {
    let mut labels = process_labels(&req.app, &req.proctype);
    if !req.version.is_empty() {
        labels.insert(VERSION_LABEL.to_string(), req.version.clone());
    }

    ObjectMeta {
        name: Some(req.service_id.clone()),
        namespace: Some(req.namespace.clone()),
        annotations: (!req.tags.is_empty()).then(|| req.tags.clone()),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Build the app container for a request.
pub fn new_container(req: &DeployRequest) -> Result<Container> {
    let env: Vec<EnvVar> = req
        .env_vars
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    let mut container = Container {
        name: req.service_id.clone(),
        image: Some(req.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: (!req.entrypoint.is_empty()).then(|| req.entrypoint.clone()),
        args: (!req.args.is_empty()).then(|| req.args.clone()),
        env: (!env.is_empty()).then_some(env),
        ..Default::default()
    };

    if req.container_port > 0 {
        container.ports = Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: req.container_port,
            ..Default::default()
        }]);

        // A bare TCP check; an HTTP heartbeat below replaces it.
        container.readiness_probe = Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(req.container_port),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            timeout_seconds: Some(1),
            period_seconds: Some(5),
            failure_threshold: Some(1),
            ..Default::default()
        });
    }

    if let Some(hb) = &req.heartbeat {
        let http_probe = |delay: i32| Probe {
            http_get: Some(HTTPGetAction {
                path: Some(hb.path.clone()),
                port: IntOrString::Int(req.container_port),
                ..Default::default()
            }),
            initial_delay_seconds: Some(delay),
            timeout_seconds: Some(hb.timeout_seconds),
            ..Default::default()
        };
        container.liveness_probe = Some(http_probe(hb.initial_delay_liveness));
        container.readiness_probe = Some(http_probe(hb.initial_delay_readiness));
    }

    merge_resource_constraints("cpu", &mut container, &req.cpu_req_limit)?;
    merge_resource_constraints("memory", &mut container, &req.memory_req_limit)?;

    Ok(container)
}

/// Build the pod spec for a request, including the optional sidecar.
pub fn new_pod_spec(req: &DeployRequest) -> Result<PodSpec> {
    let mut spec = PodSpec {
        containers: vec![new_container(req)?],
        ..Default::default()
    };

    if req.enable_cloudsql_proxy {
        merge_cloudsql_manifest(&mut spec, &req.app, &req.env_vars)?;
    }

    Ok(spec)
}

/// Add (or refresh) the Cloud SQL proxy sidecar in a pod spec.
///
/// The proxied port is derived from the `DATABASE_URL` scheme and the
/// instance from `INSTANCE_NAME`; credentials are mounted from the app's
/// cloudsql secret.
pub fn merge_cloudsql_manifest(
    spec: &mut PodSpec,
    app: &str,
    env: &BTreeMap<String, String>,
) -> Result<()> {
    let Some(db_url) = env.get("DATABASE_URL") else {
        return Err(Error::validation(
            "cloudsql proxy requested but DATABASE_URL is not set",
        ));
    };
    let scheme = db_url.split("://").next().unwrap_or_default();
    let port = default_port(scheme)?;
    let instance = env.get("INSTANCE_NAME").cloned().unwrap_or_default();

    let sidecar = Container {
        name: CLOUDSQL_CONTAINER_NAME.to_string(),
        image: Some(CLOUDSQL_IMAGE.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "/cloud_sql_proxy".to_string(),
            "--dir=/cloudsql".to_string(),
            format!("-instances={instance}=tcp:{port}"),
            "-credential_file=/secrets/cloudsql/credentials.json".to_string(),
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: CLOUDSQL_CRED_VOLUME.to_string(),
                mount_path: "/secrets/cloudsql".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "cloudsql".to_string(),
                mount_path: "/cloudsql".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    match spec
        .containers
        .iter()
        .position(|c| c.name == CLOUDSQL_CONTAINER_NAME)
    {
        Some(i) => {
            spec.containers[i] = sidecar;
            return Ok(());
        }
        None => spec.containers.push(sidecar),
    }

    let volumes = spec.volumes.get_or_insert_with(Default::default);
    if !volumes.iter().any(|v| v.name == CLOUDSQL_CRED_VOLUME) {
        volumes.push(Volume {
            name: CLOUDSQL_CRED_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(format!("{app}-{CLOUDSQL_SECRET_SUFFIX}")),
                ..Default::default()
            }),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "cloudsql".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
    }

    debug!(app, port, "merged cloudsql proxy sidecar");
    Ok(())
}

fn default_port(scheme: &str) -> Result<i32> {
    match scheme {
        "mysql" => Ok(3306),
        "postgres" => Ok(5432),
        other => Err(Error::validation(format!(
            "no default port for database scheme {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datacol_core::Heartbeat;

    fn request() -> DeployRequest {
        DeployRequest {
            app: "myapp".into(),
            proctype: "web".into(),
            service_id: "myapp-web".into(),
            namespace: "prod".into(),
            image: "registry/myapp:3".into(),
            container_port: 8080,
            version: "3".into(),
            ..Default::default()
        }
    }

    #[test]
    fn container_carries_image_env_and_port() {
        let mut req = request();
        req.env_vars.insert("FOO".into(), "bar".into());
        req.args = vec!["serve".into()];

        let c = new_container(&req).unwrap();
        assert_eq!(c.name, "myapp-web");
        assert_eq!(c.image.as_deref(), Some("registry/myapp:3"));
        assert_eq!(c.args.as_deref(), Some(&["serve".to_string()][..]));
        assert_eq!(c.env.unwrap()[0].name, "FOO");
        assert_eq!(c.ports.unwrap()[0].container_port, 8080);
        // Network-exposed containers get a TCP readiness probe.
        assert!(c.readiness_probe.unwrap().tcp_socket.is_some());
    }

    #[test]
    fn unexposed_container_has_no_ports_or_probe() {
        let mut req = request();
        req.container_port = 0;
        let c = new_container(&req).unwrap();
        assert!(c.ports.is_none());
        assert!(c.readiness_probe.is_none());
    }

    #[test]
    fn heartbeat_replaces_probes_with_http() {
        let mut req = request();
        req.heartbeat = Some(Heartbeat {
            path: "/health".into(),
            initial_delay_liveness: 10,
            initial_delay_readiness: 5,
            timeout_seconds: 2,
        });

        let c = new_container(&req).unwrap();
        let readiness = c.readiness_probe.unwrap();
        assert_eq!(
            readiness.http_get.as_ref().unwrap().path.as_deref(),
            Some("/health")
        );
        assert_eq!(readiness.initial_delay_seconds, Some(5));
        assert_eq!(c.liveness_probe.unwrap().initial_delay_seconds, Some(10));
    }

    #[test]
    fn malformed_limits_fail_the_build() {
        let mut req = request();
        req.cpu_req_limit = "half-a-core".into();
        assert!(new_container(&req).is_err());
    }

    #[test]
    fn pod_metadata_labels_include_version() {
        let meta = new_pod_metadata(&request());
        let labels = meta.labels.unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("myapp"));
        assert_eq!(labels.get("type").map(String::as_str), Some("web"));
        assert_eq!(labels.get("managed-by").map(String::as_str), Some("datacol.io"));
        assert_eq!(labels.get("version").map(String::as_str), Some("3"));
    }

    #[test]
    fn cloudsql_sidecar_is_added_once() {
        let mut req = request();
        req.enable_cloudsql_proxy = true;
        req.env_vars
            .insert("DATABASE_URL".into(), "postgres://db/app".into());
        req.env_vars.insert("INSTANCE_NAME".into(), "proj:db".into());

        let mut spec = new_pod_spec(&req).unwrap();
        assert_eq!(spec.containers.len(), 2);
        assert_eq!(spec.containers[1].name, CLOUDSQL_CONTAINER_NAME);
        let cmd = spec.containers[1].command.clone().unwrap();
        assert!(cmd.iter().any(|a| a == "-instances=proj:db=tcp:5432"));
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 2);

        // Merging again replaces the sidecar without duplicating volumes.
        merge_cloudsql_manifest(&mut spec, &req.app, &req.env_vars).unwrap();
        assert_eq!(spec.containers.len(), 2);
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn cloudsql_without_database_url_fails() {
        let mut req = request();
        req.enable_cloudsql_proxy = true;
        assert!(new_pod_spec(&req).is_err());

        req.env_vars
            .insert("DATABASE_URL".into(), "redis://cache".into());
        assert!(new_pod_spec(&req).is_err());
    }
}
