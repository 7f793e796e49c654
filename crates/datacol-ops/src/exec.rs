//! Remote process execution.
//!
//! Two modes. *Attached* execs into the first running pod of an app.
//! *Ephemeral run* creates a throwaway pod (proctype `run`, never
//! restarted), waits for it to come up, execs the command, and deletes the
//! pod on every return path.
//!
//! Both stream the caller's byte stream bidirectionally over the pod
//! `exec` subresource with a tty, so stderr arrives merged into stdout.

use std::collections::BTreeMap;
use std::pin::pin;

use k8s_openapi::api::core::v1::{EnvVar, Pod};
use kube::api::{Api, AttachParams, PostParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use datacol_core::types::{RUN_PROCESS_KIND, run_service_id};
use datacol_core::{DeployRequest, EngineConfig, Error, Result};
use datacol_deploy::builder::{new_pod_metadata, new_pod_spec};
use datacol_deploy::pod::{delete_pod, first_pod, wait_until_pod_running};

/// Arguments for one exec against a known pod.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub namespace: String,
    pub pod_name: String,
    /// Container to exec in; defaults to the pod's first container.
    pub container: Option<String>,
    pub command: Vec<String>,
    pub tty: bool,
}

/// Arguments for an ephemeral run.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunOptions {
    /// Command to execute inside the run pod.
    pub entrypoint: Vec<String>,
    pub tty: bool,
    /// Terminal width, exported as COLUMNS when non-zero.
    pub width: u32,
    /// Terminal height, exported as LINES when non-zero.
    pub height: u32,
}

/// Exec a command in the first pod of an app and stream the session over
/// `stream`.
pub async fn process_exec<S>(
    client: &Client,
    namespace: &str,
    app: &str,
    command: Vec<String>,
    stream: S,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let pod = first_pod(client, namespace, app).await?;
    let opts = ExecOptions {
        namespace: namespace.to_string(),
        pod_name: pod.metadata.name.clone().unwrap_or_default(),
        container: None,
        command,
        tty: true,
    };
    exec_in_pod(client, opts, stream).await
}

/// Run a one-off command in a fresh pod of the app's image.
///
/// The pod sits on `sleep infinity` until the exec attaches, and is deleted
/// best-effort whether the command succeeds, fails, or never starts.
pub async fn process_run<S>(
    client: &Client,
    config: &EngineConfig,
    namespace: &str,
    app: &str,
    image: &str,
    options: ProcessRunOptions,
    env_vars: BTreeMap<String, String>,
    enable_cloudsql_proxy: bool,
    stream: S,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let pod_name = run_service_id(app);
    let req = DeployRequest {
        app: app.to_string(),
        proctype: RUN_PROCESS_KIND.to_string(),
        service_id: pod_name.clone(),
        image: image.to_string(),
        args: vec!["sleep".to_string(), "infinity".to_string()],
        env_vars,
        enable_cloudsql_proxy,
        provider: config.provider,
        namespace: namespace.to_string(),
        ..Default::default()
    };

    let result = run_ephemeral(client, config, &req, &options, stream).await;

    // The pod is ephemeral; losing the cleanup only leaks a dead pod.
    if let Err(e) = delete_pod(client, namespace, &pod_name).await {
        warn!(pod = %pod_name, error = %e, "deleting run pod");
    }

    result
}

async fn run_ephemeral<S>(
    client: &Client,
    config: &EngineConfig,
    req: &DeployRequest,
    options: &ProcessRunOptions,
    stream: S,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut spec = new_pod_spec(req)?;
    spec.restart_policy = Some("Never".to_string());
    spec.termination_grace_period_seconds = Some(0);
    spec.containers[0].stdin = Some(options.tty);

    let env = spec.containers[0].env.get_or_insert_with(Default::default);
    if options.width > 0 {
        env.push(EnvVar {
            name: "COLUMNS".to_string(),
            value: Some(options.width.to_string()),
            ..Default::default()
        });
    }
    if options.height > 0 {
        env.push(EnvVar {
            name: "LINES".to_string(),
            value: Some(options.height.to_string()),
            ..Default::default()
        });
    }

    let pod = Pod {
        metadata: new_pod_metadata(req),
        spec: Some(spec),
        ..Default::default()
    };

    let pods: Api<Pod> = Api::namespaced(client.clone(), &req.namespace);
    pods.create(&PostParams::default(), &pod).await?;
    debug!(pod = %req.service_id, "run pod created");

    wait_until_pod_running(client, &req.namespace, &req.service_id, &config.run).await?;

    info!(pod = %req.service_id, command = ?options.entrypoint, "running command");

    let opts = ExecOptions {
        namespace: req.namespace.clone(),
        pod_name: req.service_id.clone(),
        container: Some(req.service_id.clone()),
        command: options.entrypoint.clone(),
        tty: options.tty,
    };
    exec_in_pod(client, opts, stream).await
}

/// Exec into a pod and pump bytes both ways until the command finishes.
///
/// The pod must be in the Running phase. The first I/O error on either
/// direction surfaces to the caller.
pub async fn exec_in_pod<S>(client: &Client, opts: ExecOptions, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let pods: Api<Pod> = Api::namespaced(client.clone(), &opts.namespace);
    let pod = pods.get(&opts.pod_name).await?;

    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    if phase != "Running" {
        return Err(Error::Exec(format!(
            "pod {} in {} is not running and cannot execute commands; current phase is {phase}",
            opts.pod_name, opts.namespace
        )));
    }

    let container = match opts.container.clone() {
        Some(name) => name,
        None => {
            let name = pod
                .spec
                .as_ref()
                .and_then(|s| s.containers.first())
                .map(|c| c.name.clone())
                .ok_or_else(|| Error::Exec(format!("pod {} has no containers", opts.pod_name)))?;
            debug!(container = %name, "defaulting to first container");
            name
        }
    };

    let ap = AttachParams::default()
        .container(container)
        .stdin(true)
        .stdout(true)
        .stderr(false)
        .tty(opts.tty);

    let mut attached = pods.exec(&opts.pod_name, opts.command.clone(), &ap).await?;
    let mut stdin = attached
        .stdin()
        .ok_or_else(|| Error::Exec("exec stdin stream unavailable".to_string()))?;
    let mut stdout = attached
        .stdout()
        .ok_or_else(|| Error::Exec("exec stdout stream unavailable".to_string()))?;

    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let mut from_pod = pin!(async { tokio::io::copy(&mut stdout, &mut write_half).await });
    let to_pod = pin!(async { tokio::io::copy(&mut read_half, &mut stdin).await });

    tokio::select! {
        result = &mut from_pod => {
            // Command output ended: the process is done.
            result?;
        }
        result = to_pod => {
            result?;
            // Caller closed its input; drain the remaining output.
            (&mut from_pod).await?;
        }
    }

    attached
        .join()
        .await
        .map_err(|e| Error::Exec(e.to_string()))?;

    Ok(())
}
