//! Pod inspection helpers.
//!
//! Listing by the engine's labels, event lookup, failure classification for
//! pending pods, and the derived status string surfaced in the process read
//! model.

use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{Api, DeleteParams, ListParams};
use kube::Client;
use tracing::{debug, warn};

use datacol_core::config::RunBudget;
use datacol_core::types::{
    APP_LABEL, TYPE_LABEL, app_labels, label_selector,
};
use datacol_core::{Error, Result, is_not_found};

/// Container waiting reasons that mean the image can never be pulled.
const IMAGE_PULL_REASONS: &[&str] = &["ErrImagePull", "ImagePullBackOff", "InvalidImageName"];

/// Waiting reasons that fail a pending pod immediately.
const CONTAINER_ERRORS: &[&str] = &["CrashLoopBackOff", "ErrImagePull"];

/// Event reasons that fail a pending pod immediately.
const EVENT_ERRORS: &[&str] = &["Failed", "InspectFailed", "ErrImageNeverPull", "FailedScheduling"];

/// All pods belonging to an app.
pub async fn list_pods(client: &Client, namespace: &str, app: &str) -> Result<Vec<Pod>> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(&label_selector(&app_labels(app)));
    Ok(pods.list(&lp).await?.items)
}

/// Pods of an app currently in the Running phase.
pub async fn list_running_pods(client: &Client, namespace: &str, app: &str) -> Result<Vec<Pod>> {
    let mut pods = list_pods(client, namespace, app).await?;
    pods.retain(|p| phase(p) == "Running");
    Ok(pods)
}

/// The first pod of an app, for attached exec.
pub async fn first_pod(client: &Client, namespace: &str, app: &str) -> Result<Pod> {
    list_pods(client, namespace, app)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::validation(format!("no pod found for app {app}")))
}

/// Delete a pod, tolerating it being gone already.
pub async fn delete_pod(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    match pods.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Events for one pod, most recent first.
pub async fn pod_events(client: &Client, pod: &Pod) -> Result<Vec<Event>> {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let fields = format!(
        "involvedObject.name={},involvedObject.namespace={},involvedObject.uid={}",
        pod.metadata.name.clone().unwrap_or_default(),
        namespace,
        pod.metadata.uid.clone().unwrap_or_default(),
    );
    let mut items = events
        .list(&ListParams::default().fields(&fields))
        .await?
        .items;
    sort_events_recent_first(&mut items);
    Ok(items)
}

pub(crate) fn sort_events_recent_first(events: &mut [Event]) {
    events.sort_by(|a, b| {
        let at = a.last_timestamp.as_ref().map(|t| t.0);
        let bt = b.last_timestamp.as_ref().map(|t| t.0);
        bt.cmp(&at)
    });
}

/// Inspect pending pods of a workload and fail fast on unrecoverable
/// conditions. Returns extra seconds to grant the rollout budget when pods
/// are legitimately still starting (image pulls); currently zero.
pub async fn inspect_pending_pods(
    client: &Client,
    namespace: &str,
    selector: &str,
) -> Result<u64> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let items = pods
        .list(&ListParams::default().labels(selector))
        .await?
        .items;

    debug!(count = items.len(), selector, "inspecting pending pods");

    for pod in &items {
        let pod_phase = phase(pod);
        if pod_phase != "Pending" && pod_phase != "Running" {
            continue;
        }

        let (reason, message) = pending_status(client, pod).await;
        if let Some(err) = classify_waiting(&reason, &message) {
            return Err(err);
        }

        for event in pod_events(client, pod).await? {
            let event_reason = event.reason.clone().unwrap_or_default();
            if EVENT_ERRORS.contains(&event_reason.as_str()) {
                return Err(classify_event(&event_reason, &event.message.unwrap_or_default()));
            }
        }
    }

    Ok(0)
}

/// Final rollout diagnosis: find running-but-unready pods and surface their
/// probe or container failure events.
pub async fn diagnose_not_ready_pods(
    client: &Client,
    namespace: &str,
    selector: &str,
    container_name: &str,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let items = pods
        .list(&ListParams::default().labels(selector))
        .await?
        .items;

    for pod in &items {
        if phase(pod) != "Running" || container_ready(pod, container_name) {
            continue;
        }

        for event in pod_events(client, pod).await? {
            let reason = event.reason.clone().unwrap_or_default();
            if reason == "Unhealthy" || reason == "Failed" {
                return Err(Error::PodFailed(event.message.unwrap_or_default()));
            }
        }
    }

    Ok(())
}

/// Wait for a pod to reach the Running phase.
///
/// Fails fast when a container is stuck on an image-pull error, when the
/// pod terminates before running, and after the budget's poll attempts.
pub async fn wait_until_pod_running(
    client: &Client,
    namespace: &str,
    name: &str,
    budget: &RunBudget,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let interval = std::time::Duration::from_secs(budget.poll_interval_secs);

    for _ in 0..=budget.poll_attempts {
        let pod = pods.get(name).await?;
        match phase(&pod).as_str() {
            "Running" => return Ok(()),
            "Succeeded" => {
                return Err(Error::PodFailed(
                    "pod already succeeded before it begins running".to_string(),
                ));
            }
            "Failed" => return Err(Error::PodFailed(format!("pod {name} failed to start"))),
            other => {
                if let Some(message) = image_pull_failure(&pod) {
                    return Err(Error::ImagePull(message));
                }
                debug!(pod = name, phase = other, "waiting for pod to run");
            }
        }
        tokio::time::sleep(interval).await;
    }

    Err(Error::RolloutTimeout(format!(
        "pod {name} failed to enter running state"
    )))
}

/// Derived status string for a pod, as shown in the process list.
pub async fn pod_status(client: &Client, pod: &Pod) -> String {
    match phase(pod).as_str() {
        "Pending" => pending_status(client, pod).await.0,
        "Running" => {
            let readiness = readiness_status(pod);
            match readiness.as_str() {
                "Starting" | "Terminating" => readiness,
                "Running" if liveness_ok(pod) => readiness,
                _ => "Unknown".to_string(),
            }
        }
        other => other.to_string(),
    }
}

/// Name of the app container inside a pod, from its own labels.
pub fn container_name_in_pod(pod: &Pod) -> String {
    match pod.metadata.labels.as_ref() {
        Some(labels) => container_name_from_labels(labels),
        None => String::new(),
    }
}

/// Container name for a workload's label set: `<app>-<type>`.
pub fn container_name_from_labels(labels: &std::collections::BTreeMap<String, String>) -> String {
    format!(
        "{}-{}",
        labels.get(APP_LABEL).cloned().unwrap_or_default(),
        labels.get(TYPE_LABEL).cloned().unwrap_or_default(),
    )
}

/// Waiting reason and message of a pending pod's app container, falling
/// back to the latest event while the container is still being created.
async fn pending_status(client: &Client, pod: &Pod) -> (String, String) {
    let name = container_name_in_pod(pod);

    let waiting = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|cs| cs.name == name))
        .and_then(|cs| cs.state.as_ref())
        .and_then(|state| state.waiting.as_ref());

    let Some(waiting) = waiting else {
        return ("Pending".to_string(), String::new());
    };

    let reason = waiting.reason.clone().unwrap_or_default();
    let message = waiting.message.clone().unwrap_or_default();

    if reason == "ContainerCreating" {
        match pod_events(client, pod).await {
            Ok(events) => {
                if let Some(latest) = events.first() {
                    return (
                        latest.reason.clone().unwrap_or_default(),
                        latest.message.clone().unwrap_or_default(),
                    );
                }
            }
            Err(e) => warn!(error = %e, "listing events for pending pod"),
        }
    }

    (reason, message)
}

/// Image-pull failure message for any waiting, unready container.
pub(crate) fn image_pull_failure(pod: &Pod) -> Option<String> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    for cs in statuses {
        if cs.ready {
            continue;
        }
        let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) else {
            continue;
        };
        let reason = waiting.reason.clone().unwrap_or_default();
        if IMAGE_PULL_REASONS.contains(&reason.as_str()) {
            return Some(
                waiting
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("image pull failed: {reason}")),
            );
        }
    }
    None
}

fn classify_waiting(reason: &str, message: &str) -> Option<Error> {
    if !CONTAINER_ERRORS.contains(&reason) {
        return None;
    }
    if reason == "ErrImagePull" {
        Some(Error::ImagePull(message.to_string()))
    } else {
        Some(Error::PodFailed(format!("{reason}: {message}")))
    }
}

fn classify_event(reason: &str, message: &str) -> Error {
    match reason {
        "ErrImageNeverPull" | "InspectFailed" => Error::ImagePull(message.to_string()),
        _ => Error::PodFailed(message.to_string()),
    }
}

fn phase(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn container_ready(pod: &Pod, container_name: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .any(|cs| cs.name == container_name && cs.ready)
        })
        .unwrap_or(false)
}

/// Fine-grained running-pod status from the app container's state.
fn readiness_status(pod: &Pod) -> String {
    let name = container_name_in_pod(pod);
    let deleting = pod.metadata.deletion_timestamp.is_some();

    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref());

    if let Some(statuses) = statuses {
        for cs in statuses {
            if cs.name != name {
                continue;
            }
            if cs.ready {
                return if deleting { "Terminating" } else { "Running" }.to_string();
            }
            if let Some(state) = cs.state.as_ref() {
                if state.running.is_some() {
                    return "Starting".to_string();
                }
                if state.terminated.is_some() && deleting {
                    return "Terminating".to_string();
                }
            }
        }
    }

    "Unknown".to_string()
}

fn liveness_ok(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .all(|c| c.type_ != "Ready" || c.status == "True")
        })
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateWaiting, ContainerStatus,
        PodCondition, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn pod(app: &str, proctype: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{app}-{proctype}-abc12")),
                labels: Some(datacol_core::types::process_labels(app, proctype)),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn container_status(name: &str, ready: bool, state: Option<ContainerState>) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            ready,
            state,
            ..Default::default()
        }
    }

    fn waiting(reason: &str, message: &str) -> ContainerState {
        ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn container_name_comes_from_labels() {
        assert_eq!(container_name_in_pod(&pod("myapp", "web")), "myapp-web");
    }

    #[test]
    fn ready_container_is_running() {
        let mut p = pod("myapp", "web");
        p.status.as_mut().unwrap().container_statuses =
            Some(vec![container_status("myapp-web", true, None)]);
        assert_eq!(readiness_status(&p), "Running");
    }

    #[test]
    fn unready_but_running_container_is_starting() {
        let mut p = pod("myapp", "web");
        p.status.as_mut().unwrap().container_statuses = Some(vec![container_status(
            "myapp-web",
            false,
            Some(ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }),
        )]);
        assert_eq!(readiness_status(&p), "Starting");
    }

    #[test]
    fn deleting_pod_is_terminating() {
        let mut p = pod("myapp", "web");
        p.metadata.deletion_timestamp = Some(Time(Default::default()));
        p.status.as_mut().unwrap().container_statuses =
            Some(vec![container_status("myapp-web", true, None)]);
        assert_eq!(readiness_status(&p), "Terminating");
    }

    #[test]
    fn failed_ready_condition_breaks_liveness() {
        let mut p = pod("myapp", "web");
        p.status.as_mut().unwrap().conditions = Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: "False".to_string(),
            ..Default::default()
        }]);
        assert!(!liveness_ok(&p));
    }

    #[test]
    fn image_pull_reasons_are_detected() {
        let mut p = pod("myapp", "web");
        p.status.as_mut().unwrap().container_statuses = Some(vec![container_status(
            "myapp-web",
            false,
            Some(waiting("ImagePullBackOff", "Back-off pulling image")),
        )]);
        assert_eq!(
            image_pull_failure(&p).as_deref(),
            Some("Back-off pulling image")
        );

        p.status.as_mut().unwrap().container_statuses = Some(vec![container_status(
            "myapp-web",
            false,
            Some(waiting("ContainerCreating", "")),
        )]);
        assert!(image_pull_failure(&p).is_none());
    }

    #[test]
    fn waiting_reasons_classify_by_cause() {
        assert!(matches!(
            classify_waiting("ErrImagePull", "no such image"),
            Some(Error::ImagePull(_))
        ));
        assert!(matches!(
            classify_waiting("CrashLoopBackOff", "restarting"),
            Some(Error::PodFailed(_))
        ));
        assert!(classify_waiting("ContainerCreating", "").is_none());
    }

    #[test]
    fn events_sort_most_recent_first() {
        use k8s_openapi::chrono::{TimeZone, Utc};
        let stamp = |secs| Time(Utc.timestamp_opt(secs, 0).unwrap());

        let event = |reason: &str, secs| Event {
            reason: Some(reason.to_string()),
            last_timestamp: Some(stamp(secs)),
            ..Default::default()
        };

        let mut events = vec![event("Old", 100), event("New", 300), event("Mid", 200)];
        sort_events_recent_first(&mut events);
        let reasons: Vec<_> = events.iter().filter_map(|e| e.reason.clone()).collect();
        assert_eq!(reasons, vec!["New", "Mid", "Old"]);
    }
}
