//! Shared-ingress reconciliation.
//!
//! The shared object is mutated by every app in the namespace, so the
//! update is a bounded get-latest, merge, update loop that retries on
//! optimistic-concurrency conflicts instead of silently overwriting a
//! co-tenant's concurrent edit.

use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, warn};

use datacol_core::{DeployResponse, Result, is_conflict};

use crate::controller::IngressController;
use crate::merge::{app_ingress, merge_ingress_rules};

/// Attempts before a persistent update conflict is surfaced to the caller.
const UPDATE_ATTEMPTS: u32 = 3;

/// Converge the namespace's shared ingress onto the app's desired rules.
///
/// On providers that manage their own controller this first bootstraps it
/// (idempotently). The ingress itself is created when missing; otherwise
/// the app's rules are merged into the latest copy and updated, retrying a
/// bounded number of times when another writer won the race.
pub async fn reconcile_ingress(client: &Client, payload: &DeployResponse) -> Result<Ingress> {
    let req = &payload.request;

    if req.provider.manages_ingress_controller() {
        debug!(namespace = %req.namespace, "ensuring ingress controller");
        IngressController::new(client.clone(), &req.namespace)
            .reconcile()
            .await?;
    }

    let desired = app_ingress(payload);
    let name = desired.metadata.name.clone().unwrap_or_default();
    let ingresses: Api<Ingress> = Api::namespaced(client.clone(), &req.namespace);

    let mut attempt = 0;
    loop {
        match ingresses.get_opt(&name).await? {
            None => {
                debug!(ingress = %name, "creating shared ingress");
                return Ok(ingresses.create(&PostParams::default(), &desired).await?);
            }
            Some(mut existing) => {
                merge_ingress_rules(&mut existing, &desired);
                match ingresses
                    .replace(&name, &PostParams::default(), &existing)
                    .await
                {
                    Ok(updated) => {
                        debug!(ingress = %name, "shared ingress updated");
                        return Ok(updated);
                    }
                    Err(e) if is_conflict(&e) && attempt + 1 < UPDATE_ATTEMPTS => {
                        attempt += 1;
                        warn!(
                            ingress = %name,
                            attempt,
                            "ingress update conflict, retrying with latest"
                        );
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}
