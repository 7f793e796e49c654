//! TLS certificate attachment on the shared ingress.
//!
//! A certificate binds one domain to one TLS secret named
//! `<app>-<domain-with-dots-as-dashes>`. The ingress TLS section holds one
//! entry per domain; multi-host entries are not supported.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::{Ingress, IngressTLS};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tracing::{debug, warn};

use datacol_core::types::{app_labels, ingress_name, tls_secret_name};
use datacol_core::{Error, Provider, Result, is_already_exists, is_not_found};

/// Attach (or rotate) the certificate for `domain` on the shared ingress.
///
/// The TLS entry whose hosts include `domain` gets its secret reference
/// updated; a missing entry is appended. The cert/key pair is stored in a
/// `kubernetes.io/tls` secret labeled by app.
pub async fn update_tls_certificate(
    client: &Client,
    namespace: &str,
    app: &str,
    domain: &str,
    cert: &str,
    key: &str,
    provider: Provider,
) -> Result<()> {
    if !provider.supports_tls() {
        return Err(Error::Unsupported(format!(
            "TLS certificates are not implemented for {provider}"
        )));
    }

    let secret_name = tls_secret_name(app, domain);
    let ingresses: Api<Ingress> = Api::namespaced(client.clone(), namespace);
    let mut ing = ingresses.get(&ingress_name(namespace)).await?;

    let tls = ing
        .spec
        .get_or_insert_with(Default::default)
        .tls
        .get_or_insert_with(Default::default);
    upsert_tls_entry(tls, domain, &secret_name)?;

    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = tls_secret(app, &secret_name, cert, key);
    match secrets.create(&PostParams::default(), &secret).await {
        Ok(_) => debug!(secret = %secret_name, "tls secret created"),
        Err(e) if is_already_exists(&e) => {
            secrets
                .replace(&secret_name, &PostParams::default(), &secret)
                .await?;
            debug!(secret = %secret_name, "tls secret rotated");
        }
        Err(e) => return Err(e.into()),
    }

    let name = ing.metadata.name.clone().unwrap_or_default();
    ingresses.replace(&name, &PostParams::default(), &ing).await?;

    Ok(())
}

/// Detach the certificate for `domain` and delete its secret.
pub async fn delete_tls_certificate(
    client: &Client,
    namespace: &str,
    app: &str,
    domain: &str,
) -> Result<()> {
    let secret_name = tls_secret_name(app, domain);
    let ingresses: Api<Ingress> = Api::namespaced(client.clone(), namespace);

    match ingresses.get_opt(&ingress_name(namespace)).await? {
        Some(mut ing) => {
            if let Some(tls) = ing.spec.as_mut().and_then(|s| s.tls.as_mut()) {
                remove_tls_entry(tls, &secret_name);
            }
            let name = ing.metadata.name.clone().unwrap_or_default();
            ingresses.replace(&name, &PostParams::default(), &ing).await?;
        }
        None => warn!(namespace, "no shared ingress; removing secret only"),
    }

    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    match secrets.delete(&secret_name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Point the entry holding `domain` at `secret`, or append a new entry.
///
/// An entry covering several hosts cannot be retargeted per-domain, so it
/// is rejected.
fn upsert_tls_entry(tls: &mut Vec<IngressTLS>, domain: &str, secret: &str) -> Result<()> {
    let found = tls.iter_mut().find(|entry| {
        entry
            .hosts
            .as_ref()
            .is_some_and(|hosts| hosts.iter().any(|h| h == domain))
    });

    match found {
        Some(entry) => {
            let host_count = entry.hosts.as_ref().map(Vec::len).unwrap_or(0);
            if host_count > 1 {
                return Err(Error::Unsupported(format!(
                    "single certificate per domain; entry covers {:?}",
                    entry.hosts.as_deref().unwrap_or_default()
                )));
            }
            entry.secret_name = Some(secret.to_string());
        }
        None => tls.push(IngressTLS {
            hosts: Some(vec![domain.to_string()]),
            secret_name: Some(secret.to_string()),
        }),
    }

    Ok(())
}

/// Drop the entry referencing `secret`, if any.
fn remove_tls_entry(tls: &mut Vec<IngressTLS>, secret: &str) {
    tls.retain(|entry| entry.secret_name.as_deref() != Some(secret));
}

fn tls_secret(app: &str, name: &str, cert: &str, key: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(app_labels(app)),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        string_data: Some(BTreeMap::from([
            ("tls.crt".to_string(), cert.to_string()),
            ("tls.key".to_string(), key.to_string()),
        ])),
        ..Default::default()
    }
}
