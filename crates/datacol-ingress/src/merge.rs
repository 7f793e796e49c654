//! Ingress rule manifests and the shared-ingress merge.
//!
//! `merge_ingress_rules` folds one app's desired rules into the shared
//! object: same-host rules are replaced, new hosts appended, and hosts the
//! app no longer claims are dropped. A rule is recognized as the app's own
//! by its backend identity (service name + port), so rules backed by other
//! apps' services are never touched.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use datacol_core::types::{
    DEFAULT_INGRESS_DOMAIN, HERITAGE, MANAGED_BY_LABEL, ingress_name,
};
use datacol_core::DeployResponse;

/// Annotation claiming an ingress for a specific controller class.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Build one rule per domain, all backed by the same service and port.
pub fn ingress_rules_manifest(
    service: &str,
    path: &str,
    path_type: &str,
    port: i32,
    domains: &[String],
) -> Vec<IngressRule> {
    domains
        .iter()
        .map(|domain| IngressRule {
            host: Some(domain.clone()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some(path.to_string()),
                    path_type: path_type.to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: service.to_string(),
                            port: Some(ServiceBackendPort {
                                number: Some(port),
                                ..Default::default()
                            }),
                        }),
                        ..Default::default()
                    },
                }],
            }),
        })
        .collect()
}

/// Desired shared-ingress contribution for one reconciled app.
///
/// When the request carries no domains a host under the default domain is
/// synthesized so the workload is still routable.
pub fn app_ingress(payload: &DeployResponse) -> Ingress {
    let req = &payload.request;

    let mut domains = req.domains.clone();
    if domains.is_empty() {
        domains.push(format!("{}.{}", req.service_id, DEFAULT_INGRESS_DOMAIN));
    }

    let rules = ingress_rules_manifest(
        &req.service_id,
        req.provider.ingress_path(),
        req.provider.ingress_path_type(),
        req.container_port,
        &domains,
    );

    let mut annotations = BTreeMap::new();
    if let Some(class) = req.provider.ingress_class() {
        annotations.insert(INGRESS_CLASS_ANNOTATION.to_string(), class.to_string());
    }

    Ingress {
        metadata: ObjectMeta {
            name: Some(ingress_name(&req.namespace)),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                HERITAGE.to_string(),
            )])),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(rules),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Merge `source` (one app's full desired rule set) into `dest` (the live
/// shared ingress).
///
/// Same-host rules are replaced in place, unseen hosts appended. Then any
/// `dest` rule whose backend matches one of `source`'s backends but whose
/// host is absent from `source` is removed, which is how dropping a domain
/// from an app propagates. Rules backed by other services survive untouched.
pub fn merge_ingress_rules(dest: &mut Ingress, source: &Ingress) {
    let source_rules = source
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .cloned()
        .unwrap_or_default();

    let dest_rules = dest
        .spec
        .get_or_insert_with(Default::default)
        .rules
        .get_or_insert_with(Default::default);

    for rule in &source_rules {
        match dest_rules.iter().position(|r| r.host == rule.host) {
            Some(i) => dest_rules[i] = rule.clone(),
            None => dest_rules.push(rule.clone()),
        }
    }

    let source_backends: Vec<String> =
        source_rules.iter().filter_map(backend_id).collect();

    dest_rules.retain(|rule| {
        let related = backend_id(rule)
            .map(|id| source_backends.contains(&id))
            .unwrap_or(false);
        let host_kept = source_rules.iter().any(|r| r.host == rule.host);
        !related || host_kept
    });

    tracing::debug!(rules = dest_rules.len(), "merged ingress rules");
}

/// Backend identity of a rule: `<service>:<port>`.
fn backend_id(rule: &IngressRule) -> Option<String> {
    let backend = &rule.http.as_ref()?.paths.first()?.backend;
    let service = backend.service.as_ref()?;
    let port = service
        .port
        .as_ref()
        .and_then(|p| p.number)
        .unwrap_or_default();
    Some(format!("{}:{}", service.name, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domains(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn ingress_for(service: &str, hosts: &[&str]) -> Ingress {
        Ingress {
            spec: Some(IngressSpec {
                rules: Some(ingress_rules_manifest(
                    service,
                    "/",
                    "Prefix",
                    80,
                    &domains(hosts),
                )),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn hosts_of(ing: &Ingress) -> Vec<String> {
        ing.spec
            .as_ref()
            .and_then(|s| s.rules.as_ref())
            .map(|rules| {
                rules
                    .iter()
                    .filter_map(|r| r.host.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    }

    #[test]
    fn merge_is_idempotent() {
        let mut dest = ingress_for("app1-web", &["a1.com", "a2.com"]);
        let source = ingress_for("app1-web", &["a1.com", "a2.com"]);

        merge_ingress_rules(&mut dest, &source);
        let first = hosts_of(&dest);
        merge_ingress_rules(&mut dest, &source);
        assert_eq!(first, hosts_of(&dest));
        assert_eq!(first, vec!["a1.com", "a2.com"]);
    }

    #[test]
    fn merge_appends_other_apps_rules() {
        let mut dest = ingress_for("app1-web", &["a1.com"]);
        let source = ingress_for("app2-web", &["a2.com"]);

        merge_ingress_rules(&mut dest, &source);
        assert_eq!(hosts_of(&dest), vec!["a1.com", "a2.com"]);

        // Re-merging the same app changes nothing.
        merge_ingress_rules(&mut dest, &source);
        assert_eq!(hosts_of(&dest).len(), 2);
    }

    #[test]
    fn merge_replaces_a_moved_host() {
        let mut dest = ingress_for("app1-web", &["a1.com"]);
        merge_ingress_rules(&mut dest, &ingress_for("app2-web", &["a2.com"]));

        // app2 renames its host; its old rule goes, app1's stays.
        merge_ingress_rules(&mut dest, &ingress_for("app2-web", &["b1.com"]));
        assert_eq!(hosts_of(&dest), vec!["a1.com", "b1.com"]);
    }

    #[test]
    fn merge_adds_a_new_host_for_the_same_app() {
        let mut dest = ingress_for("app1-web", &["a.com"]);
        merge_ingress_rules(&mut dest, &ingress_for("app1-web", &["a.com", "b.com"]));
        assert_eq!(hosts_of(&dest), vec!["a.com", "b.com"]);
    }

    #[test]
    fn merge_removes_dropped_hosts_of_the_same_app() {
        let mut dest = ingress_for("app1-web", &["a1.com", "a2.com"]);
        merge_ingress_rules(&mut dest, &ingress_for("app1-web", &["a1.com"]));
        assert_eq!(hosts_of(&dest), vec!["a1.com"]);
    }

    #[test]
    fn merge_removal_spares_other_apps() {
        let mut dest = ingress_for("app1-web", &["a1.com", "a2.com"]);
        merge_ingress_rules(&mut dest, &ingress_for("app2-web", &["b1.com"]));

        // app1 drops a2.com; app2's rule must survive.
        merge_ingress_rules(&mut dest, &ingress_for("app1-web", &["a1.com"]));
        assert_eq!(hosts_of(&dest), vec!["a1.com", "b1.com"]);
    }

    #[test]
    fn merge_into_empty_is_a_noop_for_removals() {
        let mut dest = ingress_for("app1-web", &[]);
        merge_ingress_rules(&mut dest, &ingress_for("app1-web", &[]));
        assert!(hosts_of(&dest).is_empty());
    }

    #[test]
    fn removing_the_only_host_leaves_the_rest() {
        let mut dest = ingress_for("app1-web", &["a.com"]);
        merge_ingress_rules(&mut dest, &ingress_for("app2-web", &["b.com"]));

        // app1 replaces a.com with c.com; a.com goes, b.com survives.
        merge_ingress_rules(&mut dest, &ingress_for("app1-web", &["c.com"]));
        let hosts = hosts_of(&dest);
        assert!(hosts.contains(&"b.com".to_string()));
        assert!(hosts.contains(&"c.com".to_string()));
        assert!(!hosts.contains(&"a.com".to_string()));
    }

    #[test]
    fn app_ingress_synthesizes_a_default_domain() {
        let req = datacol_core::DeployRequest {
            app: "myapp".into(),
            proctype: "web".into(),
            service_id: "myapp-web".into(),
            namespace: "prod".into(),
            container_port: 8080,
            ..Default::default()
        };
        let ing = app_ingress(&DeployResponse {
            request: req,
            node_port: 0,
        });
        assert_eq!(ing.metadata.name.as_deref(), Some("prod-ing"));
        assert_eq!(hosts_of(&ing), vec!["myapp-web.datacol.io"]);
    }

    #[test]
    fn app_ingress_annotates_class_on_aws() {
        let mut req = datacol_core::DeployRequest {
            service_id: "myapp-web".into(),
            namespace: "prod".into(),
            provider: datacol_core::Provider::Aws,
            ..Default::default()
        };
        req.domains = domains(&["a.example.com"]);
        let ing = app_ingress(&DeployResponse {
            request: req.clone(),
            node_port: 0,
        });
        assert_eq!(
            ing.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(INGRESS_CLASS_ANNOTATION))
                .map(String::as_str),
            Some("nginx")
        );

        req.provider = datacol_core::Provider::Local;
        let ing = app_ingress(&DeployResponse {
            request: req,
            node_port: 0,
        });
        assert!(
            ing.metadata
                .annotations
                .as_ref()
                .is_none_or(|a| !a.contains_key(INGRESS_CLASS_ANNOTATION))
        );
    }
}
