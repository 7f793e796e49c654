//! Cloud provider capability table.
//!
//! Ingress behavior is the only place the engine branches on the cloud it
//! runs against, so the differences are kept in one table instead of
//! scattered conditionals: the path syntax the provider's load balancer
//! understands, whether an ingress-class annotation is required, and whether
//! the engine itself must bootstrap an ingress controller.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The cloud provider a stack runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Gcp,
    #[default]
    Local,
}

impl Provider {
    /// HTTP path used in ingress rules.
    ///
    /// The GCP load balancer does not route subresources for a bare `/`,
    /// so it gets `/*`.
    pub fn ingress_path(self) -> &'static str {
        match self {
            Provider::Gcp => "/*",
            _ => "/",
        }
    }

    /// Ingress path type matching [`Provider::ingress_path`].
    pub fn ingress_path_type(self) -> &'static str {
        match self {
            Provider::Gcp => "ImplementationSpecific",
            _ => "Prefix",
        }
    }

    /// Value of the `kubernetes.io/ingress.class` annotation, when one is
    /// required to claim the ingress for a specific controller.
    pub fn ingress_class(self) -> Option<&'static str> {
        match self {
            Provider::Aws => Some("nginx"),
            _ => None,
        }
    }

    /// Whether the engine bootstraps its own ingress controller.
    ///
    /// GCP ships an implicit controller and `local` is assumed to have one
    /// (minikube addon or similar); on AWS the engine deploys nginx itself.
    pub fn manages_ingress_controller(self) -> bool {
        matches!(self, Provider::Aws)
    }

    /// Whether TLS certificates can be attached to the shared ingress.
    pub fn supports_tls(self) -> bool {
        !matches!(self, Provider::Gcp)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Gcp => "gcp",
            Provider::Local => "local",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws" => Ok(Provider::Aws),
            "gcp" => Ok(Provider::Gcp),
            "local" => Ok(Provider::Local),
            other => Err(Error::validation(format!("unknown provider {other:?}"))),
        }
    }
}
