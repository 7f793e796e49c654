//! Resource constraint parsing and merging.
//!
//! Limits arrive as strings of the form `<limit>` or `<limit>/<request>`
//! (for example `"500m/250m"` for cpu, `"1Gi"` for memory). Each half is
//! validated as a Kubernetes quantity before it is written into a container
//! spec; the entries of other resource names are left untouched.

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::{Error, Result};

/// Quantity suffixes accepted by the API server.
const SUFFIXES: &[&str] = &[
    "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "m", "k", "M", "G", "T", "P", "E",
];

/// Parse a Kubernetes quantity string, validating the format.
///
/// Accepts a decimal number followed by an optional binary (`Ki`..`Ei`) or
/// decimal (`m`, `k`..`E`) suffix, or a decimal exponent (`1e3`). The
/// canonical string is preserved in the returned [`Quantity`].
pub fn parse_quantity(s: &str) -> Result<Quantity> {
    let (number, rest) = split_number(s);
    if number.is_empty() {
        return Err(Error::QuantityParse(s.to_string()));
    }

    let valid_suffix = rest.is_empty()
        || SUFFIXES.contains(&rest)
        || is_exponent(rest);
    if !valid_suffix {
        return Err(Error::QuantityParse(s.to_string()));
    }

    Ok(Quantity(s.to_string()))
}

fn split_number(s: &str) -> (&str, &str) {
    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in s.char_indices() {
        match c {
            '0'..='9' => end = i + c.len_utf8(),
            '.' if !seen_dot && i > 0 => {
                seen_dot = true;
                end = i + 1;
            }
            _ => break,
        }
    }
    (&s[..end], &s[end..])
}

fn is_exponent(rest: &str) -> bool {
    let Some(digits) = rest.strip_prefix(['e', 'E']) else {
        return false;
    };
    let digits = digits.strip_prefix(['+', '-']).unwrap_or(digits);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Merge a constraint spec for one resource name into a container.
///
/// `spec` is `<limit>` or `<limit>/<request>`; an empty half is skipped, an
/// empty spec is a no-op, and the literal `"0"` clears both entries for the
/// resource. Malformed quantities fail without touching the container.
pub fn merge_resource_constraints(name: &str, container: &mut Container, spec: &str) -> Result<()> {
    if spec.is_empty() {
        return Ok(());
    }

    if spec == "0" {
        let resources = container.resources.get_or_insert_with(Default::default);
        if let Some(limits) = resources.limits.as_mut() {
            limits.remove(name);
        }
        if let Some(requests) = resources.requests.as_mut() {
            requests.remove(name);
        }
        tracing::debug!(resource = name, "cleared resource constraints");
        return Ok(());
    }

    let (limit, request) = match spec.split_once('/') {
        Some((limit, request)) => (limit, Some(request)),
        None => (spec, None),
    };

    // Validate both halves before writing either.
    let limit = if limit.is_empty() {
        None
    } else {
        Some(parse_quantity(limit)?)
    };
    let request = match request {
        Some("") | None => None,
        Some(r) => Some(parse_quantity(r)?),
    };

    let resources = container.resources.get_or_insert_with(Default::default);
    if let Some(value) = limit {
        tracing::debug!(resource = name, limit = %value.0, "setting limit");
        resources
            .limits
            .get_or_insert_with(Default::default)
            .insert(name.to_string(), value);
    }
    if let Some(value) = request {
        tracing::debug!(resource = name, request = %value.0, "setting request");
        resources
            .requests
            .get_or_insert_with(Default::default)
            .insert(name.to_string(), value);
    }

    Ok(())
}

/// Render a container's constraints for one resource name back into the
/// `<limit>` / `<limit>/<request>` spec form. Empty when neither is set.
pub fn format_request_limit(container: &Container, name: &str) -> String {
    let Some(resources) = container.resources.as_ref() else {
        return String::new();
    };

    let limit = resources
        .limits
        .as_ref()
        .and_then(|m| m.get(name))
        .map(|q| q.0.clone());
    let request = resources
        .requests
        .as_ref()
        .and_then(|m| m.get(name))
        .map(|q| q.0.clone());

    match (limit, request) {
        (Some(l), Some(r)) => format!("{l}/{r}"),
        (Some(l), None) => l,
        (None, Some(r)) => format!("/{r}"),
        (None, None) => String::new(),
    }
}
