//! Environment variable placeholder resolution for server definitions.
//!
//! Grounded on `config::parse_env_ref`/`resolve_env_vars`, generalized from the
//! single `${VAR}` form to the three forms the catalog format allows: strict
//! `${VAR}`, defaulted `${VAR:-default}` / `${VAR-default}`, and the
//! PowerShell-style `$env:VAR` whole-value form.

use crate::error::{HubError, Result};
use std::collections::BTreeSet;

/// Resolve one string value, looking up referenced variables via `lookup`.
///
/// Returns the resolved string, or the sorted, deduplicated list of variable
/// names that were required but unresolved. A string containing no recognized
/// placeholder is returned unchanged — this function is idempotent on such
/// strings.
pub fn resolve_value(value: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    if let Some(name) = value.strip_prefix("$env:") {
        return lookup(name)
            .ok_or_else(|| HubError::MissingEnv(vec![name.to_string()]))
    }

    let mut out = String::with_capacity(value.len());
    let mut missing = BTreeSet::new();
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated placeholder — treat the rest of the string as literal.
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let body = &after[..end];
        rest = &after[end + 1..];

        let (name, default) = split_default(body);
        match lookup(name) {
            Some(v) if !v.is_empty() || default.is_none() => out.push_str(&v),
            Some(_) | None => {
                if let Some(default) = default {
                    out.push_str(default);
                } else {
                    missing.insert(name.to_string());
                }
            }
        }
    }
    out.push_str(rest);

    if !missing.is_empty() {
        return Err(HubError::MissingEnv(missing.into_iter().collect()));
    }
    Ok(out)
}

/// Split `NAME:-default` / `NAME-default` / `NAME:default` into
/// `(name, Some(default))`, or `(body, None)` when there is no default clause.
fn split_default(body: &str) -> (&str, Option<&str>) {
    if let Some(idx) = body.find(":-") {
        return (&body[..idx], Some(&body[idx + 2..]));
    }
    if let Some(idx) = body.find('-') {
        return (&body[..idx], Some(&body[idx + 1..]));
    }
    if let Some(idx) = body.find(':') {
        return (&body[..idx], Some(&body[idx + 1..]));
    }
    (body, None)
}

/// Resolve every value in a map against the real process environment,
/// collecting the sorted union of all missing variable names across all
/// entries into a single error, rather than failing on the first one.
pub fn resolve_map(env: &std::collections::HashMap<String, String>) -> Result<std::collections::HashMap<String, String>> {
    let mut resolved = std::collections::HashMap::with_capacity(env.len());
    let mut missing = BTreeSet::new();

    for (key, value) in env {
        match resolve_value(value, |name| std::env::var(name).ok()) {
            Ok(v) => {
                resolved.insert(key.clone(), v);
            }
            Err(HubError::MissingEnv(names)) => missing.extend(names),
            Err(other) => return Err(other),
        }
    }

    if !missing.is_empty() {
        return Err(HubError::MissingEnv(missing.into_iter().collect()));
    }
    Ok(resolved)
}
