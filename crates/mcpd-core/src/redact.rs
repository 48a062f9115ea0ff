use std::collections::BTreeMap;

/// Markers that flag an env or header key as carrying a secret.
const SECRET_KEY_MARKERS: &[&str] = &[
    "API_KEY",
    "APIKEY",
    "TOKEN",
    "SECRET",
    "PASSWORD",
    "PASSWD",
    "CREDENTIAL",
    "PRIVATE_KEY",
    "AUTHORIZATION",
    "AUTH",
];

const REDACTED: &str = "***";

pub fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase().replace('-', "_");
    SECRET_KEY_MARKERS
        .iter()
        .any(|marker| upper.contains(marker))
}

pub fn redact_value<'a>(key: &str, value: &'a str) -> &'a str {
    if is_sensitive_key(key) { REDACTED } else { value }
}

/// Deterministic `KEY=value` rendering of an env map, secrets redacted.
///
/// Sorted iteration keeps spawn logs byte-identical for identical specs.
pub fn format_env(env: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in env {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(redact_value(key, value));
    }
    out
}
