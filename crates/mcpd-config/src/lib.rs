//! Catalog loading: YAML parse, `${VAR}` expansion, schema check, and
//! semantic validation. Produces an immutable [`Catalog`] or a single
//! `InvalidConfig` error; no instance is ever started from a bad catalog.

use std::path::{Path, PathBuf};

use mcpd_core::{Catalog, HostError};

mod expand;
mod raw;
mod validate;

pub use expand::expand_env_refs;
pub use validate::validate_catalog;

/// `~/.config/mcpd/catalog.yaml`, following the platform config directory.
pub fn default_catalog_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "mcpd")
        .map(|dirs| dirs.config_dir().join("catalog.yaml"))
        .unwrap_or_else(|| PathBuf::from("/etc/mcpd/catalog.yaml"))
}

pub fn load_catalog(path: &Path) -> Result<Catalog, HostError> {
    let text = std::fs::read_to_string(path).map_err(|error| {
        HostError::InvalidConfig(format!(
            "failed to read catalog {}: {error}",
            path.display()
        ))
    })?;
    parse_catalog(&text, &|name| std::env::var(name).ok())
}

/// Parses catalog text with an explicit env lookup (injectable for tests).
pub fn parse_catalog(
    text: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Catalog, HostError> {
    let mut value: serde_yaml::Value = serde_yaml::from_str(text)
        .map_err(|error| HostError::InvalidConfig(format!("catalog is not valid YAML: {error}")))?;

    // Env references expand on the parsed node tree, not the raw text, so a
    // value containing quotes or colons cannot corrupt the document syntax.
    expand::expand_env_refs(&mut value, lookup)?;

    let raw: raw::RawCatalog = serde_yaml::from_value(value)
        .map_err(|error| HostError::InvalidConfig(format!("catalog schema: {error}")))?;
    let catalog = raw.into_catalog()?;
    validate::validate_catalog(&catalog)?;
    Ok(catalog)
}

#[cfg(test)]
#[path = "loader_tests.rs"]
mod tests;
