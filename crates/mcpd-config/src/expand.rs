//! `${VAR}` expansion over the parsed YAML node tree.

use mcpd_core::HostError;
use serde_yaml::Value;

/// Expands `${VAR}` references in every string scalar of `value`.
///
/// A scalar that consists of exactly one reference is reinterpreted after
/// expansion: if the substituted text parses as a YAML bool, number, or
/// null, the node takes that type (so `maxConcurrent: ${POOL_SIZE}` works).
/// Interpolations inside larger strings always stay strings. An undefined
/// variable is a configuration error, not an empty substitution.
pub fn expand_env_refs(
    value: &mut Value,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<(), HostError> {
    match value {
        Value::String(text) => {
            if !text.contains("${") {
                return Ok(());
            }
            let whole_ref = is_single_reference(text);
            let expanded = expand_str(text, lookup)?;
            *value = if whole_ref {
                reinterpret_scalar(expanded)
            } else {
                Value::String(expanded)
            };
            Ok(())
        }
        Value::Sequence(items) => {
            for item in items {
                expand_env_refs(item, lookup)?;
            }
            Ok(())
        }
        Value::Mapping(map) => {
            for (_key, entry) in map.iter_mut() {
                expand_env_refs(entry, lookup)?;
            }
            Ok(())
        }
        Value::Tagged(tagged) => expand_env_refs(&mut tagged.value, lookup),
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
    }
}

fn expand_str(text: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String, HostError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(HostError::InvalidConfig(format!(
                "unterminated ${{...}} reference in '{text}'"
            )));
        };
        let name = &after[..end];
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(HostError::InvalidConfig(format!(
                "invalid environment variable name '${{{name}}}' in catalog"
            )));
        }
        let Some(replacement) = lookup(name) else {
            return Err(HostError::InvalidConfig(format!(
                "undefined environment variable '{name}' referenced in catalog"
            )));
        };
        out.push_str(&replacement);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn is_single_reference(text: &str) -> bool {
    if !text.starts_with("${") || !text.ends_with('}') {
        return false;
    }
    let inner = &text[2..text.len() - 1];
    !inner.contains("${") && !inner.contains('}')
}

/// Reparses an expanded full-scalar reference as a plain YAML scalar.
fn reinterpret_scalar(expanded: String) -> Value {
    match serde_yaml::from_str::<Value>(&expanded) {
        Ok(v @ (Value::Bool(_) | Value::Number(_) | Value::Null)) => v,
        _ => Value::String(expanded),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "HOST" => Some("example.test".to_string()),
            "PORT" => Some("8443".to_string()),
            "VERBOSE" => Some("true".to_string()),
            "QUOTED" => Some(r#"va"lue: with yaml"#.to_string()),
            _ => None,
        }
    }

    #[test]
    fn interpolation_inside_string_stays_a_string() {
        let mut value: Value = serde_yaml::from_str("url: https://${HOST}:${PORT}/mcp").unwrap();
        expand_env_refs(&mut value, &lookup).unwrap();
        assert_eq!(
            value["url"],
            Value::String("https://example.test:8443/mcp".to_string())
        );
    }

    #[test]
    fn full_reference_is_reinterpreted_as_scalar() {
        let mut value: Value =
            serde_yaml::from_str("port: ${PORT}\nverbose: ${VERBOSE}").unwrap();
        expand_env_refs(&mut value, &lookup).unwrap();
        assert_eq!(value["port"], Value::Number(8443.into()));
        assert_eq!(value["verbose"], Value::Bool(true));
    }

    #[test]
    fn embedded_quotes_cannot_corrupt_the_document() {
        let mut value: Value = serde_yaml::from_str("token: ${QUOTED}").unwrap();
        expand_env_refs(&mut value, &lookup).unwrap();
        assert_eq!(
            value["token"],
            Value::String(r#"va"lue: with yaml"#.to_string())
        );
    }

    #[test]
    fn undefined_variable_is_rejected() {
        let mut value: Value = serde_yaml::from_str("x: ${MISSING_VAR}").unwrap();
        let err = expand_env_refs(&mut value, &lookup).unwrap_err();
        assert!(err.to_string().contains("MISSING_VAR"));
    }

    #[test]
    fn unterminated_reference_is_rejected() {
        let mut value: Value = serde_yaml::from_str("x: ${HOST").unwrap();
        assert!(expand_env_refs(&mut value, &lookup).is_err());
    }

    #[test]
    fn expansion_recurses_into_sequences_and_nested_maps() {
        let doc = "servers:\n  - env:\n      HOST: ${HOST}\n";
        let mut value: Value = serde_yaml::from_str(doc).unwrap();
        expand_env_refs(&mut value, &lookup).unwrap();
        assert_eq!(
            value["servers"][0]["env"]["HOST"],
            Value::String("example.test".to_string())
        );
    }
}
