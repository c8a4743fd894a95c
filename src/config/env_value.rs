// ABOUTME: Environment variable value types with interpolation support.
// ABOUTME: Handles literal values and references to environment variables.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Literal(String),
    FromEnv {
        #[serde(rename = "env")]
        var: String,
        #[serde(default)]
        default: Option<String>,
    },
}

impl EnvValue {
    pub fn resolve(&self) -> Result<String> {
        match self {
            EnvValue::Literal(s) => Ok(s.clone()),
            EnvValue::FromEnv { var, default } => match std::env::var(var) {
                Ok(val) => Ok(val),
                Err(_) => default
                    .clone()
                    .ok_or_else(|| Error::MissingEnvVar(var.clone())),
            },
        }
    }
}

/// Resolve a whole env map, failing on the first missing variable.
pub fn resolve_env_map(map: &HashMap<String, EnvValue>) -> Result<HashMap<String, String>> {
    map.iter()
        .map(|(k, v)| v.resolve().map(|resolved| (k.clone(), resolved)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_resolves_to_itself() {
        let v: EnvValue = serde_yaml::from_str("production").unwrap();
        assert_eq!(v.resolve().unwrap(), "production");
    }

    #[test]
    fn env_reference_resolves_from_environment() {
        temp_env::with_var("LOCKSTEP_TEST_DB_URL", Some("postgres://db"), || {
            let v: EnvValue = serde_yaml::from_str("env: LOCKSTEP_TEST_DB_URL").unwrap();
            assert_eq!(v.resolve().unwrap(), "postgres://db");
        });
    }

    #[test]
    fn missing_env_without_default_errors() {
        temp_env::with_var_unset("LOCKSTEP_TEST_MISSING", || {
            let v: EnvValue = serde_yaml::from_str("env: LOCKSTEP_TEST_MISSING").unwrap();
            assert!(matches!(v.resolve(), Err(Error::MissingEnvVar(_))));
        });
    }

    #[test]
    fn missing_env_with_default_uses_default() {
        temp_env::with_var_unset("LOCKSTEP_TEST_MISSING", || {
            let v: EnvValue = serde_yaml::from_str(
                r#"
env: LOCKSTEP_TEST_MISSING
default: fallback
"#,
            )
            .unwrap();
            assert_eq!(v.resolve().unwrap(), "fallback");
        });
    }
}
