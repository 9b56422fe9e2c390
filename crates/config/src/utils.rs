use std::path::Path;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ConfigError;

/// Shared trait for configuration types loaded from YAML.
pub trait ConfigFile: DeserializeOwned + JsonSchema {
    /// Load and deserialize a YAML file into this type.
    fn load<P: AsRef<Path>>(
        path: P,
    ) -> impl std::future::Future<Output = Result<Self, ConfigError>> + Send
    where
        Self: Sized,
    {
        let path_buf = path.as_ref().to_path_buf();
        async move {
            let contents = tokio::fs::read_to_string(&path_buf).await.map_err(|e| {
                ConfigError::LoadFailed {
                    path: path_buf.clone(),
                    source: Arc::new(e),
                }
            })?;

            serde_yaml::from_str(&contents).map_err(|e| {
                let span_start = e.location().map(|loc| loc.index()).unwrap_or(0);
                let span_end = e.location().map(|loc| loc.index() + 1).unwrap_or(1);
                ConfigError::InvalidFormat {
                    path: path_buf,
                    details: e.to_string(),
                    content: contents,
                    span: (span_start..span_end).into(),
                }
            })
        }
    }
}

/// Validate a YAML document against the JSON schema generated for `T`.
pub fn validate_against_schema<T: JsonSchema>(
    yaml_str: &str,
    path: &Path,
) -> Result<(), ConfigError> {
    let value: Value = serde_yaml::from_str(yaml_str).map_err(|e| ConfigError::InvalidFormat {
        path: path.to_path_buf(),
        details: e.to_string(),
        content: yaml_str.to_string(),
        span: (0..1).into(),
    })?;

    let schema = schemars::schema_for!(T);
    let schema_value = serde_json::to_value(&schema).map_err(|e| ConfigError::SchemaCompile {
        details: e.to_string(),
    })?;

    if !jsonschema::is_valid(&schema_value, &value) {
        return Err(ConfigError::SchemaValidation {
            details: "document does not match the generated schema".to_string(),
            path: path.to_path_buf(),
            content: yaml_str.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_validation_accepts_defaults() {
        let yaml = serde_yaml::to_string(&crate::Config::default()).unwrap();
        validate_against_schema::<crate::Config>(&yaml, Path::new("lattice.yaml")).unwrap();
    }
}
