//! Environment-driven run configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use formbridge_adapters::{ExtractionRules, TypeformConfig};
use formbridge_storage::{DestinationSchema, HttpClientConfig, NotionConfig};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("invalid value `{value}` for {var}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct TypeformCredentials {
    pub token: String,
    pub form_id: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub notion_token: String,
    pub notion_db_id: String,
    pub typeform: Option<TypeformCredentials>,
    pub rules_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub pacing: Duration,
    pub schedule_cron: String,
}

impl SyncConfig {
    /// Read the process environment. Typeform credentials are required only
    /// when `require_typeform` is set; every missing variable is reported at once.
    pub fn from_env(require_typeform: bool) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok(), require_typeform)
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        require_typeform: bool,
    ) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut missing = Vec::new();
        let mut required = |key: &str| {
            let value = get(key);
            if value.is_none() {
                missing.push(key.to_string());
            }
            value.unwrap_or_default()
        };
        let notion_token = required("NOTION_TOKEN");
        let notion_db_id = required("NOTION_DB_ID");
        let typeform = if require_typeform {
            Some(TypeformCredentials {
                token: required("TYPEFORM_TOKEN"),
                form_id: required("TYPEFORM_FORM_ID"),
            })
        } else {
            match (get("TYPEFORM_TOKEN"), get("TYPEFORM_FORM_ID")) {
                (Some(token), Some(form_id)) => Some(TypeformCredentials { token, form_id }),
                _ => None,
            }
        };
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        Ok(Self {
            notion_token,
            notion_db_id,
            typeform,
            rules_dir: get("FORMBRIDGE_RULES_DIR").map(PathBuf::from),
            user_agent: get("FORMBRIDGE_USER_AGENT")
                .unwrap_or_else(|| "formbridge/0.1".to_string()),
            http_timeout_secs: parse_number(&get, "FORMBRIDGE_HTTP_TIMEOUT_SECS", 30)?,
            pacing: Duration::from_millis(parse_number(&get, "FORMBRIDGE_PACING_MS", 350)?),
            schedule_cron: get("FORMBRIDGE_SCHEDULE_CRON")
                .unwrap_or_else(|| "0 0 6 * * *".to_string()),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            pacing: (!self.pacing.is_zero()).then_some(self.pacing),
            ..HttpClientConfig::default()
        }
    }

    pub fn notion_config(&self) -> NotionConfig {
        NotionConfig::new(&self.notion_token, &self.notion_db_id)
    }

    pub fn typeform_config(&self) -> Option<TypeformConfig> {
        self.typeform
            .as_ref()
            .map(|creds| TypeformConfig::new(&creds.token, &creds.form_id))
    }

    pub fn extraction_rules(&self) -> Result<ExtractionRules> {
        match &self.rules_dir {
            Some(dir) => ExtractionRules::from_dir(dir),
            None => ExtractionRules::builtin(),
        }
    }

    /// Destination schema with the profile properties of the routing layout.
    pub fn destination_schema(&self, rules: &ExtractionRules) -> Result<DestinationSchema> {
        let schema = match &self.rules_dir {
            Some(dir) if dir.join("destination.yaml").exists() => {
                DestinationSchema::from_path(dir.join("destination.yaml"))?
            }
            _ => DestinationSchema::builtin()?,
        };
        Ok(schema.with_profile_properties(rules.routing.layout.properties()))
    }
}

fn parse_number(
    get: &impl Fn(&str) -> Option<String>,
    var: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|err: std::num::ParseIntError| ConfigError::Invalid {
            var: var.to_string(),
            value,
            reason: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn every_missing_variable_is_listed() {
        let err = SyncConfig::from_lookup(lookup(&[("NOTION_DB_ID", " ")]), true).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing(vec![
                "NOTION_TOKEN".into(),
                "NOTION_DB_ID".into(),
                "TYPEFORM_TOKEN".into(),
                "TYPEFORM_FORM_ID".into(),
            ])
        );
    }

    #[test]
    fn defaults_apply_and_typeform_is_optional() {
        let config = SyncConfig::from_lookup(
            lookup(&[("NOTION_TOKEN", "secret"), ("NOTION_DB_ID", "db"), ("TYPEFORM_TOKEN", "t")]),
            false,
        )
        .unwrap();
        assert!(config.typeform.is_none());
        assert_eq!(config.pacing, Duration::from_millis(350));
        assert_eq!(config.http_timeout_secs, 30);
        assert!(config.http_client_config().pacing.is_some());
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = SyncConfig::from_lookup(
            lookup(&[
                ("NOTION_TOKEN", "secret"),
                ("NOTION_DB_ID", "db"),
                ("FORMBRIDGE_PACING_MS", "fast"),
            ]),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var, .. } if var == "FORMBRIDGE_PACING_MS"));
    }

    #[test]
    fn schema_picks_up_profile_properties() {
        let config = SyncConfig::from_lookup(
            lookup(&[("NOTION_TOKEN", "secret"), ("NOTION_DB_ID", "db")]),
            false,
        )
        .unwrap();
        let rules = config.extraction_rules().unwrap();
        let schema = config.destination_schema(&rules).unwrap();
        assert!(schema.profile_properties.iter().any(|p| p == "Household Notes"));
        assert_eq!(schema.title_property, "Task name");
    }
}
