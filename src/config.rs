//! Fabric configuration — environment variables, optional TOML file, validation.
//!
//! Every process in the fabric (registry, gateway, services, the CLI) is
//! configured from the same `YAMF_*` environment variables, optionally
//! layered over a `yamf.toml` file. Environment always wins over the file,
//! and the file over built-in defaults.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::YamfError;

/// Default number of retry attempts for registry calls during service setup.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Default initial retry delay in milliseconds (scales linearly per attempt).
pub const DEFAULT_RETRY_DELAY_MS: u64 = 20;

/// Default bound on port-collision retries during service registration.
pub const DEFAULT_REGISTRATION_RETRY_LIMIT: u32 = 50;

/// Deployment environment string, matched by substring.
///
/// Environment strings containing `prod` or `staging` disable dev-only
/// endpoints and make the registry token mandatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment(String);

impl Environment {
    pub fn new(name: impl Into<String>) -> Self {
        Environment(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for production and staging deployments (substring match, so
    /// `production`, `prod-eu`, and `staging-2` all qualify).
    pub fn is_production_like(&self) -> bool {
        self.0.contains("prod") || self.0.contains("staging")
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment("dev".to_string())
    }
}

/// Shared configuration for every fabric process.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Registry base URL. Required by services and the gateway.
    pub registry_url: String,
    /// Gateway base URL. Required by the registry to send `registry-updated`.
    pub gateway_url: Option<String>,
    /// Shared secret for protected commands. Required in staging/production.
    pub registry_token: Option<String>,
    /// Explicit service hostname (scheme://host, no port unless pinned).
    pub service_url: Option<String>,
    /// Retry attempts for registry calls (linear backoff).
    pub retry_limit: u32,
    /// Initial retry delay in milliseconds.
    pub retry_delay_ms: u64,
    /// Max port-collision retries during registration.
    pub registration_retry_limit: u32,
    /// Deployment environment.
    pub environment: Environment,
}

impl Default for FabricConfig {
    fn default() -> Self {
        FabricConfig {
            registry_url: "http://127.0.0.1:7654".to_string(),
            gateway_url: None,
            registry_token: None,
            service_url: None,
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            registration_retry_limit: DEFAULT_REGISTRATION_RETRY_LIMIT,
            environment: Environment::default(),
        }
    }
}

/// File-level configuration, parsed from `yamf.toml`. All fields optional;
/// anything absent falls back to the defaults in [`FabricConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub registry_url: Option<String>,
    pub gateway_url: Option<String>,
    pub registry_token: Option<String>,
    pub service_url: Option<String>,
    pub retry_limit: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub registration_retry_limit: Option<u32>,
    pub environment: Option<String>,
}

impl FabricConfig {
    /// Build from the process environment alone.
    pub fn from_env() -> Self {
        Self::from_env_map(&std::env::vars().collect())
    }

    /// Build from the process environment layered over a TOML file.
    pub fn from_env_and_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            YamfError::Validation(format!("failed to read config file {}: {e}", path.display()))
        })?;
        let file: FileConfig = toml::from_str(&content).map_err(|e| {
            YamfError::Validation(format!("failed to parse config file {}: {e}", path.display()))
        })?;
        let mut config = Self::from_file_config(file);
        config.apply_env(&std::env::vars().collect());
        Ok(config)
    }

    /// Build from an explicit environment map (testable without touching
    /// the process environment).
    pub fn from_env_map(env: &HashMap<String, String>) -> Self {
        let mut config = FabricConfig::default();
        config.apply_env(env);
        config
    }

    fn from_file_config(file: FileConfig) -> Self {
        let defaults = FabricConfig::default();
        FabricConfig {
            registry_url: file.registry_url.unwrap_or(defaults.registry_url),
            gateway_url: file.gateway_url,
            registry_token: file.registry_token,
            service_url: file.service_url,
            retry_limit: file.retry_limit.unwrap_or(defaults.retry_limit),
            retry_delay_ms: file.retry_delay_ms.unwrap_or(defaults.retry_delay_ms),
            registration_retry_limit: file
                .registration_retry_limit
                .unwrap_or(defaults.registration_retry_limit),
            environment: file
                .environment
                .map(Environment::new)
                .unwrap_or_default(),
        }
    }

    fn apply_env(&mut self, env: &HashMap<String, String>) {
        if let Some(url) = non_empty(env, "YAMF_REGISTRY_URL") {
            self.registry_url = url;
        }
        if let Some(url) = non_empty(env, "YAMF_GATEWAY_URL") {
            self.gateway_url = Some(url);
        }
        if let Some(token) = non_empty(env, "YAMF_REGISTRY_TOKEN") {
            self.registry_token = Some(token);
        }
        if let Some(url) = non_empty(env, "YAMF_SERVICE_URL") {
            self.service_url = Some(url);
        }
        if let Some(limit) = parse_env(env, "YAMF_RETRY_LIMIT") {
            self.retry_limit = limit;
        }
        if let Some(delay) = parse_env(env, "YAMF_RETRY_DELAY") {
            self.retry_delay_ms = delay;
        }
        if let Some(limit) = parse_env(env, "YAMF_REGISTRATION_RETRY_LIMIT") {
            self.registration_retry_limit = limit;
        }
        if let Some(name) = non_empty(env, "ENVIRONMENT") {
            self.environment = Environment::new(name);
        }
    }

    /// Fail fast before serving registry traffic.
    ///
    /// A production-like environment without a configured registry token
    /// would leave every mutating command unprotected, so the registry
    /// refuses to start.
    pub fn validate_for_registry(&self) -> crate::Result<()> {
        if self.environment.is_production_like() && self.registry_token.is_none() {
            return Err(YamfError::Validation(format!(
                "YAMF_REGISTRY_TOKEN is required in the '{}' environment",
                self.environment.as_str()
            )));
        }
        Ok(())
    }

    /// Registry token required on protected commands, when configured.
    pub fn token(&self) -> Option<&str> {
        self.registry_token.as_deref()
    }
}

fn non_empty(env: &HashMap<String, String>, key: &str) -> Option<String> {
    env.get(key).filter(|v| !v.is_empty()).cloned()
}

fn parse_env<T: std::str::FromStr>(env: &HashMap<String, String>, key: &str) -> Option<T> {
    env.get(key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = FabricConfig::from_env_map(&HashMap::new());
        assert_eq!(config.retry_limit, 3);
        assert_eq!(config.retry_delay_ms, 20);
        assert_eq!(config.registration_retry_limit, 50);
        assert_eq!(config.environment.as_str(), "dev");
        assert!(config.registry_token.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let env = env_of(&[
            ("YAMF_REGISTRY_URL", "http://registry:9000"),
            ("YAMF_GATEWAY_URL", "http://gateway:8000"),
            ("YAMF_REGISTRY_TOKEN", "secret"),
            ("YAMF_RETRY_LIMIT", "7"),
            ("YAMF_RETRY_DELAY", "100"),
            ("YAMF_REGISTRATION_RETRY_LIMIT", "10"),
            ("ENVIRONMENT", "staging-2"),
        ]);
        let config = FabricConfig::from_env_map(&env);
        assert_eq!(config.registry_url, "http://registry:9000");
        assert_eq!(config.gateway_url.as_deref(), Some("http://gateway:8000"));
        assert_eq!(config.registry_token.as_deref(), Some("secret"));
        assert_eq!(config.retry_limit, 7);
        assert_eq!(config.retry_delay_ms, 100);
        assert_eq!(config.registration_retry_limit, 10);
        assert!(config.environment.is_production_like());
    }

    #[test]
    fn test_empty_env_value_ignored() {
        let env = env_of(&[("YAMF_REGISTRY_TOKEN", "")]);
        let config = FabricConfig::from_env_map(&env);
        assert!(config.registry_token.is_none());
    }

    #[test]
    fn test_environment_substring_gating() {
        assert!(Environment::new("production").is_production_like());
        assert!(Environment::new("prod-eu-1").is_production_like());
        assert!(Environment::new("staging").is_production_like());
        assert!(!Environment::new("dev").is_production_like());
        assert!(!Environment::new("local").is_production_like());
    }

    #[test]
    fn test_registry_refuses_production_without_token() {
        let env = env_of(&[("ENVIRONMENT", "production")]);
        let config = FabricConfig::from_env_map(&env);
        let result = config.validate_for_registry();
        assert!(
            matches!(result, Err(YamfError::Validation(msg)) if msg.contains("YAMF_REGISTRY_TOKEN"))
        );
    }

    #[test]
    fn test_registry_starts_in_dev_without_token() {
        let config = FabricConfig::from_env_map(&HashMap::new());
        assert!(config.validate_for_registry().is_ok());
    }

    #[test]
    fn test_file_config_with_env_precedence() {
        let mut temp = NamedTempFile::new().expect("create temp file");
        writeln!(
            temp,
            r#"
registry_url = "http://file-registry:9000"
retry_limit = 9
environment = "dev"
"#
        )
        .expect("write");

        let content = std::fs::read_to_string(temp.path()).unwrap();
        let file: FileConfig = toml::from_str(&content).unwrap();
        let mut config = FabricConfig::from_file_config(file);
        assert_eq!(config.registry_url, "http://file-registry:9000");
        assert_eq!(config.retry_limit, 9);

        // Env layer wins over the file layer.
        config.apply_env(&env_of(&[("YAMF_REGISTRY_URL", "http://env-registry:9001")]));
        assert_eq!(config.registry_url, "http://env-registry:9001");
        assert_eq!(config.retry_limit, 9);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let mut temp = NamedTempFile::new().expect("create temp file");
        writeln!(temp, "this is not valid toml {{{{").expect("write");
        let result = FabricConfig::from_env_and_file(temp.path());
        assert!(matches!(result, Err(YamfError::Validation(_))));
    }

    #[test]
    fn test_missing_file_rejected() {
        let result = FabricConfig::from_env_and_file(Path::new("/nonexistent/yamf.toml"));
        assert!(matches!(result, Err(YamfError::Validation(msg)) if msg.contains("read")));
    }
}
