//! Runtime and router configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Configuration for the agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory holding one SQLite file per agent instance.
    pub data_dir: PathBuf,

    /// Keep stores in memory instead of on disk. Nothing survives the
    /// process; intended for tests and ephemeral deployments.
    pub ephemeral: bool,

    /// How long an instance with no connections and no inbound work stays
    /// resident before hibernating.
    pub idle_timeout_secs: u64,

    /// Delay before re-firing the alarm after a failed schedule or queue
    /// callback.
    pub alarm_retry_delay_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            ephemeral: false,
            idle_timeout_secs: 300,
            alarm_retry_delay_secs: 30,
        }
    }
}

impl RuntimeConfig {
    /// An ephemeral config for tests: in-memory stores, fast retries.
    pub fn ephemeral() -> Self {
        Self {
            ephemeral: true,
            alarm_retry_delay_secs: 1,
            ..Self::default()
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn alarm_retry_delay(&self) -> Duration {
        Duration::from_secs(self.alarm_retry_delay_secs)
    }

    /// Load from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| CoreError::Config {
            reason: format!("failed to read {}: {e}", path.as_ref().display()),
        })?;
        Self::from_toml(&raw)
    }

    /// Parse from a TOML string.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| CoreError::Config {
            reason: e.to_string(),
        })
    }
}

/// CORS behavior for routed requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorsConfig {
    /// `true` applies the default header set; `false` disables CORS.
    Enabled(bool),
    /// A custom header map, applied verbatim in place of the defaults.
    Headers(BTreeMap<String, String>),
}

impl Default for CorsConfig {
    fn default() -> Self {
        CorsConfig::Enabled(false)
    }
}

impl CorsConfig {
    /// The response headers to apply, or `None` when CORS is disabled.
    pub fn headers(&self) -> Option<Vec<(String, String)>> {
        match self {
            CorsConfig::Enabled(false) => None,
            CorsConfig::Enabled(true) => Some(vec![
                (
                    "Access-Control-Allow-Origin".to_string(),
                    "*".to_string(),
                ),
                (
                    "Access-Control-Allow-Methods".to_string(),
                    "GET, POST, HEAD, OPTIONS".to_string(),
                ),
                (
                    "Access-Control-Allow-Credentials".to_string(),
                    "true".to_string(),
                ),
            ]),
            CorsConfig::Headers(map) => Some(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
        }
    }
}

/// Configuration for the HTTP/WebSocket router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Leading path segment of the routing grammar
    /// `/<prefix>/<class-kebab>/<instance-name>[/<tail>]`.
    pub prefix: String,

    pub cors: CorsConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            prefix: "agents".to_string(),
            cors: CorsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = RuntimeConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert!(!config.ephemeral);
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));

        let router = RouterConfig::default();
        assert_eq!(router.prefix, "agents");
        assert!(router.cors.headers().is_none());
    }

    #[test]
    fn cors_default_headers() {
        let headers = CorsConfig::Enabled(true).headers().unwrap();
        assert!(headers.contains(&(
            "Access-Control-Allow-Origin".to_string(),
            "*".to_string()
        )));
        assert!(headers.contains(&(
            "Access-Control-Allow-Methods".to_string(),
            "GET, POST, HEAD, OPTIONS".to_string()
        )));
        assert!(headers.contains(&(
            "Access-Control-Allow-Credentials".to_string(),
            "true".to_string()
        )));
    }

    #[test]
    fn cors_custom_map_overrides_verbatim() {
        let mut map = BTreeMap::new();
        map.insert(
            "Access-Control-Allow-Origin".to_string(),
            "https://app.example".to_string(),
        );
        let headers = CorsConfig::Headers(map).headers().unwrap();
        assert_eq!(
            headers,
            vec![(
                "Access-Control-Allow-Origin".to_string(),
                "https://app.example".to_string()
            )]
        );
    }

    #[test]
    fn runtime_config_parses_from_toml() {
        let config = RuntimeConfig::from_toml(
            r#"
            data_dir = "/var/lib/warren"
            idle_timeout_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/warren"));
        assert_eq!(config.idle_timeout_secs, 60);
        // Unset fields keep defaults.
        assert_eq!(config.alarm_retry_delay_secs, 30);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let err = RuntimeConfig::from_toml("data_dir = [1,").unwrap_err();
        assert!(matches!(err, CoreError::Config { .. }));
    }

    #[test]
    fn router_config_cors_accepts_bool_and_map() {
        let parsed: RouterConfig =
            toml::from_str(r#"cors = true"#).unwrap();
        assert!(parsed.cors.headers().is_some());

        let parsed: RouterConfig = toml::from_str(
            r#"
            [cors]
            "Access-Control-Allow-Origin" = "https://x.example"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.cors.headers().unwrap().len(), 1);
    }
}
