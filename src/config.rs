//! Pipe configuration: YAML file plus environment overrides.
//!
//! Every field has a default, so a missing file is not an error; the pipe
//! simply reports itself as not configured until keys are supplied.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{PipeError, Result};
use crate::pool::CooldownPolicy;

/// Identifier the pipe registers under in the host. Fixed.
pub const PIPE_ID: &str = "edgeone_ai";

/// Env var naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "EDGEONE_PIPE_CONFIG";

/// Separators accepted in list-valued settings: ASCII comma,
/// full-width comma, and line breaks.
const LIST_SEPARATORS: [char; 4] = [',', '，', '\n', '\r'];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    pub pipe_id: String,
    pub base_url: String,
    /// Delimited list of gateway API keys.
    pub api_keys: String,
    /// Value of the `OE-Key` header.
    pub oe_key: String,
    /// Value of the `OE-Gateway-Name` header.
    pub gateway_name: String,
    /// Value of the `OE-AI-Provider` header.
    pub ai_provider: String,
    /// Delimited list of model ids offered to the host.
    pub available_models: String,
    pub timeout_secs: u64,
    /// Attempts per chat request, each on a freshly selected key.
    pub max_attempts: u32,
    pub failure_threshold: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub socket_path: PathBuf,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            pipe_id: PIPE_ID.to_string(),
            base_url: "https://ai-gateway.eo-edgefunctions7.com/v1".to_string(),
            api_keys: String::new(),
            oe_key: String::new(),
            gateway_name: String::new(),
            ai_provider: "gemini".to_string(),
            available_models: "gemini-pro,gemini-1.5-pro-latest".to_string(),
            timeout_secs: 180,
            max_attempts: 2,
            failure_threshold: 3,
            backoff_base_secs: 30,
            backoff_cap_secs: 600,
            socket_path: default_data_dir().join("pipe.sock"),
        }
    }
}

impl PipeConfig {
    /// Load from `$EDGEONE_PIPE_CONFIG` or the default location, then
    /// apply environment overrides and validate.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(default_config_path);

        let mut config = Self::from_file(&path)?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML config file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No config file found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        info!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Override secrets and endpoints from the environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let overrides: [(&str, &mut String); 4] = [
            ("EDGEONE_API_KEYS", &mut self.api_keys),
            ("EDGEONE_OE_KEY", &mut self.oe_key),
            ("EDGEONE_GATEWAY_NAME", &mut self.gateway_name),
            ("EDGEONE_BASE_URL", &mut self.base_url),
        ];
        for (name, slot) in overrides {
            if let Some(value) = lookup(name).filter(|v| !v.trim().is_empty()) {
                *slot = value;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipe_id != PIPE_ID {
            return Err(PipeError::InvalidConfig(format!(
                "pipe_id must be '{}', got '{}'",
                PIPE_ID, self.pipe_id
            )));
        }
        if self.failure_threshold == 0 {
            return Err(PipeError::InvalidConfig(
                "failure_threshold must be at least 1".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(PipeError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.backoff_cap_secs < self.backoff_base_secs {
            return Err(PipeError::InvalidConfig(format!(
                "backoff_cap_secs ({}) is below backoff_base_secs ({})",
                self.backoff_cap_secs, self.backoff_base_secs
            )));
        }
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        parse_list(&self.api_keys)
    }

    pub fn models(&self) -> Vec<String> {
        parse_list(&self.available_models)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cooldown_policy(&self) -> CooldownPolicy {
        CooldownPolicy {
            failure_threshold: self.failure_threshold,
            backoff_base: Duration::from_secs(self.backoff_base_secs),
            backoff_cap: Duration::from_secs(self.backoff_cap_secs),
        }
    }

    /// Names of required settings that are still empty.
    pub fn missing_settings(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.keys().is_empty() {
            missing.push("api_keys");
        }
        if self.oe_key.trim().is_empty() {
            missing.push("oe_key");
        }
        if self.gateway_name.trim().is_empty() {
            missing.push("gateway_name");
        }
        missing
    }
}

/// Split a delimited setting into trimmed, non-empty items.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(LIST_SEPARATORS)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("edgeone-pipe")
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("edgeone-pipe")
        .join("config.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_parse_mixed_separators() {
        assert_eq!(parse_list("k1,k2，k3\nk4"), vec!["k1", "k2", "k3", "k4"]);
    }

    #[test]
    fn test_parse_trims_and_drops_empty() {
        assert_eq!(parse_list(" a ,, b\r\n\n，c ,"), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
        assert!(parse_list(" ,\n，").is_empty());
    }

    #[test]
    fn test_defaults_valid() {
        let config = PipeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.models(), vec!["gemini-pro", "gemini-1.5-pro-latest"]);
        assert_eq!(
            config.missing_settings(),
            vec!["api_keys", "oe_key", "gateway_name"]
        );
    }

    #[test]
    fn test_wrong_pipe_id_rejected() {
        let config = PipeConfig {
            pipe_id: "edgeone".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PipeError::InvalidConfig(_))));
    }

    #[test]
    fn test_bad_policy_rejected() {
        let zero_threshold = PipeConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(zero_threshold.validate().is_err());

        let inverted = PipeConfig {
            backoff_base_secs: 60,
            backoff_cap_secs: 10,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "api_keys: |\n  key-a\n  key-b，key-c\noe_key: oe\ngateway_name: gw\nfailure_threshold: 5"
        )
        .unwrap();

        let config = PipeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.keys(), vec!["key-a", "key-b", "key-c"]);
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown_policy().failure_threshold, 5);
        // Unspecified fields keep their defaults.
        assert_eq!(config.ai_provider, "gemini");
        assert_eq!(config.timeout(), Duration::from_secs(180));
        assert!(config.missing_settings().is_empty());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipeConfig::from_file(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config, PipeConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("EDGEONE_API_KEYS", "e1,e2"),
            ("EDGEONE_OE_KEY", "oe-env"),
            ("EDGEONE_GATEWAY_NAME", "  "),
        ]
        .into_iter()
        .collect();

        let mut config = PipeConfig {
            gateway_name: "from-file".into(),
            ..Default::default()
        };
        config.apply_env(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.keys(), vec!["e1", "e2"]);
        assert_eq!(config.oe_key, "oe-env");
        // Blank overrides are ignored.
        assert_eq!(config.gateway_name, "from-file");
    }
}
