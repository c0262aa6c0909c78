use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::exec::ElevationStrategy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub toolbar: ToolbarSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PluginsConfig {
    /// Directory scanned at startup. Created if missing.
    #[serde(default = "default_plugin_directory")]
    pub directory: PathBuf,
    /// Where the plugin list is recorded after add/remove.
    /// Supports ${ENV_VAR} substitution
    #[serde(default = "default_registry_file")]
    pub registry_file: PathBuf,
    /// Set to false to skip discovery entirely
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub elevation: ElevationConfig,
}

/// How elevated commands are launched.
///
/// `strategy = "auto"` picks the platform mechanism. `strategy = "prefix"`
/// runs `program args... <interpreter> <interpreter args...>`.
#[derive(Debug, Deserialize, Clone)]
pub struct ElevationConfig {
    #[serde(default = "default_elevation_strategy")]
    pub strategy: String,
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolbarSettings {
    /// JSON file holding the toolbar/button definitions
    #[serde(default = "default_toolbar_config_path")]
    pub config_path: PathBuf,
}

fn default_plugin_directory() -> PathBuf {
    PathBuf::from("./plugins")
}

fn default_registry_file() -> PathBuf {
    PathBuf::from("./data/plugins.json")
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_elevation_strategy() -> String {
    "auto".to_string()
}

fn default_toolbar_config_path() -> PathBuf {
    PathBuf::from("./data/toolbar_config.json")
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: default_plugin_directory(),
            registry_file: default_registry_file(),
            enabled: default_enabled(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            elevation: ElevationConfig::default(),
        }
    }
}

impl Default for ElevationConfig {
    fn default() -> Self {
        Self {
            strategy: default_elevation_strategy(),
            program: None,
            args: Vec::new(),
        }
    }
}

impl Default for ToolbarSettings {
    fn default() -> Self {
        Self {
            config_path: default_toolbar_config_path(),
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl ElevationConfig {
    /// Resolves the configured strategy name into an `ElevationStrategy`.
    pub fn resolve(&self) -> anyhow::Result<ElevationStrategy> {
        match self.strategy.to_lowercase().as_str() {
            "auto" => Ok(ElevationStrategy::platform_default()),
            "runas" => Ok(ElevationStrategy::RunAs),
            "prefix" => {
                let program = self.program.clone().ok_or_else(|| {
                    anyhow::anyhow!("execution.elevation.program is required for strategy 'prefix'")
                })?;
                Ok(ElevationStrategy::Prefix {
                    program,
                    args: self.args.clone(),
                })
            }
            other => Err(anyhow::anyhow!(
                "Unsupported elevation strategy: '{other}'. Supported: 'auto', 'runas', 'prefix'."
            )),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses a TOML document, expanding environment variables like ${HOME}
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Loads the config file, falling back to defaults when it does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.plugins.directory, PathBuf::from("./plugins"));
        assert_eq!(config.plugins.registry_file, PathBuf::from("./data/plugins.json"));
        assert!(config.plugins.enabled);
        assert_eq!(config.execution.timeout_secs, 30);
        assert_eq!(config.execution.timeout(), Duration::from_secs(30));
        assert_eq!(config.execution.elevation.strategy, "auto");
        assert_eq!(
            config.toolbar.config_path,
            PathBuf::from("./data/toolbar_config.json")
        );
    }

    #[test]
    fn test_full_document() {
        let config = Config::parse(
            r#"
            [plugins]
            directory = "/opt/toolbar/plugins"
            registry_file = "/var/lib/toolbar/plugins.json"
            enabled = false

            [execution]
            timeout_secs = 5

            [execution.elevation]
            strategy = "prefix"
            program = "doas"
            args = ["-n"]

            [toolbar]
            config_path = "/etc/toolbar.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.plugins.directory, PathBuf::from("/opt/toolbar/plugins"));
        assert!(!config.plugins.enabled);
        assert_eq!(config.execution.timeout(), Duration::from_secs(5));
        assert_eq!(config.toolbar.config_path, PathBuf::from("/etc/toolbar.json"));

        match config.execution.elevation.resolve().unwrap() {
            ElevationStrategy::Prefix { program, args } => {
                assert_eq!(program, "doas");
                assert_eq!(args, vec!["-n".to_string()]);
            }
            other => panic!("unexpected strategy: {other:?}"),
        }
    }

    #[test]
    fn test_zero_timeout_is_clamped() {
        let config = Config::parse("[execution]\ntimeout_secs = 0\n").unwrap();
        assert_eq!(config.execution.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("TOOLBAR_KIT_TEST_PLUGIN_DIR", "/tmp/expanded");
        let config =
            Config::parse("[plugins]\ndirectory = \"${TOOLBAR_KIT_TEST_PLUGIN_DIR}/plugins\"\n")
                .unwrap();
        assert_eq!(config.plugins.directory, PathBuf::from("/tmp/expanded/plugins"));
    }

    #[test]
    fn test_prefix_strategy_requires_program() {
        let config = Config::parse("[execution.elevation]\nstrategy = \"prefix\"\n").unwrap();
        assert!(config.execution.elevation.resolve().is_err());
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let config = Config::parse("[execution.elevation]\nstrategy = \"magic\"\n").unwrap();
        let err = config.execution.elevation.resolve().unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_runas_strategy() {
        let config = Config::parse("[execution.elevation]\nstrategy = \"RunAs\"\n").unwrap();
        assert!(matches!(
            config.execution.elevation.resolve().unwrap(),
            ElevationStrategy::RunAs
        ));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.execution.timeout_secs, 30);
    }

    #[test]
    fn test_load_invalid_toml_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[execution\ntimeout_secs = ").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
