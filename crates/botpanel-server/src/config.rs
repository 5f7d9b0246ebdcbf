use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use botpanel_protocol::{MAX_CONTROL_FRAME_BYTES, MAX_INPUT_LINE_BYTES, paths};
use libbotpanel::output::DEFAULT_LOG_CAPACITY;
use libbotpanel::{RunnerConfig, RuntimeInstallConfig, SupervisorConfig};

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub bots_dir: PathBuf,
    pub log_buffer_capacity: usize,
    pub allow_origins: Vec<String>,
    pub max_control_bytes: usize,
    pub max_input_bytes: usize,
    pub runner: RunnerConfig,
    pub install: RuntimeInstallConfig,
}

impl ServerConfig {
    /// Load `path` if given, otherwise the default config file if it exists,
    /// otherwise built-in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = paths::config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        if config.max_control_bytes == 0 || config.max_input_bytes == 0 {
            anyhow::bail!("max_control_bytes and max_input_bytes must be > 0");
        }
        Ok(config)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            bots_dir: self.bots_dir.clone(),
            runner: self.runner.clone(),
            install: self.install.clone(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3000)),
            bots_dir: paths::default_bots_dir(),
            log_buffer_capacity: DEFAULT_LOG_CAPACITY,
            allow_origins: vec!["http://localhost:3000".to_string()],
            max_control_bytes: MAX_CONTROL_FRAME_BYTES,
            max_input_bytes: MAX_INPUT_LINE_BYTES,
            runner: RunnerConfig::default(),
            install: RuntimeInstallConfig::default(),
        }
    }
}
