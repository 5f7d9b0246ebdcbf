use std::collections::BTreeMap;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::error::SupervisorError;

const PORT_PLACEHOLDER: &str = "{port}";
const VERSION_PLACEHOLDER: &str = "{version}";

/// What the operator asked to run: an entry file relative to the bot's
/// folder and, for the static-site runner, a port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub file: Option<String>,
    pub port: Option<u16>,
}

/// Program, arguments and extra environment for one spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Maps entry-file extensions to interpreters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Extension (without the dot) to argv prefix; the entry file is appended.
    pub interpreters: BTreeMap<String, Vec<String>>,
    /// Used when there is no entry file or its extension is unknown.
    /// `{port}` is substituted.
    pub static_runner: Vec<String>,
    pub default_port: u16,
    pub env: BTreeMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let mut interpreters = BTreeMap::new();
        interpreters.insert(
            "js".to_string(),
            to_strings(&[
                "node",
                "--max-old-space-size=128",
                "--optimize_for_size",
                "--gc-global",
                "--no-warnings",
                "--lazy",
            ]),
        );
        interpreters.insert("py".to_string(), to_strings(&["python3", "-u"]));
        interpreters.insert("sh".to_string(), to_strings(&["sh"]));

        let mut env = BTreeMap::new();
        env.insert("NODE_ENV".to_string(), "production".to_string());

        Self {
            interpreters,
            static_runner: to_strings(&["npx", "http-server", ".", "-p", PORT_PLACEHOLDER]),
            default_port: 3001,
            env,
        }
    }
}

impl RunnerConfig {
    pub fn resolve(&self, spec: &LaunchSpec) -> Result<ResolvedCommand, SupervisorError> {
        let env: Vec<(String, String)> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let file = spec.file.as_deref().filter(|f| !f.trim().is_empty());
        if let Some(file) = file {
            validate_entry(file)?;
            let ext = Path::new(file)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default();
            if let Some(argv) = self.interpreters.get(ext) {
                let (program, prefix) = argv.split_first().ok_or_else(|| {
                    SupervisorError::InvalidLaunch(format!("empty interpreter for .{ext}"))
                })?;
                let mut args = prefix.to_vec();
                args.push(file.to_string());
                return Ok(ResolvedCommand {
                    program: program.clone(),
                    args,
                    env,
                });
            }
        }

        let port = spec.port.unwrap_or(self.default_port).to_string();
        let argv: Vec<String> = self
            .static_runner
            .iter()
            .map(|a| a.replace(PORT_PLACEHOLDER, &port))
            .collect();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SupervisorError::InvalidLaunch("empty static runner".to_string()))?;
        Ok(ResolvedCommand {
            program: program.clone(),
            args: args.to_vec(),
            env,
        })
    }
}

/// Runtime provisioning: the allowed versions and the shell script run for one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeInstallConfig {
    pub versions: Vec<String>,
    /// Run with `bash -c`; `{version}` is substituted.
    pub script: String,
}

impl Default for RuntimeInstallConfig {
    fn default() -> Self {
        Self {
            versions: to_strings(&["14", "16", "18", "20"]),
            script: "wget -qO- https://deb.nodesource.com/setup_{version} | bash - && apt-get install -y nodejs"
                .to_string(),
        }
    }
}

impl RuntimeInstallConfig {
    /// Only allow-listed versions reach the shell.
    pub fn render(&self, version: &str) -> Result<String, SupervisorError> {
        if !self.versions.iter().any(|v| v == version) {
            return Err(SupervisorError::UnsupportedRuntime(version.to_string()));
        }
        Ok(self.script.replace(VERSION_PLACEHOLDER, version))
    }
}

/// Entry files must stay inside the bot folder.
fn validate_entry(file: &str) -> Result<(), SupervisorError> {
    let path = Path::new(file);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(SupervisorError::InvalidLaunch(format!(
            "entry file must be a relative path inside the bot folder: {file}"
        )));
    }
    Ok(())
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
