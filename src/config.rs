use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "coderun", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,

    /// Directory holding one subdirectory per execution environment
    #[arg(long = "envs", short = 'e')]
    pub environments_dir: Option<PathBuf>,
}

impl CliArgs {
    /// Load the configuration from the specified file
    ///
    /// Without `--config`, the user config directory is tried and the built-in
    /// defaults are used when no file is found there.
    pub fn to_config(&self) -> Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => Config::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Config::from_file(&path)?,
                _ => {
                    log::info!("No configuration file found, using defaults");
                    Config::default()
                }
            },
        };

        if let Some(dir) = &self.environments_dir {
            config.environments_dir = dir.clone();
        }

        Ok(config)
    }
}

fn default_config_path() -> Option<PathBuf> {
    use directories::ProjectDirs;

    ProjectDirs::from("", "", "coderun").map(|dirs| dirs.config_dir().join("config.json"))
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default = "default_environments_dir")]
    pub environments_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            sandbox: SandboxConfig::default(),
            environments_dir: default_environments_dir(),
        }
    }
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("unable to open config file {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.sandbox.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

/// How the sandbox runtime is invoked and how sessions are bounded
///
/// `command` and `kill_command` are templates; each argument may contain the
/// placeholders `%WORKSPACE%`, `%FILE%`, `%TAG%`, `%SESSION%` and `%ENV%`.
#[derive(Deserialize, Debug, Clone)]
pub struct SandboxConfig {
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    #[serde(default = "default_kill_command")]
    pub kill_command: Option<Vec<String>>,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Maximum wall time of one session, 0 disables the limit
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl SandboxConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(anyhow!("sandbox command must not be empty"));
        }
        if matches!(&self.kill_command, Some(cmd) if cmd.is_empty()) {
            return Err(anyhow!("sandbox kill_command must not be empty when set"));
        }
        if self.chunk_size == 0 || self.queue_capacity == 0 {
            return Err(anyhow!("chunk_size and queue_capacity must be positive"));
        }
        Ok(())
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            kill_command: default_kill_command(),
            workspace_root: default_workspace_root(),
            timeout_secs: default_timeout_secs(),
            chunk_size: default_chunk_size(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_command() -> Vec<String> {
    [
        "docker",
        "run",
        "--rm",
        "-i",
        "--name",
        "%SESSION%",
        "-v",
        "%WORKSPACE%:/dtc",
        "%TAG%",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_kill_command() -> Option<Vec<String>> {
    Some(vec![
        "docker".to_string(),
        "kill".to_string(),
        "%SESSION%".to_string(),
    ])
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("coderun")
}

fn default_environments_dir() -> PathBuf {
    PathBuf::from("envs")
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_chunk_size() -> usize {
    4096
}

fn default_queue_capacity() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let config = Config::from_file(std::path::Path::new("data/example.json")).unwrap();
        assert_eq!(config.server.bind_address, Some("127.0.0.1".to_string()));
        assert_eq!(config.server.bind_port, Some(8080));
        assert_eq!(config.sandbox.command[0], "docker");
        assert_eq!(config.sandbox.timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.environments_dir, PathBuf::from("envs"));
    }

    #[test]
    fn test_config_defaults_fill_missing_sections() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.server.bind_port.is_none());
        assert_eq!(config.environments_dir, PathBuf::from("envs"));
        assert_eq!(config.sandbox.chunk_size, 4096);
        assert_eq!(config.sandbox.queue_capacity, 64);
        assert_eq!(config.sandbox.kill_command, default_kill_command());
    }

    #[test]
    fn test_zero_timeout_disables_limit() {
        let config: Config =
            serde_json::from_str(r#"{"sandbox": {"timeout_secs": 0, "kill_command": null}}"#)
                .unwrap();
        assert_eq!(config.sandbox.timeout(), None);
        assert_eq!(config.sandbox.kill_command, None);
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let sandbox = SandboxConfig {
            command: vec![],
            ..SandboxConfig::default()
        };
        assert!(sandbox.validate().is_err());
    }
}
