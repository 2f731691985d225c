use serde::Deserialize;
use std::path::PathBuf;

use crate::policy::CommandPolicy;

/// Top-level sandbox configuration, loaded once at process start.
///
/// Every section has defaults, so an empty file is a valid configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub policy: CommandPolicy,
    pub script: ScriptConfig,
    pub container: ContainerConfig,
    pub host: HostConfig,
    pub defaults: DefaultsConfig,
}

/// Isolated script tier: one interpreter process per task.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScriptConfig {
    /// Interpreter binary, looked up on PATH when not absolute.
    pub interpreter: String,
    /// Extra interpreter flags, placed before the heap ceiling flag.
    pub interpreter_args: Vec<String>,
    /// Run the interpreter under its permission model with no grants, and
    /// refuse to run scripts when the interpreter has none (Node < 20).
    pub require_permission_model: bool,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            interpreter: "node".to_string(),
            interpreter_args: vec!["--no-warnings".to_string()],
            require_permission_model: true,
        }
    }
}

/// Container tier (persistent sessions and one-shot executions).
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container runtime CLI (`docker`, or a compatible one such as `podman`).
    pub runtime: String,
    /// Base image for new containers.
    pub image: String,
    /// Container name prefix; the session id is appended.
    pub name_prefix: String,
    /// Give containers network access. Off unless explicitly enabled.
    pub network: bool,
    /// Default working directory inside the container.
    pub workdir: String,
    pub memory_limit_mb: Option<u32>,
    /// CPU share as a fraction of cores (0.5 = half a core).
    pub cpus: Option<f64>,
    pub pids_limit: Option<u32>,
    /// Interpreter used for script tasks inside the container.
    pub script_interpreter: String,
    /// Upper bound for `write_file` / `read_file` payloads.
    pub max_transfer_bytes: u64,
    /// Timeout for lifecycle calls (run, cp, rm, inspect).
    pub management_timeout_secs: u64,
    /// Wrap exec'd commands in `timeout -s KILL` inside the container so the
    /// deadline is enforced there too, not only on the client side.
    pub kill_wrapper: bool,
    /// Directory for host-side transfer files (system temp dir when unset).
    pub temp_dir: Option<PathBuf>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "node:22-alpine".to_string(),
            name_prefix: "fluux-sandbox".to_string(),
            network: false,
            workdir: "/workspace".to_string(),
            memory_limit_mb: Some(512),
            cpus: Some(1.0),
            pids_limit: Some(256),
            script_interpreter: "node".to_string(),
            max_transfer_bytes: 16 * 1024 * 1024,
            management_timeout_secs: 60,
            kill_wrapper: true,
            temp_dir: None,
        }
    }
}

/// Direct host subprocess, only reachable through insecure fallback.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HostConfig {
    /// PATH given to host commands (the parent environment is not inherited).
    pub path: String,
    /// Working directory when the task does not set one.
    pub working_directory: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            path: "/usr/local/bin:/usr/bin:/bin".to_string(),
            working_directory: None,
        }
    }
}

/// Default routing options for callers that do not pass their own.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DefaultsConfig {
    pub use_container: bool,
    pub allow_insecure_fallback: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            use_container: true,
            allow_insecure_fallback: false,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${SANDBOX_IMAGE}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.script.interpreter.trim().is_empty() {
            anyhow::bail!("script.interpreter must not be empty");
        }
        if self.container.image.trim().is_empty() {
            anyhow::bail!("container.image must not be empty");
        }
        if !self.container.workdir.starts_with('/') {
            anyhow::bail!(
                "container.workdir must be absolute (got {})",
                self.container.workdir
            );
        }
        if let Some(cpus) = self.container.cpus {
            if !(cpus > 0.0) {
                anyhow::bail!("container.cpus must be positive (got {cpus})");
            }
        }
        if self.policy.max_output_bytes == 0 {
            anyhow::bail!("policy.max_output_bytes must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.script.interpreter, "node");
        assert!(config.script.require_permission_model);
        assert_eq!(config.container.runtime, "docker");
        assert!(!config.container.network);
        assert_eq!(config.container.workdir, "/workspace");
        assert!(config.defaults.use_container);
        assert!(!config.defaults.allow_insecure_fallback);
        assert!(config.policy.enforce_allowlist);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [policy]
            allowed_commands = ["ls", "cat"]
            blocked_commands = ["rm"]
            enforce_allowlist = true
            block_chaining = true
            max_output_bytes = 4096
            default_timeout_ms = 5000

            [script]
            interpreter = "/usr/bin/node"
            interpreter_args = []
            require_permission_model = false

            [container]
            image = "alpine:3.20"
            network = true
            memory_limit_mb = 256
            cpus = 0.5

            [host]
            working_directory = "/srv/agent"

            [defaults]
            use_container = false
            allow_insecure_fallback = true
            "#,
        )
        .unwrap();
        assert_eq!(config.policy.allowed_commands.len(), 2);
        assert_eq!(config.policy.max_output_bytes, 4096);
        assert!(config.script.interpreter_args.is_empty());
        assert!(!config.script.require_permission_model);
        assert_eq!(config.container.image, "alpine:3.20");
        assert!(config.container.network);
        assert_eq!(config.container.memory_limit_mb, Some(256));
        assert_eq!(config.container.cpus, Some(0.5));
        // Unset fields keep defaults
        assert_eq!(config.container.pids_limit, Some(256));
        assert_eq!(
            config.host.working_directory,
            Some(PathBuf::from("/srv/agent"))
        );
        assert!(config.defaults.allow_insecure_fallback);
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("FLUUX_SANDBOX_TEST_IMAGE", "debian:bookworm-slim");
        let config = Config::parse(
            r#"
            [container]
            image = "${FLUUX_SANDBOX_TEST_IMAGE}"
            "#,
        )
        .unwrap();
        assert_eq!(config.container.image, "debian:bookworm-slim");
    }

    #[test]
    fn test_missing_env_var_is_error() {
        let result = Config::parse(
            r#"
            [container]
            image = "${FLUUX_SANDBOX_DEFINITELY_UNSET_VAR}"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_relative_workdir() {
        let result = Config::parse(
            r#"
            [container]
            workdir = "workspace"
            "#,
        );
        assert!(result.unwrap_err().to_string().contains("absolute"));
    }

    #[test]
    fn test_rejects_zero_output_limit() {
        let result = Config::parse(
            r#"
            [policy]
            max_output_bytes = 0
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_unknown_types() {
        let result = Config::parse(
            r#"
            [container]
            network = "yes please"
            "#,
        );
        assert!(result.is_err());
    }
}
