//! Configuration for quilt-jail.
//!
//! Two sources feed a run:
//!
//! - [`EnvFlags`]: presence switches and the extra-mount list read from the
//!   process environment. The wrapper has no command-line flags of its own,
//!   so this is the only per-invocation input.
//! - [`JailConfig`]: optional site configuration loaded from the JSON file
//!   named by `QUILT_JAIL_CONFIG`. Every field has a default, so an empty
//!   object `{}` is a valid file.
//!
//! # Examples
//!
//! ```ignore
//! use quilt_jail::config::JailConfig;
//!
//! let json = r#"{"time_limit": 120, "extra_mounts": [{"src": "/opt/sdk", "mandatory": false}]}"#;
//! let config = JailConfig::from_json_string(json)?;
//! assert_eq!(config.time_limit, 120);
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::JailError;
use crate::policy::{JailMode, MountDeclaration};

/// Enables engine logging, prints the engine command line, raises log level.
pub const ENV_VERBOSE: &str = "QUILT_JAIL_VERBOSE";
/// Prints the rendered policy before launching.
pub const ENV_DEBUG: &str = "QUILT_JAIL_DEBUG";
/// Starts an interactive shell instead of quilt.
pub const ENV_SHELL: &str = "QUILT_JAIL_SHELL";
/// `;`-delimited extra mount declarations.
pub const ENV_EXTRA_MOUNTS: &str = "QUILT_JAIL_EXTRA_MOUNTS";
/// Path to a JSON configuration file.
pub const ENV_CONFIG: &str = "QUILT_JAIL_CONFIG";

/// Switches read from the environment.
///
/// The boolean switches are presence-tested: any value, including the empty
/// string, turns them on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFlags {
    pub verbose: bool,
    pub debug: bool,
    pub shell: bool,
    /// Raw extra-mount value, decoded by [`JailContext::detect`](crate::context::JailContext::detect).
    pub extra_mounts: Option<OsString>,
    pub config_path: Option<PathBuf>,
}

impl EnvFlags {
    /// Reads the flags from the current process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Reads the flags through `lookup`, which returns the value of a
    /// variable if it is set.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        Self {
            verbose: lookup(ENV_VERBOSE).is_some(),
            debug: lookup(ENV_DEBUG).is_some(),
            shell: lookup(ENV_SHELL).is_some(),
            extra_mounts: lookup(ENV_EXTRA_MOUNTS),
            config_path: lookup(ENV_CONFIG)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn mode(&self) -> JailMode {
        if self.shell {
            JailMode::Shell
        } else {
            JailMode::Command
        }
    }
}

/// Site configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct JailConfig {
    /// Sandbox engine binary: a name looked up in `PATH`, or a path.
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Path of the wrapped tool inside the sandbox.
    #[serde(default = "default_quilt")]
    pub quilt: PathBuf,

    /// Interactive shell command used in shell mode.
    #[serde(default = "default_shell")]
    pub shell: Vec<String>,

    /// Wall-clock limit in seconds for command mode.
    #[serde(default = "default_time_limit")]
    pub time_limit: u64,

    /// Build-output directory under `$HOME` that is replaced by a tmpfs.
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,

    /// Mounts appended before those from `QUILT_JAIL_EXTRA_MOUNTS`.
    #[serde(default)]
    pub extra_mounts: Vec<MountDeclaration>,
}

fn default_engine() -> String {
    "nsjail".to_string()
}

fn default_quilt() -> PathBuf {
    PathBuf::from("/usr/bin/quilt")
}

fn default_shell() -> Vec<String> {
    vec!["/bin/bash".to_string(), "-i".to_string()]
}

fn default_time_limit() -> u64 {
    600
}

fn default_build_dir() -> PathBuf {
    PathBuf::from("rpmbuild")
}

impl Default for JailConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            quilt: default_quilt(),
            shell: default_shell(),
            time_limit: default_time_limit(),
            build_dir: default_build_dir(),
            extra_mounts: Vec::new(),
        }
    }
}

impl JailConfig {
    /// Loads the configuration named by [`EnvFlags::config_path`], or the
    /// defaults when none is set.
    pub fn load(flags: &EnvFlags) -> Result<Self, JailError> {
        match &flags.config_path {
            Some(path) => {
                tracing::debug!("Loading configuration from: {}", path.display());
                Self::from_file(path)
            }
            None => {
                tracing::debug!("Using default configuration");
                Ok(Self::default())
            }
        }
    }

    /// Loads and validates a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, does
    /// not match the schema, or fails [`JailConfig::validate`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, JailError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            JailError::io(format!("failed to read config file {}", path.display()), e)
        })?;
        Self::from_json_string(&content)
    }

    /// Parses and validates a configuration from a JSON string.
    pub fn from_json_string(json: &str) -> Result<Self, JailError> {
        let config: JailConfig = serde_json::from_str(json)
            .map_err(|e| JailError::Config(format!("failed to parse JSON configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String, JailError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| JailError::Config(format!("failed to serialize configuration: {e}")))
    }

    /// Checks field values and every configured extra mount.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `engine` is empty
    /// - `quilt` is not an absolute path
    /// - `shell` is empty or its program is empty
    /// - `time_limit` is zero
    /// - `build_dir` is absolute, empty, or escapes `$HOME` via `..`
    /// - an extra mount violates the mount invariants
    pub fn validate(&self) -> Result<(), JailError> {
        if self.engine.trim().is_empty() {
            return Err(JailError::Config("engine cannot be empty".to_string()));
        }
        if !self.quilt.is_absolute() {
            return Err(JailError::Config(format!(
                "quilt must be an absolute path, got {}",
                self.quilt.display()
            )));
        }
        if self.shell.first().map_or(true, |s| s.is_empty()) {
            return Err(JailError::Config("shell command cannot be empty".to_string()));
        }
        if self.time_limit == 0 {
            return Err(JailError::Config("time_limit must be positive".to_string()));
        }
        validate_build_dir(&self.build_dir)?;

        for mount in &self.extra_mounts {
            mount.validate()?;
        }
        Ok(())
    }
}

fn validate_build_dir(dir: &Path) -> Result<(), JailError> {
    use std::path::Component;

    if dir.as_os_str().is_empty() {
        return Err(JailError::Config("build_dir cannot be empty".to_string()));
    }
    if !dir.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(JailError::Config(format!(
            "build_dir must be a plain path relative to $HOME, got {}",
            dir.display()
        )));
    }
    Ok(())
}
