//! Execution context collected once per run.
//!
//! Policy construction never reads the environment or the filesystem
//! directly. Ambient inputs are gathered here into a [`JailContext`], and
//! existence checks go through an [`FsProbe`], so building and rendering a
//! policy can be tested against a fake filesystem.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::config::EnvFlags;
use crate::error::JailError;
use crate::policy::JailMode;

/// Read-only questions the policy code asks about the host filesystem.
pub trait FsProbe {
    /// Whether `path` exists, following symlinks.
    fn exists(&self, path: &Path) -> bool;

    /// Whether `path` itself is a symbolic link.
    fn is_symlink(&self, path: &Path) -> bool;
}

/// Probe backed by the real host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostFilesystem;

impl FsProbe for HostFilesystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_symlink(&self, path: &Path) -> bool {
        std::fs::symlink_metadata(path)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false)
    }
}

/// In-memory probe for tests and dry runs.
///
/// Only paths registered with [`MemoryProbe::with_file`] or
/// [`MemoryProbe::with_symlink`] exist.
#[derive(Debug, Clone, Default)]
pub struct MemoryProbe {
    files: BTreeSet<PathBuf>,
    symlinks: BTreeSet<PathBuf>,
}

impl MemoryProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.insert(path.into());
        self
    }

    pub fn with_files<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.files.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_symlink(mut self, path: impl Into<PathBuf>) -> Self {
        self.symlinks.insert(path.into());
        self
    }
}

impl FsProbe for MemoryProbe {
    fn exists(&self, path: &Path) -> bool {
        self.files.contains(path) || self.symlinks.contains(path)
    }

    fn is_symlink(&self, path: &Path) -> bool {
        self.symlinks.contains(path)
    }
}

/// Everything the policy builder needs to know about this invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailContext {
    /// Current working directory on the host.
    pub cwd: PathBuf,
    /// The invoking user's home directory.
    pub home: PathBuf,
    /// Host machine name, reused as the sandbox hostname.
    pub hostname: String,
    pub mode: JailMode,
    /// Raw value of the extra-mount environment variable.
    pub extra_mounts: Option<String>,
}

impl JailContext {
    /// Collects the context from the running process.
    ///
    /// # Errors
    ///
    /// Returns an error if the working directory cannot be determined, `HOME`
    /// is unset or empty, the host name cannot be read, or the extra-mount
    /// value is not valid UTF-8.
    pub fn detect(flags: &EnvFlags) -> Result<Self, JailError> {
        let cwd = std::env::current_dir()
            .map_err(|e| JailError::io("failed to determine current directory", e))?;

        let home = std::env::var_os("HOME")
            .filter(|h| !h.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| JailError::Config("HOME is not set".to_string()))?;

        let hostname = nix::unistd::gethostname()
            .map_err(|errno| JailError::io("failed to read host name", errno.into()))?
            .to_string_lossy()
            .into_owned();

        let context = Self {
            cwd,
            home,
            hostname,
            mode: flags.mode(),
            extra_mounts: flags.extra_mounts.as_deref().map(decode_extra_mounts).transpose()?,
        };
        tracing::debug!(?context, "Detected execution context");
        Ok(context)
    }
}

/// The extra-mount notation is text. A value that is not UTF-8 is refused
/// instead of being decoded lossily into paths that do not exist.
fn decode_extra_mounts(raw: &OsStr) -> Result<String, JailError> {
    raw.to_str()
        .map(str::to_string)
        .ok_or_else(|| JailError::InvalidExtraMount {
            entry: raw.to_string_lossy().into_owned(),
            reason: "value is not valid UTF-8".to_string(),
        })
}
