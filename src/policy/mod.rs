//! Policy data model: mount declarations and scalar settings.
//!
//! A [`Policy`] is built once per invocation by [`builder::build_policy`],
//! rendered once by [`render::render_policy`], and then dropped. Nothing in
//! this module touches the filesystem.
//!
//! # Mount declarations
//!
//! | Field | Default | Meaning |
//! |-------|---------|---------|
//! | `src` | none | host path to expose; absent for synthesized filesystems |
//! | `dst` | `src` | path inside the sandbox |
//! | `rw` | `false` | writable inside the sandbox |
//! | `fstype` | none | synthesized filesystem type (e.g. `tmpfs`) |
//! | `mandatory` | `true` | when `false`, a missing `src` is skipped silently |

pub mod builder;
pub mod extra_mounts;
pub mod render;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::JailError;
use crate::utils::textproto::Value;

/// Filesystem type used for ephemeral writable mounts.
pub const TMPFS: &str = "tmpfs";

/// Whether the jail runs quilt or an interactive shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JailMode {
    /// Run the wrapped tool with the caller's arguments under a time limit.
    #[default]
    Command,
    /// Drop into an interactive shell attached to the real terminal.
    Shell,
}

/// One filesystem exposed inside the sandbox.
///
/// Declarations are immutable once built; the constructor methods below
/// consume and return `self`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountDeclaration {
    #[serde(default, rename = "src", alias = "source", skip_serializing_if = "Option::is_none")]
    source: Option<PathBuf>,

    #[serde(default, rename = "dst", alias = "destination", skip_serializing_if = "Option::is_none")]
    destination: Option<PathBuf>,

    #[serde(default, rename = "rw", alias = "writable")]
    writable: bool,

    #[serde(default, rename = "fstype", alias = "kind", skip_serializing_if = "Option::is_none")]
    kind: Option<String>,

    #[serde(default = "default_mandatory")]
    mandatory: bool,
}

fn default_mandatory() -> bool {
    true
}

impl Default for MountDeclaration {
    /// An empty declaration. It fails validation until a source or kind is set.
    fn default() -> Self {
        Self {
            source: None,
            destination: None,
            writable: false,
            kind: None,
            mandatory: true,
        }
    }
}

impl MountDeclaration {
    /// Read-only bind mount of `source` at the same path.
    pub fn bind(source: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::default()
        }
    }

    /// Writable synthesized filesystem of type `kind` at `destination`.
    pub fn synthesized(kind: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: Some(destination.into()),
            writable: true,
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    /// Writable tmpfs at `destination`.
    pub fn tmpfs(destination: impl Into<PathBuf>) -> Self {
        Self::synthesized(TMPFS, destination)
    }

    /// Sets the host path to expose. A declaration with a source is a bind
    /// mount.
    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the path inside the sandbox. Without one the source path is used.
    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Sets the synthesized filesystem type, e.g. `tmpfs`.
    ///
    /// A synthesized filesystem must also be writable; see
    /// [`MountDeclaration::validate`].
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Makes the mount writable (`true`) or read-only (`false`).
    ///
    /// # Example
    ///
    /// ```
    /// use quilt_jail::policy::MountDeclaration;
    ///
    /// let cache = MountDeclaration::bind("/srv/cache")
    ///     .with_destination("/cache")
    ///     .read_write(true);
    /// assert!(cache.is_writable());
    /// assert!(cache.validate().is_ok());
    /// ```
    pub fn read_write(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Whether a missing source is an error (`true`, the default) or the
    /// mount is skipped at render time (`false`).
    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    /// Shorthand for `mandatory(false)`.
    pub fn optional(self) -> Self {
        self.mandatory(false)
    }

    /// Host path, if this is a bind mount.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Sandbox path as declared; see [`MountDeclaration::effective_destination`].
    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    /// `dst` when given, `src` otherwise.
    pub fn effective_destination(&self) -> Option<&Path> {
        self.destination().or_else(|| self.source())
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Synthesized filesystem type, if any.
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    /// A declaration with a host source is a bind mount; one without is synthesized.
    pub fn is_bind(&self) -> bool {
        self.source.is_some()
    }

    /// Checks the structural invariants every declaration must satisfy
    /// before it is serialized.
    ///
    /// # Errors
    ///
    /// Returns [`JailError::InvalidMount`] if:
    /// - neither `src` nor `fstype` is set
    /// - `fstype` is set on a read-only declaration
    /// - there is no effective destination
    /// - a path is relative or contains a NUL byte
    pub fn validate(&self) -> Result<(), JailError> {
        let invalid = |reason: &str| JailError::InvalidMount {
            mount: self.to_string(),
            reason: reason.to_string(),
        };

        if self.source.is_none() && self.kind.is_none() {
            return Err(invalid("neither src nor fstype is set"));
        }
        if self.kind.is_some() && !self.writable {
            return Err(invalid("synthesized filesystems must be writable"));
        }
        if self.kind.as_deref().is_some_and(str::is_empty) {
            return Err(invalid("fstype is empty"));
        }
        if self.effective_destination().is_none() {
            return Err(invalid("no destination"));
        }
        for path in [self.source(), self.destination()].into_iter().flatten() {
            if !path.is_absolute() {
                return Err(invalid("paths must be absolute"));
            }
            if path.as_os_str().as_encoded_bytes().contains(&0) {
                return Err(invalid("path contains a NUL byte"));
            }
        }
        Ok(())
    }
}

impl fmt::Display for MountDeclaration {
    /// Formats the declaration in the extra-mount notation.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields = Vec::new();
        if let Some(src) = &self.source {
            fields.push(format!("src={}", src.display()));
        }
        if let Some(dst) = &self.destination {
            fields.push(format!("dst={}", dst.display()));
        }
        fields.push(format!("rw={}", self.writable));
        if let Some(kind) = &self.kind {
            fields.push(format!("fstype={kind}"));
        }
        if !self.mandatory {
            fields.push("mandatory=false".to_string());
        }
        f.write_str(&fields.join(","))
    }
}

/// Ordered scalar settings emitted before the mount blocks.
///
/// Keys may repeat (`envar` appears once per inherited variable).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySettings {
    entries: Vec<(String, Value)>,
}

impl PolicySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a setting. Earlier entries with the same key are kept.
    ///
    /// # Arguments
    ///
    /// * `key` - Engine configuration field name, e.g. `hostname`
    /// * `value` - Anything convertible to a [`Value`]: strings, paths,
    ///   booleans and integers
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.push((key.into(), value.into()));
    }

    /// First value recorded under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Every value recorded under `key`, in insertion order.
    #[cfg(test)]
    pub(crate) fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Settings in the order they will be rendered.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Settings plus the ordered mount list.
///
/// Mount order is significant: the engine applies mounts in declaration
/// order and later mounts may shadow earlier ones. Duplicate destinations
/// are kept as declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    settings: PolicySettings,
    mounts: Vec<MountDeclaration>,
}

impl Policy {
    /// Assembles a policy. Validation happens at render time.
    pub fn new(settings: PolicySettings, mounts: Vec<MountDeclaration>) -> Self {
        Self { settings, mounts }
    }

    pub fn settings(&self) -> &PolicySettings {
        &self.settings
    }

    /// Mounts in declaration order, including optional ones whose source
    /// may turn out to be missing.
    pub fn mounts(&self) -> &[MountDeclaration] {
        &self.mounts
    }

    /// Declarations whose effective destination is `path`, in declaration
    /// order. More than one result means later mounts shadow earlier ones.
    ///
    /// # Example
    ///
    /// ```
    /// use std::path::Path;
    /// use quilt_jail::policy::{MountDeclaration, Policy, PolicySettings};
    ///
    /// let policy = Policy::new(
    ///     PolicySettings::new(),
    ///     vec![
    ///         MountDeclaration::tmpfs("/var/tmp"),
    ///         MountDeclaration::bind("/srv/tmp").with_destination("/var/tmp").read_write(true),
    ///     ],
    /// );
    /// assert_eq!(policy.mounts_at(Path::new("/var/tmp")).count(), 2);
    /// ```
    pub fn mounts_at<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = &'a MountDeclaration> + 'a {
        self.mounts
            .iter()
            .filter(move |m| m.effective_destination() == Some(path))
    }
}
