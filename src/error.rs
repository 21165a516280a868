//! Error taxonomy for policy construction and sandbox invocation.
//!
//! Every failure the wrapper can report before handing control to the
//! sandbox engine is a [`JailError`]. Failures of the engine or of quilt
//! itself are not errors here: their exit status is passed through.

use std::path::PathBuf;

/// Errors raised while building, rendering, or launching a jail policy.
#[derive(Debug, thiserror::Error)]
pub enum JailError {
    /// The sandbox engine binary could not be resolved on the host.
    #[error("sandbox engine '{name}' not found: {reason}")]
    EngineNotFound { name: String, reason: String },

    /// Neither NSS configuration candidate exists on the host.
    #[error("no nsswitch.conf found (looked in {})", format_candidates(.candidates))]
    MissingNsswitch { candidates: Vec<PathBuf> },

    /// A mount declaration violates a structural invariant.
    #[error("invalid mount declaration {mount}: {reason}")]
    InvalidMount { mount: String, reason: String },

    /// An extra-mount entry could not be parsed.
    #[error("invalid extra mount '{entry}': {reason}")]
    InvalidExtraMount { entry: String, reason: String },

    /// The configuration file is unreadable or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem or environment access failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The sandbox engine could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl JailError {
    /// Process exit code reported for this error.
    ///
    /// A missing NSS configuration is distinguished from every other
    /// internal configuration problem.
    pub fn exit_code(&self) -> u8 {
        match self {
            JailError::MissingNsswitch { .. } => 2,
            _ => 1,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        JailError::Io {
            context: context.into(),
            source,
        }
    }
}

fn format_candidates(candidates: &[PathBuf]) -> String {
    candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_nsswitch_exit_code() {
        let err = JailError::MissingNsswitch {
            candidates: vec![
                PathBuf::from("/etc/nsswitch.conf"),
                PathBuf::from("/usr/etc/nsswitch.conf"),
            ],
        };
        assert_eq!(err.exit_code(), 2);
        assert_eq!(
            err.to_string(),
            "no nsswitch.conf found (looked in /etc/nsswitch.conf, /usr/etc/nsswitch.conf)"
        );
    }

    #[test]
    fn test_configuration_errors_exit_with_one() {
        let errors = [
            JailError::EngineNotFound {
                name: "nsjail".to_string(),
                reason: "cannot find binary path".to_string(),
            },
            JailError::InvalidMount {
                mount: "dst=/proc".to_string(),
                reason: "neither src nor fstype is set".to_string(),
            },
            JailError::InvalidExtraMount {
                entry: "src=/opt,bogus=1".to_string(),
                reason: "unknown key 'bogus'".to_string(),
            },
            JailError::Config("time_limit must be positive".to_string()),
        ];
        for err in errors {
            assert_eq!(err.exit_code(), 1, "{err}");
        }
    }

    #[test]
    fn test_extra_mount_error_quotes_entry() {
        let err = JailError::InvalidExtraMount {
            entry: "src=/opt,bogus=1".to_string(),
            reason: "unknown key 'bogus'".to_string(),
        };
        assert!(err.to_string().contains("src=/opt,bogus=1"));
    }

    #[test]
    fn test_io_error_keeps_source() {
        let err = JailError::io(
            "failed to read /nowhere",
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        );
        assert_eq!(err.to_string(), "failed to read /nowhere: no such file");
        assert!(std::error::Error::source(&err).is_some());
    }
}
