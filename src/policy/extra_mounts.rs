//! Parser for user-supplied extra mounts.
//!
//! The value of `QUILT_JAIL_EXTRA_MOUNTS` is a `;`-separated list of
//! entries. Each entry is a `,`-separated list of `key=value` fields:
//!
//! | Key | Alias | Value |
//! |-----|-------|-------|
//! | `src` | `source` | absolute host path |
//! | `dst` | `destination` | absolute sandbox path |
//! | `rw` | `writable` | boolean |
//! | `fstype` | `kind` | filesystem type |
//! | `mandatory` | | boolean |
//!
//! The first field may omit `src=`; a first field starting with `/` is
//! always a bare source, even if it contains `=`. Booleans accept
//! `true/false`, `yes/no`, `on/off` and `1/0`. Empty entries are ignored.
//!
//! There is no quoting or escaping. A path containing `,` or `;` cannot be
//! written in this notation, and whitespace around keys and values is
//! trimmed, so leading or trailing spaces in a path are lost. Such mounts
//! belong in the `extra_mounts` list of the JSON configuration file.
//!
//! ```text
//! /opt/sdk,mandatory=false;src=/srv/cache,dst=/cache,rw=true;dst=/scratch,fstype=tmpfs,rw=yes
//! ```
//!
//! The grammar only ever produces [`MountDeclaration`] values. Anything else
//! is rejected with the offending entry in the error.

use crate::error::JailError;
use crate::policy::MountDeclaration;

const ENTRY_SEPARATOR: char = ';';
const FIELD_SEPARATOR: char = ',';

/// Parses every entry of an extra-mount list.
///
/// # Errors
///
/// Returns [`JailError::InvalidExtraMount`] for the first entry that cannot
/// be parsed or that fails [`MountDeclaration::validate`].
pub fn parse_extra_mounts(value: &str) -> Result<Vec<MountDeclaration>, JailError> {
    value
        .split(ENTRY_SEPARATOR)
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_entry)
        .collect()
}

/// Parses a single entry.
pub fn parse_entry(entry: &str) -> Result<MountDeclaration, JailError> {
    let invalid = |reason: String| JailError::InvalidExtraMount {
        entry: entry.to_string(),
        reason,
    };

    let mut mount = MountDeclaration::default();
    let mut seen: Vec<&str> = Vec::new();

    for (idx, field) in entry.split(FIELD_SEPARATOR).map(str::trim).enumerate() {
        if field.is_empty() {
            return Err(invalid("empty field".to_string()));
        }

        let (key, value) = match field.split_once('=') {
            _ if idx == 0 && field.starts_with('/') => ("src", field),
            Some((key, value)) => (canonical_key(key.trim()), value.trim()),
            None if idx == 0 => ("src", field),
            None => return Err(invalid(format!("field '{field}' is not key=value"))),
        };

        if value.is_empty() {
            return Err(invalid(format!("empty value for '{key}'")));
        }
        if seen.contains(&key) {
            return Err(invalid(format!("'{key}' given more than once")));
        }

        mount = match key {
            "src" => mount.with_source(value),
            "dst" => mount.with_destination(value),
            "fstype" => mount.with_kind(value),
            "rw" => mount.read_write(parse_bool(value).ok_or_else(|| {
                invalid(format!("'{value}' is not a boolean"))
            })?),
            "mandatory" => mount.mandatory(parse_bool(value).ok_or_else(|| {
                invalid(format!("'{value}' is not a boolean"))
            })?),
            other => return Err(invalid(format!("unknown key '{other}'"))),
        };
        seen.push(key);
    }

    mount.validate().map_err(|e| match e {
        JailError::InvalidMount { reason, .. } => invalid(reason),
        other => other,
    })?;
    Ok(mount)
}

/// Maps aliases to the short key names used in the rendered policy.
fn canonical_key(key: &str) -> &str {
    match key {
        "source" => "src",
        "destination" => "dst",
        "writable" => "rw",
        "kind" => "fstype",
        other => other,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_parse_empty_value() {
        assert!(parse_extra_mounts("").unwrap().is_empty());
        assert!(parse_extra_mounts(" ; ;").unwrap().is_empty());
    }

    #[test]
    fn test_parse_optional_source() {
        let mounts = parse_extra_mounts("src=/opt/x,mandatory=false").unwrap();
        assert_eq!(mounts, vec![MountDeclaration::bind("/opt/x").optional()]);
    }

    #[test]
    fn test_parse_bare_source_shorthand() {
        let mounts = parse_extra_mounts("/opt/x,mandatory=no").unwrap();
        assert_eq!(mounts, vec![MountDeclaration::bind("/opt/x").optional()]);
    }

    #[test]
    fn test_parse_multiple_entries_in_order() {
        let mounts = parse_extra_mounts(
            "src=/srv/cache,dst=/cache,rw=true; dst=/scratch,fstype=tmpfs,rw=yes;",
        )
        .unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].effective_destination(), Some(Path::new("/cache")));
        assert!(mounts[0].is_writable());
        assert_eq!(mounts[1], MountDeclaration::tmpfs("/scratch"));
    }

    #[test]
    fn test_parse_bare_source_containing_equals() {
        let mounts = parse_extra_mounts("/opt/a=b,mandatory=false").unwrap();
        assert_eq!(mounts, vec![MountDeclaration::bind("/opt/a=b").optional()]);

        let mount = parse_entry("src=/opt/a=b,dst=/x=y").unwrap();
        assert_eq!(mount.source(), Some(Path::new("/opt/a=b")));
        assert_eq!(mount.destination(), Some(Path::new("/x=y")));
    }

    #[test]
    fn test_parse_separators_cannot_appear_in_paths() {
        // A comma always starts a new field.
        assert!(parse_entry("/opt/a,b").is_err());
        // Surrounding whitespace is not part of the path.
        let mount = parse_entry("  /opt/x  ").unwrap();
        assert_eq!(mount.source(), Some(Path::new("/opt/x")));
    }

    #[test]
    fn test_parse_aliases() {
        let mount =
            parse_entry("source=/a, destination=/b, writable=on, kind=tmpfs, mandatory=1").unwrap();
        assert_eq!(mount.source(), Some(Path::new("/a")));
        assert_eq!(mount.destination(), Some(Path::new("/b")));
        assert!(mount.is_writable());
        assert_eq!(mount.kind(), Some("tmpfs"));
        assert!(mount.is_mandatory());
    }

    #[test]
    fn test_parse_rejects_unknown_key() {
        let err = parse_entry("src=/opt,exec=rm").unwrap_err();
        assert!(matches!(err, JailError::InvalidExtraMount { .. }));
        assert!(err.to_string().contains("src=/opt,exec=rm"));
        assert!(err.to_string().contains("unknown key 'exec'"));
    }

    #[test]
    fn test_parse_rejects_expressions() {
        for entry in [
            "__import__('os').system('id')",
            "{'source': '/opt/x'}",
            "$(id)",
            "src=/opt,rw=True and False",
        ] {
            assert!(parse_entry(entry).is_err(), "{entry}");
        }
    }

    #[test]
    fn test_parse_rejects_bad_booleans_and_values() {
        assert!(parse_entry("src=/opt,rw=maybe").is_err());
        assert!(parse_entry("src=/opt,mandatory=").is_err());
        assert!(parse_entry("src=/opt,,rw=true").is_err());
        assert!(parse_entry("src=/opt,/other").is_err());
    }

    #[test]
    fn test_parse_rejects_repeated_keys() {
        let err = parse_entry("src=/a,source=/b").unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_parse_enforces_mount_invariants() {
        let err = parse_entry("dst=/x,fstype=tmpfs").unwrap_err();
        assert!(err.to_string().contains("must be writable"));
        assert!(err.to_string().contains("dst=/x,fstype=tmpfs"));

        assert!(parse_entry("dst=/x").is_err());
        assert!(parse_entry("src=relative").is_err());
    }

    #[test]
    fn test_first_bad_entry_fails_whole_list() {
        let err = parse_extra_mounts("src=/ok;src=/bad,rw=perhaps").unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("src=/bad,rw=perhaps"));
    }
}
