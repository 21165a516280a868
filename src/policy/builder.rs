//! Mount policy construction.
//!
//! [`build_policy`] turns a [`JailContext`] into a [`Policy`]. It is a pure
//! function of its inputs: the only host access goes through the
//! [`FsProbe`].
//!
//! # Mount order
//!
//! 1. Core binary and library directories, read-only
//! 2. `/etc/alternatives`, read-only, optional
//! 3. DNS config, linker cache, and (optional) package manager config
//! 4. tmpfs at `/tmp` and `/var/tmp`
//! 5. Installed-package database, read-only
//! 6. Package root, read-write
//! 7. tmpfs over the build-output directory in `$HOME`
//! 8. NSS configuration (required)
//! 9. quilt configuration files that exist
//! 10. Device nodes for the selected [`JailMode`]
//! 11. Extra mounts from the configuration file, then from the environment
//!
//! Later mounts may shadow earlier ones inside the sandbox.

use std::path::{Path, PathBuf};

use crate::config::JailConfig;
use crate::context::{FsProbe, JailContext};
use crate::error::JailError;
use crate::policy::extra_mounts::parse_extra_mounts;
use crate::policy::{JailMode, MountDeclaration, Policy, PolicySettings};
use crate::utils::textproto::Value;

/// Process name recorded in the policy.
pub const JAIL_NAME: &str = "quilt-jail";

const CORE_DIRS: &[&str] = &["/bin", "/lib", "/lib64", "/usr", "/sbin"];

const ALTERNATIVES_DIR: &str = "/etc/alternatives";
const RESOLV_CONF: &str = "/etc/resolv.conf";
const LD_SO_CACHE: &str = "/etc/ld.so.cache";
const PACKAGE_CONFIG_DIR: &str = "/etc/rpm";
const PACKAGE_DB_DIR: &str = "/var/lib/rpm";

/// Checked in order; the first one found is mounted.
pub const NSSWITCH_CANDIDATES: &[&str] = &["/etc/nsswitch.conf", "/usr/etc/nsswitch.conf"];

/// User-level config first, then system-wide. Relative entries live in `$HOME`.
const QUILTRC_CANDIDATES: &[&str] = &[".quiltrc", "/etc/quilt.quiltrc"];

/// Resource classes whose hard limit is applied inside the jail.
pub const RLIMIT_CLASSES: &[&str] = &["as", "core", "cpu", "fsize", "nofile", "nproc", "stack"];

/// Environment variables inherited from the caller.
pub const INHERITED_ENV: &[&str] = &["HOME", "PATH"];

/// Builds the policy for one invocation.
///
/// # Errors
///
/// - [`JailError::MissingNsswitch`] if no NSS configuration exists on the host
/// - [`JailError::InvalidExtraMount`] if the extra-mount value cannot be parsed
pub fn build_policy(
    context: &JailContext,
    config: &JailConfig,
    probe: &dyn FsProbe,
) -> Result<Policy, JailError> {
    let mut mounts = Vec::new();

    mounts.extend(CORE_DIRS.iter().map(|dir| MountDeclaration::bind(*dir)));
    mounts.push(MountDeclaration::bind(ALTERNATIVES_DIR).optional());

    mounts.push(MountDeclaration::bind(RESOLV_CONF));
    mounts.push(MountDeclaration::bind(LD_SO_CACHE));
    mounts.push(MountDeclaration::bind(PACKAGE_CONFIG_DIR).optional());

    mounts.push(MountDeclaration::tmpfs("/tmp"));
    mounts.push(MountDeclaration::tmpfs("/var/tmp"));

    mounts.push(MountDeclaration::bind(PACKAGE_DB_DIR));

    let root = package_root(&context.cwd, probe);
    tracing::debug!("Package root: {}", root.display());
    mounts.push(MountDeclaration::bind(root).read_write(true));

    mounts.push(MountDeclaration::tmpfs(context.home.join(&config.build_dir)));

    let nsswitch = find_nsswitch(probe)?;
    tracing::debug!("Using NSS configuration: {}", nsswitch.display());
    mounts.push(MountDeclaration::bind(nsswitch));

    for quiltrc in quiltrc_candidates(&context.home) {
        if probe.exists(&quiltrc) {
            tracing::debug!("Exposing quilt configuration: {}", quiltrc.display());
            mounts.push(MountDeclaration::bind(quiltrc));
        }
    }

    match context.mode {
        JailMode::Shell => {
            mounts.push(MountDeclaration::bind("/dev").read_write(true));
        }
        JailMode::Command => {
            mounts.push(MountDeclaration::bind("/dev/null").read_write(true));
            mounts.push(MountDeclaration::bind("/dev/urandom").read_write(true));
        }
    }

    mounts.extend(config.extra_mounts.iter().cloned());
    if let Some(extra) = &context.extra_mounts {
        let parsed = parse_extra_mounts(extra)?;
        tracing::debug!("Parsed {} extra mount(s) from the environment", parsed.len());
        mounts.extend(parsed);
    }

    Ok(Policy::new(build_settings(context, config), mounts))
}

/// Returns the directory that holds the patch set.
///
/// A `patches` symlink in `cwd` means the sources were unpacked into a
/// subdirectory of the package, so the package root is the parent.
pub fn package_root(cwd: &Path, probe: &dyn FsProbe) -> PathBuf {
    if probe.is_symlink(&cwd.join("patches")) {
        if let Some(parent) = cwd.parent() {
            return parent.to_path_buf();
        }
    }
    cwd.to_path_buf()
}

fn find_nsswitch(probe: &dyn FsProbe) -> Result<PathBuf, JailError> {
    NSSWITCH_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|candidate| probe.exists(candidate))
        .ok_or_else(|| JailError::MissingNsswitch {
            candidates: NSSWITCH_CANDIDATES.iter().map(PathBuf::from).collect(),
        })
}

fn quiltrc_candidates(home: &Path) -> impl Iterator<Item = PathBuf> + '_ {
    QUILTRC_CANDIDATES.iter().map(move |candidate| home.join(candidate))
}

fn build_settings(context: &JailContext, config: &JailConfig) -> PolicySettings {
    let mut settings = PolicySettings::new();

    settings.push("name", JAIL_NAME);
    settings.push(
        "description",
        format!("quilt confined by {JAIL_NAME} in {}", context.cwd.display()),
    );
    settings.push("hostname", context.hostname.as_str());
    settings.push("cwd", context.cwd.as_path());

    for var in INHERITED_ENV {
        settings.push("envar", *var);
    }
    for class in RLIMIT_CLASSES {
        settings.push(format!("rlimit_{class}_type"), Value::Ident("HARD".to_string()));
    }

    match context.mode {
        // Letting the shell reach the real terminal also lets it push input
        // back into the host terminal. Interactive use accepts that.
        JailMode::Shell => {
            settings.push("mount_proc", true);
            settings.push("skip_setsid", true);
        }
        JailMode::Command => {
            settings.push("time_limit", config.time_limit);
        }
    }

    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MemoryProbe;

    fn context(mode: JailMode) -> JailContext {
        JailContext {
            cwd: PathBuf::from("/home/builder/pkgs/hello"),
            home: PathBuf::from("/home/builder"),
            hostname: "buildhost".to_string(),
            mode,
            extra_mounts: None,
        }
    }

    fn probe() -> MemoryProbe {
        MemoryProbe::new().with_file("/etc/nsswitch.conf")
    }

    fn has_mount(policy: &Policy, dst: &str) -> bool {
        policy.mounts_at(Path::new(dst)).next().is_some()
    }

    #[test]
    fn test_core_dirs_are_read_only_binds() {
        let policy = build_policy(&context(JailMode::Command), &JailConfig::default(), &probe())
            .unwrap();
        for dir in CORE_DIRS {
            let mount = policy.mounts_at(Path::new(dir)).next().unwrap();
            assert!(mount.is_bind());
            assert!(!mount.is_writable());
            assert!(mount.is_mandatory());
        }
        assert_eq!(policy.mounts()[0].source(), Some(Path::new("/bin")));
    }

    #[test]
    fn test_optional_system_mounts() {
        let policy = build_policy(&context(JailMode::Command), &JailConfig::default(), &probe())
            .unwrap();
        for path in [ALTERNATIVES_DIR, PACKAGE_CONFIG_DIR] {
            let mount = policy.mounts_at(Path::new(path)).next().unwrap();
            assert!(!mount.is_mandatory(), "{path}");
        }
        for path in [RESOLV_CONF, LD_SO_CACHE, PACKAGE_DB_DIR] {
            let mount = policy.mounts_at(Path::new(path)).next().unwrap();
            assert!(mount.is_mandatory(), "{path}");
            assert!(!mount.is_writable(), "{path}");
        }
    }

    #[test]
    fn test_tmpfs_mounts() {
        let policy = build_policy(&context(JailMode::Command), &JailConfig::default(), &probe())
            .unwrap();
        for dst in ["/tmp", "/var/tmp", "/home/builder/rpmbuild"] {
            let mount = policy.mounts_at(Path::new(dst)).next().unwrap();
            assert_eq!(mount.kind(), Some("tmpfs"), "{dst}");
            assert!(mount.is_writable());
            assert!(!mount.is_bind());
        }
    }

    #[test]
    fn test_build_dir_follows_config() {
        let config = JailConfig {
            build_dir: PathBuf::from("build/out"),
            ..JailConfig::default()
        };
        let policy = build_policy(&context(JailMode::Command), &config, &probe()).unwrap();
        assert!(has_mount(&policy, "/home/builder/build/out"));
        assert!(!has_mount(&policy, "/home/builder/rpmbuild"));
    }

    #[test]
    fn test_package_root_is_cwd_without_symlink() {
        let cwd = Path::new("/work/pkg");
        assert_eq!(package_root(cwd, &MemoryProbe::new()), PathBuf::from("/work/pkg"));

        let plain_dir = MemoryProbe::new().with_file("/work/pkg/patches");
        assert_eq!(package_root(cwd, &plain_dir), PathBuf::from("/work/pkg"));
    }

    #[test]
    fn test_package_root_is_parent_with_patches_symlink() {
        let probe = MemoryProbe::new().with_symlink("/work/pkg/hello-1.0/patches");
        assert_eq!(
            package_root(Path::new("/work/pkg/hello-1.0"), &probe),
            PathBuf::from("/work/pkg")
        );
    }

    #[test]
    fn test_package_root_on_host_filesystem() {
        use crate::context::HostFilesystem;

        let dir = tempfile::TempDir::new().unwrap();
        let unpacked = dir.path().join("hello-1.0");
        std::fs::create_dir(&unpacked).unwrap();
        std::fs::create_dir(dir.path().join("patches")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("patches"), unpacked.join("patches")).unwrap();

        assert_eq!(package_root(&unpacked, &HostFilesystem), dir.path());
        assert_eq!(package_root(dir.path(), &HostFilesystem), dir.path());
    }

    #[test]
    fn test_package_root_is_writable_mount() {
        let ctx = context(JailMode::Command);
        let probe = probe().with_symlink("/home/builder/pkgs/hello/patches");
        let policy = build_policy(&ctx, &JailConfig::default(), &probe).unwrap();
        let root = policy.mounts_at(Path::new("/home/builder/pkgs")).next().unwrap();
        assert!(root.is_writable());
        assert!(root.is_bind());
        assert!(!has_mount(&policy, "/home/builder/pkgs/hello"));
    }

    #[test]
    fn test_nsswitch_prefers_etc() {
        let probe = MemoryProbe::new()
            .with_file("/etc/nsswitch.conf")
            .with_file("/usr/etc/nsswitch.conf");
        let policy =
            build_policy(&context(JailMode::Command), &JailConfig::default(), &probe).unwrap();
        assert!(has_mount(&policy, "/etc/nsswitch.conf"));
        assert!(!has_mount(&policy, "/usr/etc/nsswitch.conf"));
    }

    #[test]
    fn test_nsswitch_falls_back_to_usr_etc() {
        let probe = MemoryProbe::new().with_file("/usr/etc/nsswitch.conf");
        let policy =
            build_policy(&context(JailMode::Command), &JailConfig::default(), &probe).unwrap();
        assert!(has_mount(&policy, "/usr/etc/nsswitch.conf"));
    }

    #[test]
    fn test_missing_nsswitch_fails_with_exit_code_2() {
        let err = build_policy(
            &context(JailMode::Command),
            &JailConfig::default(),
            &MemoryProbe::new(),
        )
        .unwrap_err();
        assert!(matches!(err, JailError::MissingNsswitch { .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_quiltrc_candidates_in_order() {
        let probe = probe()
            .with_file("/etc/quilt.quiltrc")
            .with_file("/home/builder/.quiltrc");
        let policy =
            build_policy(&context(JailMode::Command), &JailConfig::default(), &probe).unwrap();

        let user = policy
            .mounts()
            .iter()
            .position(|m| m.source() == Some(Path::new("/home/builder/.quiltrc")))
            .unwrap();
        let system = policy
            .mounts()
            .iter()
            .position(|m| m.source() == Some(Path::new("/etc/quilt.quiltrc")))
            .unwrap();
        assert!(user < system);
    }

    #[test]
    fn test_missing_quiltrc_is_not_mounted() {
        let policy = build_policy(&context(JailMode::Command), &JailConfig::default(), &probe())
            .unwrap();
        assert!(!has_mount(&policy, "/home/builder/.quiltrc"));
        assert!(!has_mount(&policy, "/etc/quilt.quiltrc"));
    }

    #[test]
    fn test_shell_mode_devices_and_settings() {
        let policy =
            build_policy(&context(JailMode::Shell), &JailConfig::default(), &probe()).unwrap();

        let dev = policy.mounts_at(Path::new("/dev")).next().unwrap();
        assert!(dev.is_writable());
        assert!(!has_mount(&policy, "/dev/null"));
        assert!(!has_mount(&policy, "/dev/urandom"));

        let settings = policy.settings();
        assert_eq!(settings.get("mount_proc"), Some(&Value::Bool(true)));
        assert_eq!(settings.get("skip_setsid"), Some(&Value::Bool(true)));
        assert!(!settings.contains("time_limit"));
    }

    #[test]
    fn test_command_mode_devices_and_settings() {
        let policy = build_policy(&context(JailMode::Command), &JailConfig::default(), &probe())
            .unwrap();

        for dev in ["/dev/null", "/dev/urandom"] {
            let mount = policy.mounts_at(Path::new(dev)).next().unwrap();
            assert!(mount.is_writable(), "{dev}");
        }
        assert!(!has_mount(&policy, "/dev"));

        let settings = policy.settings();
        assert_eq!(settings.get("time_limit"), Some(&Value::Int(600)));
        assert!(!settings.contains("mount_proc"));
        assert!(!settings.contains("skip_setsid"));
    }

    #[test]
    fn test_settings_content_and_order() {
        let policy = build_policy(&context(JailMode::Command), &JailConfig::default(), &probe())
            .unwrap();
        let settings = policy.settings();

        assert_eq!(settings.get("name"), Some(&Value::from(JAIL_NAME)));
        assert_eq!(settings.get("hostname"), Some(&Value::from("buildhost")));
        assert_eq!(settings.get("cwd"), Some(&Value::from("/home/builder/pkgs/hello")));
        let envars: Vec<_> = settings.get_all("envar").collect();
        assert_eq!(envars, vec![&Value::from("HOME"), &Value::from("PATH")]);

        let keys: Vec<_> = settings.iter().map(|(k, _)| k.to_string()).collect();
        let expected_rlimits: Vec<_> = RLIMIT_CLASSES
            .iter()
            .map(|c| format!("rlimit_{c}_type"))
            .collect();
        assert_eq!(&keys[..4], ["name", "description", "hostname", "cwd"]);
        assert_eq!(&keys[6..13], expected_rlimits.as_slice());
        for key in &expected_rlimits {
            assert_eq!(settings.get(key), Some(&Value::Ident("HARD".to_string())));
        }
    }

    #[test]
    fn test_non_utf8_cwd_is_kept_exactly() {
        use std::ffi::OsString;
        use std::os::unix::ffi::OsStringExt;

        let mut ctx = context(JailMode::Command);
        ctx.cwd = PathBuf::from(OsString::from_vec(b"/home/builder/pkgs/caf\xe9".to_vec()));
        let policy = build_policy(&ctx, &JailConfig::default(), &probe()).unwrap();

        let cwd = policy.settings().get("cwd").and_then(Value::as_path);
        assert_eq!(cwd, Some(ctx.cwd.as_path()));
        let root = policy.mounts_at(&ctx.cwd).next().unwrap();
        assert_eq!(root.source(), Some(ctx.cwd.as_path()));
        assert!(root.is_writable());
    }

    #[test]
    fn test_extra_mounts_are_appended_last() {
        let mut ctx = context(JailMode::Command);
        ctx.extra_mounts = Some("src=/opt/x,mandatory=false".to_string());
        let config = JailConfig {
            extra_mounts: vec![MountDeclaration::bind("/srv/mirror")],
            ..JailConfig::default()
        };

        let policy = build_policy(&ctx, &config, &probe()).unwrap();
        let n = policy.mounts().len();
        assert_eq!(policy.mounts()[n - 2], MountDeclaration::bind("/srv/mirror"));
        assert_eq!(policy.mounts()[n - 1], MountDeclaration::bind("/opt/x").optional());
    }

    #[test]
    fn test_invalid_extra_mount_fails() {
        let mut ctx = context(JailMode::Command);
        ctx.extra_mounts = Some("src=/opt/x,evaluate=1".to_string());
        let err = build_policy(&ctx, &JailConfig::default(), &probe()).unwrap_err();
        assert!(matches!(err, JailError::InvalidExtraMount { .. }));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_every_built_mount_is_valid() {
        for mode in [JailMode::Command, JailMode::Shell] {
            let policy = build_policy(&context(mode), &JailConfig::default(), &probe()).unwrap();
            for mount in policy.mounts() {
                assert!(mount.validate().is_ok(), "{mount}");
            }
        }
    }
}
