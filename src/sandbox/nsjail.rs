//! nsjail invocation.
//!
//! This module turns rendered policy text into a running nsjail process:
//!
//! 1. The policy is written to a private temporary file
//! 2. The engine argument vector is built (`--config <file>`, then either the
//!    interactive shell or quilt with the caller's arguments)
//! 3. nsjail runs synchronously and its exit status becomes ours
//!
//! The temporary file lives exactly as long as the child process. It is
//! removed when [`launch`] returns, whether the engine succeeded, failed, or
//! could not be started. While the engine runs the wrapper ignores `SIGINT`,
//! `SIGQUIT` and `SIGTERM`: a Ctrl-C reaches the engine through the
//! foreground process group, and the wrapper stays alive to collect its exit
//! status and remove the file. A wrapper killed with `SIGKILL` leaves the
//! file behind; nothing tries to recover from that.

use std::ffi::{OsStr, OsString};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::{Mutex, PoisonError};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tempfile::NamedTempFile;

use crate::config::JailConfig;
use crate::error::JailError;
use crate::policy::JailMode;

const POLICY_FILE_PREFIX: &str = "quilt-jail-";
const POLICY_FILE_SUFFIX: &str = ".cfg";

/// Signals left to the engine while the wrapper waits for it.
const DEFERRED_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM];

/// Number of live [`DeferredSignals`] guards and the dispositions they replaced.
static DEFERRED: Mutex<(usize, Vec<(Signal, SigAction)>)> = Mutex::new((0, Vec::new()));

/// Output switches for a launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Keep engine logging and print the command line.
    pub verbose: bool,
    /// Print the policy text.
    pub debug: bool,
}

/// Resolves the engine binary, either by `PATH` lookup or as a path.
///
/// # Errors
///
/// Returns [`JailError::EngineNotFound`] if no executable matches.
pub fn locate_engine(engine: &str) -> Result<PathBuf, JailError> {
    which::which(engine).map_err(|e| JailError::EngineNotFound {
        name: engine.to_string(),
        reason: e.to_string(),
    })
}

/// Builds the nsjail arguments (without the program name).
///
/// In command mode `args` are appended after the quilt path exactly as
/// given. In shell mode they are ignored.
pub fn build_engine_args(
    policy_path: &Path,
    mode: JailMode,
    config: &JailConfig,
    args: &[OsString],
    verbose: bool,
) -> Vec<OsString> {
    let mut argv: Vec<OsString> = Vec::new();

    if !verbose {
        argv.push("--really_quiet".into());
    }
    argv.push("--config".into());
    argv.push(policy_path.into());
    argv.push("--".into());

    match mode {
        JailMode::Shell => {
            argv.extend(config.shell.iter().map(OsString::from));
        }
        JailMode::Command => {
            argv.push(config.quilt.clone().into());
            argv.extend(args.iter().cloned());
        }
    }

    argv
}

/// Writes `policy` to a new temporary file readable only by the owner.
pub fn write_policy_file(policy: &str) -> Result<NamedTempFile, JailError> {
    let mut file = tempfile::Builder::new()
        .prefix(POLICY_FILE_PREFIX)
        .suffix(POLICY_FILE_SUFFIX)
        .tempfile()
        .map_err(|e| JailError::io("failed to create temporary policy file", e))?;

    file.write_all(policy.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|e| JailError::io("failed to write temporary policy file", e))?;

    tracing::debug!("Policy written to: {}", file.path().display());
    Ok(file)
}

/// Runs `engine` with `policy` and returns the child's exit code.
///
/// Diagnostics requested through `options` go to stderr.
///
/// # Errors
///
/// Returns an error if the policy file cannot be written or the engine
/// cannot be spawned. A child that runs and fails is not an error: its exit
/// code is returned unchanged.
pub fn launch(
    engine: &Path,
    policy: &str,
    mode: JailMode,
    config: &JailConfig,
    args: &[OsString],
    options: LaunchOptions,
) -> Result<i32, JailError> {
    launch_with_output(engine, policy, mode, config, args, options, &mut io::stderr())
}

/// Same as [`launch`], writing the policy dump and the command line to `out`.
///
/// # Arguments
///
/// * `out` - Receives the policy text when `options.debug` is set and the
///   quoted command line when `options.verbose` is set
pub fn launch_with_output(
    engine: &Path,
    policy: &str,
    mode: JailMode,
    config: &JailConfig,
    args: &[OsString],
    options: LaunchOptions,
    out: &mut dyn Write,
) -> Result<i32, JailError> {
    let policy_file = write_policy_file(policy)?;
    let argv = build_engine_args(policy_file.path(), mode, config, args, options.verbose);

    if let Err(e) = report_launch(out, engine, &argv, policy, options) {
        tracing::warn!("Failed to write launch diagnostics: {e}");
    }

    let status = run_engine(engine, &argv);

    if let Err(e) = policy_file.close() {
        tracing::warn!("Failed to remove temporary policy file: {e}");
    }

    let status = status.map_err(|source| JailError::Spawn {
        program: engine.display().to_string(),
        source,
    })?;

    let code = exit_code_from_status(status);
    tracing::debug!("{} exited with code {code}", engine.display());
    Ok(code)
}

fn report_launch(
    out: &mut dyn Write,
    engine: &Path,
    argv: &[OsString],
    policy: &str,
    options: LaunchOptions,
) -> io::Result<()> {
    if options.debug {
        writeln!(out, "{policy}")?;
    }
    if options.verbose {
        writeln!(out, "+ {}", display_command(engine.as_os_str(), argv))?;
    }
    out.flush()
}

fn run_engine(engine: &Path, argv: &[OsString]) -> io::Result<ExitStatus> {
    let mut child = Command::new(engine).args(argv).spawn()?;
    // Installed after the spawn so the engine starts with default dispositions.
    let _deferred = DeferredSignals::install();
    child.wait()
}

/// Ignores [`DEFERRED_SIGNALS`] in this process until dropped.
///
/// Guards nest: the first one saves the previous dispositions and the last
/// one to drop restores them.
struct DeferredSignals;

impl DeferredSignals {
    fn install() -> Self {
        let mut state = DEFERRED.lock().unwrap_or_else(PoisonError::into_inner);
        if state.0 == 0 {
            let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
            for signal in DEFERRED_SIGNALS {
                // SAFETY: SIG_IGN installs no handler code.
                match unsafe { sigaction(signal, &ignore) } {
                    Ok(previous) => state.1.push((signal, previous)),
                    Err(e) => tracing::warn!("Failed to ignore {signal}: {e}"),
                }
            }
        }
        state.0 += 1;
        Self
    }
}

impl Drop for DeferredSignals {
    fn drop(&mut self) {
        let mut state = DEFERRED.lock().unwrap_or_else(PoisonError::into_inner);
        state.0 -= 1;
        if state.0 == 0 {
            for (signal, previous) in state.1.drain(..) {
                // SAFETY: restores a disposition previously returned by sigaction.
                if let Err(e) = unsafe { sigaction(signal, &previous) } {
                    tracing::warn!("Failed to restore {signal}: {e}");
                }
            }
        }
    }
}

/// Extracts the exit code from a process exit status.
///
/// A child killed by a signal reports `128 + signal`, as a shell would.
pub fn exit_code_from_status(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}

/// Formats a command line for display, quoting arguments where needed.
pub fn display_command(program: &OsStr, args: &[OsString]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(OsString::as_os_str))
        .map(|arg| {
            let arg = arg.to_string_lossy();
            shlex::try_quote(&arg)
                .map(|quoted| quoted.into_owned())
                .unwrap_or_else(|_| arg.into_owned())
        })
        .collect::<Vec<_>>()
        .join(" ")
}
