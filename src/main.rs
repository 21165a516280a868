//! quilt-jail - CLI entry point
//!
//! Drop-in replacement for `quilt`: every argument is forwarded to quilt
//! unchanged, so the wrapper has no options of its own. Behavior is tuned
//! through the environment instead:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `QUILT_JAIL_SHELL` | Start an interactive shell in the jail instead of quilt |
//! | `QUILT_JAIL_VERBOSE` | Keep nsjail logging, print the command line, debug logs |
//! | `QUILT_JAIL_DEBUG` | Print the generated policy to stderr |
//! | `QUILT_JAIL_EXTRA_MOUNTS` | Additional mounts, `src=/a,dst=/b,rw=true;...` |
//! | `QUILT_JAIL_CONFIG` | JSON site configuration file |
//! | `RUST_LOG` | Overrides the log filter |
//!
//! # Examples
//!
//! ```text
//! quilt-jail push -a
//! QUILT_JAIL_SHELL=1 quilt-jail
//! QUILT_JAIL_EXTRA_MOUNTS=/opt/sdk,mandatory=false quilt-jail refresh
//! ```

use std::ffi::OsString;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use quilt_jail::config::{EnvFlags, JailConfig};
use quilt_jail::context::{HostFilesystem, JailContext};
use quilt_jail::error::JailError;
use quilt_jail::sandbox::manager::JailManager;

fn main() -> ExitCode {
    let flags = EnvFlags::from_env();

    if let Err(e) = initialize_logging(flags.verbose) {
        eprintln!("quilt-jail: failed to initialize logging: {e}");
    }

    match run(flags) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("quilt-jail: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Runs one jailed invocation and returns the exit code to report.
fn run(flags: EnvFlags) -> Result<u8, JailError> {
    let config = JailConfig::load(&flags)?;

    let mut manager = JailManager::new(config, flags.clone());
    // Engine check first: nothing is built on a host without nsjail.
    manager.initialize()?;

    let context = JailContext::detect(&flags)?;
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();

    let code = manager.run(&context, &HostFilesystem, &args)?;
    Ok(clamp_exit_code(code))
}

/// Maps a child exit code onto the range a process can report.
fn clamp_exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

fn log_level(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "warn"
    }
}

/// Initializes the logging system.
///
/// Logs go to stderr so they never mix with quilt's own output. The level
/// is `debug` when verbose and `warn` otherwise; `RUST_LOG` takes
/// precedence over both.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
fn initialize_logging(verbose: bool) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    Ok(())
}
