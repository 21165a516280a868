//! Jail orchestration.
//!
//! [`JailManager`] ties the pipeline together for one invocation:
//!
//! 1. **Initialization**: resolve the sandbox engine binary. This happens
//!    before any policy is built, so a host without nsjail fails fast.
//! 2. **Preparation**: build the policy from the [`JailContext`] and render
//!    it, dropping optional mounts that do not exist.
//! 3. **Execution**: hand the rendered policy to nsjail and return its exit
//!    code.
//!
//! # Example
//!
//! ```no_run
//! use quilt_jail::config::{EnvFlags, JailConfig};
//! use quilt_jail::context::{HostFilesystem, JailContext};
//! use quilt_jail::sandbox::manager::JailManager;
//!
//! # fn example() -> Result<(), quilt_jail::error::JailError> {
//! let flags = EnvFlags::from_env();
//! let mut manager = JailManager::new(JailConfig::load(&flags)?, flags.clone());
//! manager.initialize()?;
//!
//! let context = JailContext::detect(&flags)?;
//! let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();
//! let code = manager.run(&context, &HostFilesystem, &args)?;
//! println!("quilt exited with {code}");
//! # Ok(())
//! # }
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::{EnvFlags, JailConfig};
use crate::context::{FsProbe, JailContext};
use crate::error::JailError;
use crate::policy::builder::build_policy;
use crate::policy::render::render_policy;
use crate::sandbox::nsjail::{self, LaunchOptions};

/// Stands in for the temporary policy file path in [`DryRun::args`].
pub const POLICY_PLACEHOLDER: &str = "<policy-file>";

/// What a run would do, without doing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRun {
    pub engine: PathBuf,
    pub args: Vec<OsString>,
    pub policy: String,
}

/// Coordinates policy construction and engine invocation.
pub struct JailManager {
    config: JailConfig,
    flags: EnvFlags,
    engine: Option<PathBuf>,
}

impl JailManager {
    /// Creates a manager. Call [`JailManager::initialize`] before running.
    pub fn new(config: JailConfig, flags: EnvFlags) -> Self {
        Self {
            config,
            flags,
            engine: None,
        }
    }

    /// Resolves the sandbox engine binary.
    ///
    /// # Errors
    ///
    /// Returns [`JailError::EngineNotFound`] if the configured engine is not
    /// installed.
    pub fn initialize(&mut self) -> Result<(), JailError> {
        let engine = nsjail::locate_engine(&self.config.engine)?;
        tracing::debug!("Sandbox engine: {}", engine.display());
        self.engine = Some(engine);
        Ok(())
    }

    /// Builds and renders the policy for `context`.
    pub fn render(&self, context: &JailContext, probe: &dyn FsProbe) -> Result<String, JailError> {
        let policy = build_policy(context, &self.config, probe)?;
        tracing::debug!("Built policy with {} mount(s)", policy.mounts().len());
        render_policy(&policy, probe)
    }

    /// Renders the policy and the engine arguments without launching.
    pub fn dry_run(
        &self,
        context: &JailContext,
        probe: &dyn FsProbe,
        args: &[OsString],
    ) -> Result<DryRun, JailError> {
        let engine = self.engine()?.to_path_buf();
        let policy = self.render(context, probe)?;
        let args = nsjail::build_engine_args(
            Path::new(POLICY_PLACEHOLDER),
            context.mode,
            &self.config,
            args,
            self.flags.verbose,
        );
        Ok(DryRun {
            engine,
            args,
            policy,
        })
    }

    /// Runs quilt (or the shell) in the jail and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager was not initialized, the policy
    /// cannot be built or rendered, or the engine cannot be started.
    pub fn run(
        &self,
        context: &JailContext,
        probe: &dyn FsProbe,
        args: &[OsString],
    ) -> Result<i32, JailError> {
        let engine = self.engine()?;
        let policy = self.render(context, probe)?;

        tracing::debug!("Launching {:?} mode in {}", context.mode, context.cwd.display());
        nsjail::launch(
            engine,
            &policy,
            context.mode,
            &self.config,
            args,
            LaunchOptions {
                verbose: self.flags.verbose,
                debug: self.flags.debug,
            },
        )
    }

    fn engine(&self) -> Result<&Path, JailError> {
        self.engine.as_deref().ok_or_else(|| {
            JailError::Config("sandbox engine not resolved; call initialize() first".to_string())
        })
    }
}
