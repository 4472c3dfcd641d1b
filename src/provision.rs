use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::config::SupervisorConfig;
use crate::error::{CommandError, NotFoundError, ProvisionError, ProvisionStep, VerifyCheck};
use crate::platform::{interpreter_candidates, DistroFamily, EnvLayout, Platform};
use crate::resolver::{self, FallbackPolicy, Resolution, Resolver, RuntimeDescriptor};

const MIN_IMPORT_TIMEOUT: Duration = Duration::from_secs(30);
const OUTPUT_TAIL_LINES: usize = 20;

struct AtomicFlagGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> AtomicFlagGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Relaxed);
        Self { flag }
    }
}

impl Drop for AtomicFlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub platform: Platform,
    pub env_dir: PathBuf,
    pub manifest: PathBuf,
    pub framework_module: String,
    pub interpreter_override: Option<String>,
    pub fallback: FallbackPolicy,
    pub auto_install: bool,
    pub probe_timeout: Duration,
    pub install_timeout: Duration,
    pub os_release: PathBuf,
}

impl ProvisionSettings {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            platform: Platform::current(),
            env_dir: config.env_dir.clone(),
            manifest: config.manifest_path(),
            framework_module: config.framework_module.clone(),
            interpreter_override: config.interpreter.clone(),
            fallback: config.fallback,
            auto_install: config.auto_install,
            probe_timeout: config.version_probe_timeout(),
            install_timeout: config.install_timeout(),
            os_release: config.os_release.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentState {
    pub isolated_env_path: PathBuf,
    /// The environment directory was created by this call.
    pub created: bool,
    /// The manifest was installed by this call.
    pub dependencies_installed: bool,
    pub python: PathBuf,
    pub interpreter_version: Option<String>,
    pub framework_version: Option<String>,
}

pub struct Provisioner<R> {
    runner: Arc<R>,
    settings: ProvisionSettings,
    layout: EnvLayout,
    lock: Mutex<()>,
    in_progress: AtomicBool,
}

impl<R: CommandRunner> Provisioner<R> {
    pub fn new(runner: Arc<R>, settings: ProvisionSettings) -> Self {
        let layout = EnvLayout::new(settings.env_dir.clone(), settings.platform);
        Self {
            runner,
            settings,
            layout,
            lock: Mutex::new(()),
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }

    pub fn layout(&self) -> &EnvLayout {
        &self.layout
    }

    pub fn is_provisioning(&self) -> bool {
        self.in_progress.load(Ordering::Relaxed)
    }

    /// Makes sure the isolated environment exists and imports the framework.
    ///
    /// Interpreter lookup, environment creation and the dependency install only
    /// run when the environment directory is missing; verification always runs.
    pub async fn ensure_environment(
        &self,
        interpreter: &mut RuntimeDescriptor,
        package_manager: &mut RuntimeDescriptor,
        cancel: &CancellationToken,
    ) -> Result<EnvironmentState, ProvisionError> {
        let _serial = self.lock.lock().await;
        let _flag = AtomicFlagGuard::set(&self.in_progress);

        let env_dir = self.layout.root().to_path_buf();
        let mut state = EnvironmentState {
            isolated_env_path: env_dir.clone(),
            created: false,
            dependencies_installed: false,
            python: self.layout.python(),
            interpreter_version: None,
            framework_version: None,
        };

        if path_exists(&env_dir).await {
            info!(
                "environment {} already exists; skipping provisioning",
                env_dir.display()
            );
        } else {
            info!("provisioning environment at {}", env_dir.display());
            let python = self.ensure_interpreter(interpreter, cancel).await?;
            self.create_environment(&python, cancel).await?;
            state.created = true;
            state.dependencies_installed = self.install_dependencies(package_manager, cancel).await?;
        }

        let (interpreter_version, framework_version) = self.verify(cancel).await?;
        state.interpreter_version = interpreter_version;
        state.framework_version = framework_version;
        info!(
            "environment ready ({} {})",
            self.settings.framework_module,
            state.framework_version.as_deref().unwrap_or("unknown")
        );
        Ok(state)
    }

    /// Resolves the system interpreter with the configured fallback policy and
    /// without installing anything.
    pub async fn resolve_interpreter(
        &self,
        interpreter: &mut RuntimeDescriptor,
    ) -> Result<Resolution, NotFoundError> {
        let candidates =
            interpreter_candidates(self.settings.platform, self.settings.interpreter_override.as_deref());
        Resolver::new(self.runner.as_ref(), self.settings.probe_timeout)
            .resolve(interpreter, &candidates, self.settings.fallback)
            .await
    }

    /// Deletes the environment so the next call provisions from scratch.
    pub async fn reset_environment(&self) -> io::Result<()> {
        let _serial = self.lock.lock().await;
        let root = self.layout.root();
        if path_exists(root).await {
            info!("removing environment {}", root.display());
            tokio::fs::remove_dir_all(root).await?;
        }
        Ok(())
    }

    async fn ensure_interpreter(
        &self,
        interpreter: &mut RuntimeDescriptor,
        cancel: &CancellationToken,
    ) -> Result<String, ProvisionError> {
        let step = ProvisionStep::EnsureInterpreter;
        let candidates =
            interpreter_candidates(self.settings.platform, self.settings.interpreter_override.as_deref());
        let resolver = Resolver::new(self.runner.as_ref(), self.settings.probe_timeout);

        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProvisionError::Cancelled(step)),
            result = resolver.resolve(interpreter, &candidates, FallbackPolicy::FailFast) => result,
        };
        if let Ok(resolution) = first {
            return Ok(resolution.path);
        }

        let mut attempted: Vec<&'static str> = Vec::new();
        if self.settings.auto_install {
            attempted = self.run_installers(cancel).await?;
            if !attempted.is_empty() {
                let retry = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ProvisionError::Cancelled(step)),
                    result = resolver.resolve(interpreter, &candidates, FallbackPolicy::FailFast) => result,
                };
                if let Ok(resolution) = retry {
                    return Ok(resolution.path);
                }
            }
        }

        match self.settings.fallback {
            FallbackPolicy::BareCommand => Ok(resolver::apply_fallback(interpreter).path),
            FallbackPolicy::FailFast => {
                let manual = self.settings.platform.strategy().manual_install_hint;
                let hint = if attempted.is_empty() {
                    manual.to_string()
                } else {
                    format!(
                        "Automatic install via {} did not provide one. {manual}",
                        attempted.join(", ")
                    )
                };
                let err = ProvisionError::InterpreterMissing {
                    not_found: resolver::not_found(interpreter),
                    hint,
                };
                error!("{err}");
                Err(err)
            }
        }
    }

    /// Runs the platform install recipes in order until one completes. Returns
    /// the labels of every recipe that was attempted.
    async fn run_installers(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<&'static str>, ProvisionError> {
        let strategy = self.settings.platform.strategy();
        let distro = match self.settings.platform {
            Platform::Linux => match tokio::fs::read_to_string(&self.settings.os_release).await {
                Ok(contents) => DistroFamily::from_os_release(&contents),
                Err(err) => {
                    warn!(
                        "cannot read {}: {err}",
                        self.settings.os_release.display()
                    );
                    DistroFamily::Unknown
                }
            },
            _ => DistroFamily::Unknown,
        };

        let mut attempted = Vec::new();
        for recipe in strategy.installers_for(distro) {
            attempted.push(recipe.label);
            info!("installing interpreter via {}", recipe.label);
            let mut completed = true;
            for command in recipe.commands {
                let Some((program, args)) = command.split_first() else {
                    continue;
                };
                let spec = CommandSpec::new(*program, self.settings.install_timeout)
                    .args(args.iter().copied());
                match self
                    .run_cancellable(ProvisionStep::EnsureInterpreter, &spec, cancel)
                    .await?
                {
                    Ok(output) if output.success() => {}
                    Ok(output) => {
                        warn!(
                            "{} failed ({}): {}",
                            spec.display(),
                            describe_exit(&output),
                            output.tail(OUTPUT_TAIL_LINES)
                        );
                        completed = false;
                        break;
                    }
                    Err(err) => {
                        warn!("{} could not run: {err}", spec.display());
                        completed = false;
                        break;
                    }
                }
            }
            if completed {
                break;
            }
        }
        if attempted.is_empty() {
            warn!("no automatic interpreter install available on {}", self.settings.platform);
        }
        Ok(attempted)
    }

    async fn create_environment(
        &self,
        python: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let step = ProvisionStep::CreateEnvironment;
        let env_dir = self.layout.root();
        if let Some(parent) = env_dir.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| ProvisionError::StepFailed {
                    step,
                    message: format!("cannot create {}: {err}", parent.display()),
                    command: None,
                    output: String::new(),
                })?;
        }

        let spec = CommandSpec::new(python, self.settings.install_timeout)
            .args(["-m", "venv"])
            .arg(env_dir.to_string_lossy());
        info!("creating environment: {}", spec.display());
        let result = self.run_step(step, &spec, cancel).await;
        if result.is_err() && path_exists(env_dir).await {
            if let Err(err) = tokio::fs::remove_dir_all(env_dir).await {
                warn!("cannot remove partial environment {}: {err}", env_dir.display());
            }
        }
        result.map(|_| ())
    }

    async fn install_dependencies(
        &self,
        package_manager: &mut RuntimeDescriptor,
        cancel: &CancellationToken,
    ) -> Result<bool, ProvisionError> {
        let step = ProvisionStep::InstallDependencies;
        let manifest = &self.settings.manifest;
        if !path_exists(manifest).await {
            info!(
                "no dependency manifest at {}; skipping install",
                manifest.display()
            );
            return Ok(false);
        }

        // The environment is new, so any earlier resolution points elsewhere.
        package_manager.reset();
        let candidates = self.layout.pip_candidates();
        let resolver = Resolver::new(self.runner.as_ref(), self.settings.probe_timeout);
        let pip = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProvisionError::Cancelled(step)),
            result = resolver.resolve(package_manager, &candidates, FallbackPolicy::FailFast) => result,
        }
        .map_err(|err| ProvisionError::StepFailed {
            step,
            message: err.to_string(),
            command: None,
            output: String::new(),
        })?;

        let mut spec = CommandSpec::new(pip.path, self.settings.install_timeout)
            .args(["install", "-r"])
            .arg(manifest.to_string_lossy());
        spec.cwd = manifest.parent().map(Path::to_path_buf);
        info!("installing dependencies: {}", spec.display());
        self.run_step(step, &spec, cancel).await?;
        Ok(true)
    }

    async fn verify(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Option<String>, Option<String>), ProvisionError> {
        let python = self.layout.python().to_string_lossy().to_string();

        let spec = CommandSpec::new(python.as_str(), self.settings.probe_timeout).arg("--version");
        let output = self
            .run_step(ProvisionStep::Verify(VerifyCheck::InterpreterVersion), &spec, cancel)
            .await?;
        let interpreter_version = first_line(&output.combined());

        let module = &self.settings.framework_module;
        let spec = CommandSpec::new(python, self.settings.probe_timeout.max(MIN_IMPORT_TIMEOUT))
            .arg("-c")
            .arg(format!("import {module}; print({module}.get_version())"));
        let output = self
            .run_step(ProvisionStep::Verify(VerifyCheck::FrameworkModule), &spec, cancel)
            .await?;
        let framework_version = first_line(&output.stdout);

        Ok((interpreter_version, framework_version))
    }

    /// Outer error is cancellation only; the inner result is the command's.
    async fn run_cancellable(
        &self,
        step: ProvisionStep,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<Result<CommandOutput, CommandError>, ProvisionError> {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled(step));
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProvisionError::Cancelled(step)),
            result = self.runner.run(spec) => Ok(result),
        }
    }

    async fn run_step(
        &self,
        step: ProvisionStep,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ProvisionError> {
        let err = match self.run_cancellable(step, spec, cancel).await? {
            Ok(output) if output.success() => return Ok(output),
            Ok(output) => ProvisionError::StepFailed {
                step,
                message: describe_exit(&output),
                command: Some(spec.display()),
                output: output.tail(OUTPUT_TAIL_LINES),
            },
            Err(err) => ProvisionError::StepFailed {
                step,
                message: err.to_string(),
                command: Some(spec.display()),
                output: String::new(),
            },
        };
        error!(
            "{err}\n  command: {}\n  output: {}",
            err.command().unwrap_or_default(),
            err.output()
        );
        Err(err)
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn describe_exit(output: &CommandOutput) -> String {
    match output.code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
