//! External command execution
//!
//! Single choke point for all side effects. Every external command, whether
//! on the hypervisor or inside a container via `pct exec`, runs through a
//! [`CommandExecutor`], which owns timeouts, output capture, dry-run
//! short-circuiting, mutation counting, and redacted logging. Callers
//! classify output; the executor never interprets it.

use crate::errors::{CommandError, PhoenixError, Result};
use crate::redaction::SecretRegistry;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Default timeout for external commands. Long-running installs override it.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Locale forced onto every child process so command output parses stably.
const CHILD_LOCALE: &str = "en_US.UTF-8";

/// Whether a command mutates host or container state.
///
/// Dry-run mode short-circuits mutating commands; queries always execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Read-only observation; runs even in dry-run mode
    Query,
    /// State-changing; logged and skipped in dry-run mode
    Mutating,
}

/// Options for a single command invocation.
#[derive(Debug, Clone)]
pub struct ExecOpts {
    /// Query or mutating; drives dry-run behavior and mutation counting
    pub class: CommandClass,
    /// Hard deadline; the child is killed when it elapses
    pub timeout: Duration,
    /// Capture stdout/stderr (true for almost everything)
    pub capture_output: bool,
    /// Discard stderr entirely (for probes expected to fail noisily)
    pub suppress_stderr: bool,
    /// Treat a non-zero exit as an error (default) or hand it back to the caller
    pub check: bool,
    /// Additional environment variables for the child
    pub env: Vec<(String, String)>,
}

impl ExecOpts {
    /// Read-only command; non-zero exit is an error.
    pub fn query() -> Self {
        Self {
            class: CommandClass::Query,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            capture_output: true,
            suppress_stderr: false,
            check: true,
            env: Vec::new(),
        }
    }

    /// Read-only probe; the caller classifies the exit code itself.
    pub fn probe() -> Self {
        Self {
            check: false,
            suppress_stderr: true,
            ..Self::query()
        }
    }

    /// State-changing command; non-zero exit is an error.
    pub fn mutating() -> Self {
        Self {
            class: CommandClass::Mutating,
            ..Self::query()
        }
    }

    /// Override the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add an environment variable for the child process.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Captured result of an executed command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code (`-1` when the process was killed by a signal)
    pub exit_code: i32,
    /// Captured stdout (empty when capture was disabled)
    pub stdout: String,
    /// Captured stderr (empty when capture was disabled or suppressed)
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout with surrounding whitespace removed.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Uniform invocation of external commands.
///
/// `run_host` executes on the hypervisor; `run_in_container` wraps the argv
/// through `pct exec`; `pipe_into` writes bytes to a path inside the
/// container atomically with the content carried on stdin, never through
/// shell interpolation.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a command on the hypervisor.
    async fn run_host(&self, argv: &[String], opts: &ExecOpts) -> Result<CommandOutput>;

    /// Run a single process inside a container.
    async fn run_in_container(
        &self,
        ctid: u32,
        argv: &[String],
        opts: &ExecOpts,
    ) -> Result<CommandOutput>;

    /// Atomically write `bytes` to `path` inside the container.
    async fn pipe_into(&self, ctid: u32, path: &str, bytes: &[u8]) -> Result<()>;

    /// Whether mutating commands are being skipped.
    fn is_dry_run(&self) -> bool;

    /// Number of mutating commands issued (or logged, in dry-run) so far.
    fn mutation_count(&self) -> u64;

    /// Mark a container as freshly created in this dry run.
    ///
    /// Queries against such a container cannot execute for real; the executor
    /// answers them with empty success instead, which is the expected
    /// post-condition of the logged creation. No-op outside dry-run mode.
    fn note_dry_run_container(&self, ctid: u32);

    /// Whether `ctid` only exists as the assumed result of dry-run commands.
    fn is_dry_run_container(&self, ctid: u32) -> bool;
}

/// Shell-joined argv for logging, with secrets redacted.
pub fn display_argv(argv: &[String], redactor: &SecretRegistry) -> String {
    redactor.redact_text(&shell_words::join(argv))
}

/// Apply the `check` policy to a finished command.
pub(crate) fn finalize_output(
    output: CommandOutput,
    opts: &ExecOpts,
    cmd_display: &str,
) -> Result<CommandOutput> {
    if output.success() || !opts.check {
        Ok(output)
    } else {
        Err(PhoenixError::Command(CommandError::ExitNonZero {
            command: cmd_display.to_string(),
            code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        }))
    }
}

/// Real executor backed by `tokio::process`.
pub struct HostExecutor {
    dry_run: bool,
    redactor: SecretRegistry,
    mutations: AtomicU64,
    dry_run_containers: std::sync::Mutex<std::collections::HashSet<u32>>,
}

impl HostExecutor {
    /// Create an executor. `dry_run` causes every mutating command to be
    /// logged and skipped.
    pub fn new(dry_run: bool, redactor: SecretRegistry) -> Self {
        Self {
            dry_run,
            redactor,
            mutations: AtomicU64::new(0),
            dry_run_containers: std::sync::Mutex::new(std::collections::HashSet::new()),
        }
    }

    fn record_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    /// Build the `pct exec` wrapper argv for an in-container command.
    fn container_argv(ctid: u32, argv: &[String], opts: &ExecOpts) -> Vec<String> {
        let mut wrapped = vec![
            "pct".to_string(),
            "exec".to_string(),
            ctid.to_string(),
            "--".to_string(),
            "env".to_string(),
            format!("LC_ALL={CHILD_LOCALE}"),
        ];
        for (key, value) in &opts.env {
            wrapped.push(format!("{key}={value}"));
        }
        wrapped.extend(argv.iter().cloned());
        wrapped
    }

    async fn spawn(
        &self,
        argv: &[String],
        opts: &ExecOpts,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput> {
        let cmd_display = display_argv(argv, &self.redactor);
        let program = argv
            .first()
            .ok_or_else(|| PhoenixError::Command(CommandError::NotFound {
                program: "<empty argv>".to_string(),
            }))?;

        let mut command = Command::new(program);
        command
            .args(&argv[1..])
            .env("LC_ALL", CHILD_LOCALE)
            .kill_on_drop(true)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if opts.capture_output {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(if opts.suppress_stderr {
                Stdio::null()
            } else if opts.capture_output {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        for (key, value) in &opts.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PhoenixError::Command(CommandError::NotFound {
                    program: program.clone(),
                })
            } else {
                PhoenixError::Command(CommandError::Io {
                    command: cmd_display.clone(),
                    source: e,
                })
            }
        })?;

        if let Some(bytes) = stdin {
            if let Some(mut handle) = child.stdin.take() {
                handle.write_all(bytes).await.map_err(|e| {
                    PhoenixError::Command(CommandError::Io {
                        command: cmd_display.clone(),
                        source: e,
                    })
                })?;
                // Close stdin so the child sees EOF.
                drop(handle);
            }
        }

        let waited = tokio::time::timeout(opts.timeout, child.wait_with_output()).await;
        let output = match waited {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(PhoenixError::Command(CommandError::Io {
                    command: cmd_display,
                    source: e,
                }));
            }
            Err(_) => {
                // kill_on_drop reaps the child.
                return Err(PhoenixError::Command(CommandError::Timeout {
                    command: cmd_display,
                    elapsed: opts.timeout,
                }));
            }
        };

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if result.success() {
            if opts.capture_output && !result.stdout.trim().is_empty() {
                for line in result.stdout.lines() {
                    debug!(output = %self.redactor.redact_text(line), "  captured");
                }
            }
        } else {
            debug!(
                command = %cmd_display,
                code = result.exit_code,
                stderr = %self.redactor.redact_text(result.stderr.trim()),
                "command exited non-zero"
            );
        }

        finalize_output(result, opts, &cmd_display)
    }

    async fn run(&self, argv: &[String], opts: &ExecOpts, ctid: Option<u32>) -> Result<CommandOutput> {
        let cmd_display = display_argv(argv, &self.redactor);
        match opts.class {
            CommandClass::Mutating => {
                self.record_mutation();
                if self.dry_run {
                    info!(ctid, command = %cmd_display, "dry-run: skipping mutating command");
                    return Ok(CommandOutput::default());
                }
                info!(ctid, command = %cmd_display, "running");
            }
            CommandClass::Query => {
                if self.dry_run {
                    if let Some(ctid) = ctid {
                        if self.is_dry_run_container(ctid) {
                            debug!(
                                ctid,
                                command = %cmd_display,
                                "dry-run: assuming success for query against assumed container"
                            );
                            return Ok(CommandOutput::default());
                        }
                    }
                }
                debug!(ctid, command = %cmd_display, "querying");
            }
        }
        self.spawn(argv, opts, None).await
    }
}

#[async_trait::async_trait]
impl CommandExecutor for HostExecutor {
    async fn run_host(&self, argv: &[String], opts: &ExecOpts) -> Result<CommandOutput> {
        self.run(argv, opts, None).await
    }

    async fn run_in_container(
        &self,
        ctid: u32,
        argv: &[String],
        opts: &ExecOpts,
    ) -> Result<CommandOutput> {
        let wrapped = Self::container_argv(ctid, argv, opts);
        // Env vars ride inside the wrapper argv; don't also set them on `pct`.
        let host_opts = ExecOpts {
            env: Vec::new(),
            ..opts.clone()
        };
        self.run(&wrapped, &host_opts, Some(ctid)).await
    }

    async fn pipe_into(&self, ctid: u32, path: &str, bytes: &[u8]) -> Result<()> {
        self.record_mutation();
        let quoted = shell_words::quote(path).into_owned();
        let script = format!("umask 022; cat > {quoted}.tmp && mv {quoted}.tmp {quoted}");
        let argv = vec![
            "pct".to_string(),
            "exec".to_string(),
            ctid.to_string(),
            "--".to_string(),
            "sh".to_string(),
            "-c".to_string(),
            script,
        ];
        let cmd_display = display_argv(&argv, &self.redactor);

        if self.dry_run {
            info!(
                ctid,
                path,
                bytes = bytes.len(),
                "dry-run: skipping file write into container"
            );
            return Ok(());
        }
        info!(ctid, path, bytes = bytes.len(), command = %cmd_display, "writing file into container");

        let opts = ExecOpts::mutating();
        self.spawn(&argv, &opts, Some(bytes)).await.map(|_| ())
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    fn note_dry_run_container(&self, ctid: u32) {
        if !self.dry_run {
            return;
        }
        if let Ok(mut set) = self.dry_run_containers.lock() {
            set.insert(ctid);
        }
    }

    fn is_dry_run_container(&self, ctid: u32) -> bool {
        if !self.dry_run {
            return false;
        }
        self.dry_run_containers
            .lock()
            .map(|set| set.contains(&ctid))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for HostExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostExecutor")
            .field("dry_run", &self.dry_run)
            .field("mutations", &self.mutation_count())
            .finish()
    }
}
