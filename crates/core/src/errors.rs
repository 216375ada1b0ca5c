//! Error types and handling
//!
//! Domain errors for the orchestrator. Every fatal path maps onto one of the
//! documented process exit codes; the mapping lives in
//! [`PhoenixError::exit_code`] so the binary never has to interpret error
//! internals.

use std::time::Duration;
use thiserror::Error;

/// Manifest and configuration errors. Exit code 2.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A manifest file is absent from its well-known (or overridden) path
    #[error("manifest file not found: {path}")]
    NotFound { path: String },

    /// A manifest file exists but is not valid JSON of the expected shape
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    /// The requested CTID has no entry in the manifest
    #[error("no container spec for CTID {ctid}")]
    SpecMissing { ctid: u32 },

    /// A required field is absent from a container spec
    #[error("CTID {ctid}: required field '{field}' is missing")]
    FieldMissing { ctid: u32, field: &'static str },

    /// A manifest invariant does not hold
    #[error("manifest validation failed: {message}")]
    Validation { message: String },

    /// Manifest I/O error
    #[error("failed to read manifest: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// External command failures surfaced by the command executor.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The program is not installed on the host
    #[error("command not found: {program}")]
    NotFound { program: String },

    /// The command ran and exited non-zero
    #[error("command `{command}` exited with code {code}: {stderr}")]
    ExitNonZero {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The command exceeded its timeout and was killed
    #[error("command `{command}` timed out after {elapsed:?}")]
    Timeout { command: String, elapsed: Duration },

    /// Spawning or talking to the child process failed
    #[error("i/o error running `{command}`: {source}")]
    Io {
        command: String,
        source: std::io::Error,
    },
}

/// Clone-source resolution failures.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The capability cascade found no declared template for this spec
    #[error(
        "CTID {ctid}: no suitable clone source for capabilities \
         (docker={needs_docker}, gpu={needs_gpu}, vllm={needs_vllm})"
    )]
    NoSuitableSource {
        ctid: u32,
        needs_docker: bool,
        needs_gpu: bool,
        needs_vllm: bool,
    },

    /// The chosen parent never produced its finished-state snapshot
    #[error("CTID {ctid}: clone source {source_ctid} has no snapshot '{snapshot}'")]
    SourceSnapshotMissing {
        ctid: u32,
        source_ctid: u32,
        snapshot: String,
    },
}

/// Top-level error for the orchestrator.
#[derive(Error, Debug)]
pub enum PhoenixError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A required external tool is absent from the host
    #[error("host prerequisite missing: {tool}")]
    Prerequisite { tool: String },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// A lifecycle or readiness probe exhausted its budget
    #[error("CTID {ctid}: timed out after {elapsed:?} waiting for {what}{}", detail_suffix(.detail))]
    ProbeTimeout {
        ctid: u32,
        what: String,
        elapsed: Duration,
        /// Extra diagnostics gathered at timeout (e.g. recent service logs)
        detail: Option<String>,
    },

    /// The container would not reach `running` within the retry budget
    #[error("CTID {ctid}: container failed to start after {attempts} attempts")]
    StartFailed { ctid: u32, attempts: u32 },

    /// A feature handler failed; tagged with the feature name
    #[error("CTID {ctid}: feature '{feature}' failed: {source}")]
    Feature {
        ctid: u32,
        feature: String,
        #[source]
        source: Box<PhoenixError>,
    },

    /// An application script failed; tagged with the script name
    #[error("CTID {ctid}: application script '{script}' failed: {source}")]
    Application {
        ctid: u32,
        script: String,
        #[source]
        source: Box<PhoenixError>,
    },

    /// Any failure while reconciling a template CTID
    #[error("template CTID {ctid} failed to reconcile: {source}")]
    Template {
        ctid: u32,
        #[source]
        source: Box<PhoenixError>,
    },

    /// Snapshot creation failed
    #[error("CTID {ctid}: failed to create snapshot '{name}': {message}")]
    Snapshot {
        ctid: u32,
        name: String,
        message: String,
    },

    /// The run was interrupted by SIGINT/SIGTERM
    #[error("interrupted before CTID {ctid} completed")]
    Interrupted { ctid: u32 },

    /// Post-condition verification failed (e.g. a driver reports the wrong
    /// version after install)
    #[error("{message}")]
    Unexpected { message: String },
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!("\n{d}"),
        None => String::new(),
    }
}

impl PhoenixError {
    /// Map this error onto the documented process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            PhoenixError::Config(_) => 2,
            PhoenixError::Resolve(ResolveError::NoSuitableSource { .. }) => 2,
            PhoenixError::Prerequisite { .. } => 3,
            PhoenixError::Command(CommandError::NotFound { .. }) => 3,
            PhoenixError::Feature { .. } | PhoenixError::Application { .. } => 4,
            PhoenixError::Template { .. } => 5,
            PhoenixError::ProbeTimeout { .. } | PhoenixError::StartFailed { .. } => 6,
            PhoenixError::Command(CommandError::Timeout { .. }) => 6,
            PhoenixError::Snapshot { .. } => 7,
            _ => 1,
        }
    }

    /// Wrap this error as a fatal template failure for `ctid`.
    pub fn into_template_failure(self, ctid: u32) -> PhoenixError {
        match self {
            already @ PhoenixError::Template { .. } => already,
            other => PhoenixError::Template {
                ctid,
                source: Box::new(other),
            },
        }
    }
}

/// Convenience type alias for Results with PhoenixError
pub type Result<T> = std::result::Result<T, PhoenixError>;
