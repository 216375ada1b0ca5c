//! Typed operations against the `pct` container CLI
//!
//! Each method maps to one CLI verb and returns structured errors. The
//! adapter is the only component allowed to mutate containers or the
//! host-side per-container config files. In dry-run mode it overlays the
//! assumed results of logged commands (created, started, snapshotted) so
//! the state machine can traverse end-to-end for a container that does not
//! exist yet.

use crate::errors::{CommandError, PhoenixError, Result};
use crate::exec::{CommandExecutor, CommandOutput, ExecOpts};
use crate::manifest::ContainerSpec;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Default directory of host-side per-container config files.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/pve/lxc";

/// Budget for create/clone, which may download and unpack images.
const PROVISION_TIMEOUT: Duration = Duration::from_secs(600);

/// Container lifecycle state as reported by `pct status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtStatus {
    Stopped,
    Running,
    Unknown,
}

impl FromStr for CtStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim() {
            "stopped" => CtStatus::Stopped,
            "running" => CtStatus::Running,
            _ => CtStatus::Unknown,
        })
    }
}

impl std::fmt::Display for CtStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CtStatus::Stopped => write!(f, "stopped"),
            CtStatus::Running => write!(f, "running"),
            CtStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Full parameter set for `pct create`.
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub hostname: String,
    pub template: String,
    pub memory_mb: u64,
    pub cores: u32,
    pub rootfs: String,
    pub net0: String,
    pub unprivileged: bool,
    /// `nesting=1,keyctl=1`, required for a container runtime inside LXC
    pub nesting: bool,
}

impl CreateParams {
    /// Derive create parameters from a container spec.
    ///
    /// Fails when the spec declares no base image; only root templates are
    /// created from scratch, everything else is cloned.
    pub fn from_spec(ctid: u32, spec: &ContainerSpec) -> Result<Self> {
        let template = spec.template.clone().ok_or_else(|| {
            PhoenixError::Config(crate::errors::ConfigError::FieldMissing {
                ctid,
                field: "template",
            })
        })?;
        Ok(Self {
            hostname: spec.name.clone(),
            template,
            memory_mb: spec.memory_mb,
            cores: spec.cores,
            rootfs: spec.rootfs(),
            net0: spec.net0(),
            unprivileged: spec.unprivileged,
            nesting: spec.needs_docker(),
        })
    }
}

/// Partial update for `pct set`. Only present fields are applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigPatch {
    pub memory_mb: Option<u64>,
    pub cores: Option<u32>,
    pub net0: Option<String>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.memory_mb.is_none() && self.cores.is_none() && self.net0.is_none()
    }
}

/// Currently applied configuration, parsed from `pct config`.
#[derive(Debug, Clone, Default)]
pub struct CtConfig {
    pub memory_mb: Option<u64>,
    pub cores: Option<u32>,
    pub net0: Option<String>,
}

impl CtConfig {
    fn parse(text: &str) -> Self {
        let mut fields: HashMap<&str, &str> = HashMap::new();
        for line in text.lines() {
            if let Some((key, value)) = line.split_once(':') {
                fields.insert(key.trim(), value.trim());
            }
        }
        Self {
            memory_mb: fields.get("memory").and_then(|v| v.parse().ok()),
            cores: fields.get("cores").and_then(|v| v.parse().ok()),
            net0: fields.get("net0").map(|v| v.to_string()),
        }
    }
}

#[derive(Default)]
struct DryRunOverlay {
    created: HashSet<u32>,
    running: HashSet<u32>,
    /// Real containers whose logged stop/shutdown is assumed to have landed
    stopped: HashSet<u32>,
    snapshots: HashMap<u32, BTreeSet<String>>,
}

/// Typed wrapper over the `pct` CLI.
pub struct PctAdapter {
    exec: Arc<dyn CommandExecutor>,
    config_dir: PathBuf,
    overlay: Mutex<DryRunOverlay>,
    appended_lines: AtomicU64,
}

impl PctAdapter {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self::with_config_dir(exec, PathBuf::from(DEFAULT_CONFIG_DIR))
    }

    /// Use a non-default config directory (tests, chrooted hosts).
    pub fn with_config_dir(exec: Arc<dyn CommandExecutor>, config_dir: PathBuf) -> Self {
        Self {
            exec,
            config_dir,
            overlay: Mutex::new(DryRunOverlay::default()),
            appended_lines: AtomicU64::new(0),
        }
    }

    /// The executor this adapter routes everything through.
    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.exec
    }

    /// Mutations issued through this adapter, including config-file appends.
    pub fn mutation_count(&self) -> u64 {
        self.exec.mutation_count() + self.appended_lines.load(Ordering::SeqCst)
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn overlay_created(&self, ctid: u32) -> bool {
        self.exec.is_dry_run()
            && self
                .overlay
                .lock()
                .map(|overlay| overlay.created.contains(&ctid))
                .unwrap_or(false)
    }

    fn with_overlay(&self, update: impl FnOnce(&mut DryRunOverlay)) {
        if let Ok(mut overlay) = self.overlay.lock() {
            update(&mut overlay);
        }
    }

    /// Whether a container with this CTID exists. Absence is not an error.
    pub async fn exists(&self, ctid: u32) -> Result<bool> {
        if self.overlay_created(ctid) {
            return Ok(true);
        }
        let out = self
            .exec
            .run_host(
                &Self::argv(&["pct", "status", &ctid.to_string()]),
                &ExecOpts::probe(),
            )
            .await?;
        Ok(out.success())
    }

    /// Lifecycle state of an existing container.
    pub async fn status(&self, ctid: u32) -> Result<CtStatus> {
        if self.exec.is_dry_run() {
            if let Ok(overlay) = self.overlay.lock() {
                if overlay.running.contains(&ctid) {
                    return Ok(CtStatus::Running);
                }
                if overlay.stopped.contains(&ctid) || overlay.created.contains(&ctid) {
                    return Ok(CtStatus::Stopped);
                }
            }
        }
        let out = self
            .exec
            .run_host(
                &Self::argv(&["pct", "status", &ctid.to_string()]),
                &ExecOpts::query(),
            )
            .await?;
        Ok(parse_status(out.stdout_trimmed()))
    }

    /// Create a container from a base image. Fails if it already exists.
    pub async fn create(&self, ctid: u32, params: &CreateParams) -> Result<()> {
        let ctid_s = ctid.to_string();
        let memory = params.memory_mb.to_string();
        let cores = params.cores.to_string();
        let unprivileged = if params.unprivileged { "1" } else { "0" };
        let mut argv = Self::argv(&[
            "pct",
            "create",
            &ctid_s,
            &params.template,
            "--hostname",
            &params.hostname,
            "--memory",
            &memory,
            "--cores",
            &cores,
            "--rootfs",
            &params.rootfs,
            "--net0",
            &params.net0,
            "--unprivileged",
            unprivileged,
        ]);
        if params.nesting {
            argv.push("--features".to_string());
            argv.push("nesting=1,keyctl=1".to_string());
        }
        self.exec
            .run_host(&argv, &ExecOpts::mutating().with_timeout(PROVISION_TIMEOUT))
            .await?;
        self.note_created(ctid);
        info!(ctid, hostname = %params.hostname, "container created");
        Ok(())
    }

    /// Clone a container from another CTID's named snapshot.
    pub async fn clone_from(
        &self,
        source_ctid: u32,
        snapshot: &str,
        ctid: u32,
        hostname: &str,
        storage_pool: &str,
    ) -> Result<()> {
        let argv = Self::argv(&[
            "pct",
            "clone",
            &source_ctid.to_string(),
            &ctid.to_string(),
            "--snapname",
            snapshot,
            "--hostname",
            hostname,
            "--storage",
            storage_pool,
        ]);
        self.exec
            .run_host(&argv, &ExecOpts::mutating().with_timeout(PROVISION_TIMEOUT))
            .await?;
        self.note_created(ctid);
        info!(ctid, source_ctid, snapshot, "container cloned");
        Ok(())
    }

    fn note_created(&self, ctid: u32) {
        if self.exec.is_dry_run() {
            self.with_overlay(|overlay| {
                overlay.created.insert(ctid);
            });
            self.exec.note_dry_run_container(ctid);
        }
    }

    /// Currently applied resources. Empty for a container that only exists
    /// as a dry-run assumption.
    pub async fn config(&self, ctid: u32) -> Result<CtConfig> {
        if self.overlay_created(ctid) {
            return Ok(CtConfig::default());
        }
        let out = self
            .exec
            .run_host(
                &Self::argv(&["pct", "config", &ctid.to_string()]),
                &ExecOpts::query(),
            )
            .await?;
        Ok(CtConfig::parse(&out.stdout))
    }

    /// Apply a configuration patch. Safe to re-apply identical values.
    pub async fn set(&self, ctid: u32, patch: &ConfigPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut argv = Self::argv(&["pct", "set", &ctid.to_string()]);
        if let Some(memory_mb) = patch.memory_mb {
            argv.push("--memory".to_string());
            argv.push(memory_mb.to_string());
        }
        if let Some(cores) = patch.cores {
            argv.push("--cores".to_string());
            argv.push(cores.to_string());
        }
        if let Some(net0) = &patch.net0 {
            argv.push("--net0".to_string());
            argv.push(net0.clone());
        }
        self.exec.run_host(&argv, &ExecOpts::mutating()).await?;
        Ok(())
    }

    pub async fn start(&self, ctid: u32) -> Result<()> {
        self.exec
            .run_host(
                &Self::argv(&["pct", "start", &ctid.to_string()]),
                &ExecOpts::mutating(),
            )
            .await?;
        if self.exec.is_dry_run() {
            self.with_overlay(|overlay| {
                overlay.running.insert(ctid);
                overlay.stopped.remove(&ctid);
            });
        }
        Ok(())
    }

    /// Immediate stop.
    pub async fn stop(&self, ctid: u32) -> Result<()> {
        self.exec
            .run_host(
                &Self::argv(&["pct", "stop", &ctid.to_string()]),
                &ExecOpts::mutating(),
            )
            .await?;
        if self.exec.is_dry_run() {
            self.with_overlay(|overlay| {
                overlay.running.remove(&ctid);
                overlay.stopped.insert(ctid);
            });
        }
        Ok(())
    }

    /// Graceful shutdown; the caller waits for `stopped` separately.
    pub async fn shutdown(&self, ctid: u32) -> Result<()> {
        self.exec
            .run_host(
                &Self::argv(&["pct", "shutdown", &ctid.to_string()]),
                &ExecOpts::mutating().with_timeout(Duration::from_secs(120)),
            )
            .await?;
        if self.exec.is_dry_run() {
            self.with_overlay(|overlay| {
                overlay.running.remove(&ctid);
                overlay.stopped.insert(ctid);
            });
        }
        Ok(())
    }

    /// Create a named snapshot. Fails if the name is already taken.
    pub async fn snapshot(&self, ctid: u32, name: &str) -> Result<()> {
        let result = self
            .exec
            .run_host(
                &Self::argv(&["pct", "snapshot", &ctid.to_string(), name]),
                &ExecOpts::mutating().with_timeout(Duration::from_secs(300)),
            )
            .await;
        match result {
            Ok(_) => {
                if self.exec.is_dry_run() {
                    self.with_overlay(|overlay| {
                        overlay
                            .snapshots
                            .entry(ctid)
                            .or_default()
                            .insert(name.to_string());
                    });
                }
                info!(ctid, name, "snapshot created");
                Ok(())
            }
            Err(PhoenixError::Command(CommandError::ExitNonZero { stderr, .. })) => {
                Err(PhoenixError::Snapshot {
                    ctid,
                    name: name.to_string(),
                    message: stderr,
                })
            }
            Err(other) => Err(other),
        }
    }

    /// Names of all snapshots of this container.
    pub async fn list_snapshots(&self, ctid: u32) -> Result<Vec<String>> {
        let mut names: BTreeSet<String> = BTreeSet::new();
        if self.overlay_created(ctid) {
            // No real container to ask; the overlay is the whole truth.
        } else {
            let out = self
                .exec
                .run_host(
                    &Self::argv(&["pct", "listsnapshot", &ctid.to_string()]),
                    &ExecOpts::query(),
                )
                .await?;
            names.extend(parse_snapshot_names(&out.stdout));
        }
        if self.exec.is_dry_run() {
            if let Ok(overlay) = self.overlay.lock() {
                if let Some(assumed) = overlay.snapshots.get(&ctid) {
                    names.extend(assumed.iter().cloned());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Run a command inside the container via the executor.
    pub async fn exec(&self, ctid: u32, argv: &[String], opts: &ExecOpts) -> Result<CommandOutput> {
        self.exec.run_in_container(ctid, argv, opts).await
    }

    /// Path of the host-side per-container config file.
    pub fn config_file_path(&self, ctid: u32) -> PathBuf {
        self.config_dir.join(format!("{ctid}.conf"))
    }

    /// Append `line` to the per-container config file unless an identical
    /// line is already present. Existing lines are never rewritten or
    /// reordered. Returns whether the line was (or, in dry-run, would have
    /// been) appended.
    pub async fn append_unique_config_line(&self, ctid: u32, line: &str) -> Result<bool> {
        let path = self.config_file_path(ctid);
        let wanted = line.trim();
        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && self.exec.is_dry_run() => {
                String::new()
            }
            Err(e) => {
                return Err(PhoenixError::Command(CommandError::Io {
                    command: format!("append to {}", path.display()),
                    source: e,
                }));
            }
        };

        if existing.lines().any(|l| l.trim() == wanted) {
            debug!(ctid, line = wanted, "config line already present");
            return Ok(false);
        }

        self.appended_lines.fetch_add(1, Ordering::SeqCst);
        if self.exec.is_dry_run() {
            info!(ctid, line = wanted, "dry-run: would append config line");
            return Ok(true);
        }

        let mut content = String::new();
        if !existing.is_empty() && !existing.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(wanted);
        content.push('\n');
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                PhoenixError::Command(CommandError::Io {
                    command: format!("append to {}", path.display()),
                    source: e,
                })
            })?;
        file.write_all(content.as_bytes()).await.map_err(|e| {
            PhoenixError::Command(CommandError::Io {
                command: format!("append to {}", path.display()),
                source: e,
            })
        })?;
        info!(ctid, line = wanted, "appended config line");
        Ok(true)
    }
}

impl std::fmt::Debug for PctAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PctAdapter")
            .field("config_dir", &self.config_dir)
            .finish()
    }
}

fn parse_status(stdout: &str) -> CtStatus {
    // `pct status <ctid>` prints `status: running`
    stdout
        .split_once(':')
        .map(|(_, value)| value.trim().parse().unwrap_or(CtStatus::Unknown))
        .unwrap_or(CtStatus::Unknown)
}

/// Parse `pct listsnapshot` output into snapshot names.
///
/// Lines look like `` `-> base-snapshot 2025-01-01 ... `` with a synthetic
/// `current` entry for the live state, which is not a snapshot.
fn parse_snapshot_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim_start_matches([' ', '`', '-', '>']);
            trimmed.split_whitespace().next()
        })
        .filter(|name| !name.is_empty() && *name != "current")
        .map(|name| name.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fail, FakeExecutor};

    fn adapter(exec: FakeExecutor) -> (Arc<FakeExecutor>, PctAdapter) {
        let exec = Arc::new(exec);
        let adapter = PctAdapter::new(exec.clone() as Arc<dyn CommandExecutor>);
        (exec, adapter)
    }

    #[tokio::test]
    async fn absence_is_not_an_error() {
        let fake = FakeExecutor::new();
        fake.on("pct status 950", vec![fail(2, "Configuration file 'nodes/pve/lxc/950.conf' does not exist")]);
        let (_, adapter) = adapter(fake);
        assert!(!adapter.exists(950).await.unwrap());
    }

    #[tokio::test]
    async fn status_parses_pct_output() {
        let fake = FakeExecutor::new();
        fake.on_ok("pct status 900", "status: running");
        let (_, adapter) = adapter(fake);
        assert_eq!(adapter.status(900).await.unwrap(), CtStatus::Running);
    }

    #[tokio::test]
    async fn create_builds_full_argv() {
        let fake = FakeExecutor::new();
        let (exec, adapter) = adapter(fake);
        let manifest = crate::test_support::sample_manifest();
        let spec = manifest.get(900).unwrap();
        let params = CreateParams::from_spec(900, spec).unwrap();
        adapter.create(900, &params).await.unwrap();

        let calls = exec.mutating_calls();
        assert_eq!(calls.len(), 1);
        let joined = &calls[0].joined;
        assert!(joined.starts_with("pct create 900"));
        assert!(joined.contains("--hostname template-base"));
        assert!(joined.contains("--memory 2048"));
        assert!(joined.contains("--rootfs local-zfs:16"));
        assert!(joined.contains("--unprivileged 1"));
        // Base template has no docker feature, so no nesting.
        assert!(!joined.contains("nesting"));
    }

    #[tokio::test]
    async fn create_requests_nesting_for_docker_specs() {
        let fake = FakeExecutor::new();
        let (exec, adapter) = adapter(fake);
        let manifest = crate::test_support::sample_manifest();
        let spec = manifest.get(950).unwrap();
        // 950 is normally cloned, but the params derivation is what's under test.
        let mut spec = spec.clone();
        spec.template = Some("local:vztmpl/ubuntu-24.04.tar.zst".to_string());
        let params = CreateParams::from_spec(950, &spec).unwrap();
        adapter.create(950, &params).await.unwrap();
        assert!(exec.mutating_calls()[0]
            .joined
            .contains("--features nesting=1,keyctl=1"));
    }

    #[tokio::test]
    async fn clone_names_source_and_snapshot() {
        let fake = FakeExecutor::new();
        let (exec, adapter) = adapter(fake);
        adapter
            .clone_from(900, "base-snapshot", 950, "vllm-qwen", "local-zfs")
            .await
            .unwrap();
        let joined = &exec.mutating_calls()[0].joined;
        assert_eq!(
            joined,
            "pct clone 900 950 --snapname base-snapshot --hostname vllm-qwen --storage local-zfs"
        );
    }

    #[tokio::test]
    async fn set_applies_only_present_fields() {
        let fake = FakeExecutor::new();
        let (exec, adapter) = adapter(fake);
        let patch = ConfigPatch {
            memory_mb: Some(65536),
            cores: None,
            net0: None,
        };
        adapter.set(950, &patch).await.unwrap();
        let joined = &exec.mutating_calls()[0].joined;
        assert_eq!(joined, "pct set 950 --memory 65536");

        adapter.set(950, &ConfigPatch::default()).await.unwrap();
        assert_eq!(exec.mutating_calls().len(), 1, "empty patch is a no-op");
    }

    #[tokio::test]
    async fn snapshot_error_is_typed_with_exit_code_seven() {
        let fake = FakeExecutor::new();
        fake.on("pct snapshot 900", vec![fail(255, "snapshot 'base-snapshot' already exists")]);
        let (_, adapter) = adapter(fake);
        let err = adapter.snapshot(900, "base-snapshot").await.unwrap_err();
        assert!(matches!(err, PhoenixError::Snapshot { ctid: 900, .. }));
        assert_eq!(err.exit_code(), 7);
    }

    #[tokio::test]
    async fn list_snapshots_parses_and_skips_current() {
        let fake = FakeExecutor::new();
        fake.on_ok(
            "pct listsnapshot 900",
            "`-> base-snapshot  2025-01-01 10:00:00  finished base template\n \
             `-> current                             You are here!\n",
        );
        let (_, adapter) = adapter(fake);
        let snaps = adapter.list_snapshots(900).await.unwrap();
        assert_eq!(snaps, vec!["base-snapshot"]);
    }

    #[tokio::test]
    async fn dry_run_overlay_traverses_nonexistent_container() {
        let fake = FakeExecutor::dry_run();
        fake.on("pct status 950", vec![fail(2, "does not exist")]);
        let (_, adapter) = adapter(fake);

        assert!(!adapter.exists(950).await.unwrap());
        adapter
            .clone_from(903, "docker-gpu-snapshot", 950, "vllm-qwen", "local-zfs")
            .await
            .unwrap();
        assert!(adapter.exists(950).await.unwrap());
        assert_eq!(adapter.status(950).await.unwrap(), CtStatus::Stopped);

        adapter.start(950).await.unwrap();
        assert_eq!(adapter.status(950).await.unwrap(), CtStatus::Running);

        adapter.snapshot(950, "work-snapshot").await.unwrap();
        assert_eq!(
            adapter.list_snapshots(950).await.unwrap(),
            vec!["work-snapshot"]
        );
    }

    #[tokio::test]
    async fn append_unique_config_line_appends_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeExecutor::new();
        let exec = Arc::new(fake);
        let adapter =
            PctAdapter::with_config_dir(exec as Arc<dyn CommandExecutor>, dir.path().to_path_buf());

        let path = adapter.config_file_path(901);
        std::fs::write(&path, "arch: amd64\nmemory: 4096\n").unwrap();

        let line = "lxc.cgroup2.devices.allow: c 195:* rwm";
        assert!(adapter.append_unique_config_line(901, line).await.unwrap());
        assert!(!adapter.append_unique_config_line(901, line).await.unwrap());
        assert!(!adapter.append_unique_config_line(901, line).await.unwrap());

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches(line).count(), 1);
        // Existing lines preserved in order.
        assert!(content.starts_with("arch: amd64\nmemory: 4096\n"));
        assert_eq!(adapter.mutation_count(), 1);
    }

    #[tokio::test]
    async fn append_preserves_files_without_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(FakeExecutor::new());
        let adapter =
            PctAdapter::with_config_dir(exec as Arc<dyn CommandExecutor>, dir.path().to_path_buf());
        let path = adapter.config_file_path(902);
        std::fs::write(&path, "arch: amd64").unwrap();

        adapter
            .append_unique_config_line(902, "lxc.mount.entry: /dev/nvidia0 dev/nvidia0 none bind,optional,create=file")
            .await
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("arch: amd64\nlxc.mount.entry:"));
        assert!(content.ends_with('\n'));
    }

    #[test]
    fn snapshot_name_parsing_handles_indentation() {
        let text = "`-> a-snap  2025-05-01\n  `-> b-snap 2025-05-02\n `-> current You are here!\n";
        assert_eq!(parse_snapshot_names(text), vec!["a-snap", "b-snap"]);
    }

    #[test]
    fn config_parse_reads_kv_lines() {
        let parsed = CtConfig::parse("arch: amd64\nmemory: 8192\ncores: 8\nnet0: name=eth0,bridge=vmbr0\n");
        assert_eq!(parsed.memory_mb, Some(8192));
        assert_eq!(parsed.cores, Some(8));
        assert_eq!(parsed.net0.as_deref(), Some("name=eth0,bridge=vmbr0"));
    }
}
