//! Per-container reconciliation engine
//!
//! Drives one CTID from "defined in manifest" to "running and fully
//! customized". Transitions are observations, not stored state: every
//! invocation re-derives where the container is from the host and advances.
//! The engine is stateless across runs; correctness comes from each step's
//! idempotency.
//!
//! Step order within a CTID: create-or-clone, configure, start,
//! features in declared order, application script, template snapshot.

use crate::applications::AppRegistry;
use crate::errors::{CommandError, PhoenixError, ResolveError, Result};
use crate::features::{FeatureContext, FeatureRegistry};
use crate::manifest::{ContainerSpec, Manifest};
use crate::pct::{ConfigPatch, CreateParams, CtStatus, PctAdapter};
use crate::probe::{
    Prober, ShutdownSignal, LIFECYCLE_INTERVAL, LIFECYCLE_TIMEOUT, READINESS_INTERVAL,
    READINESS_TIMEOUT,
};
use crate::resolver;
use crate::retry::{retry_async, RetryConfig, RetryDecision};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Start attempts before giving up (initial attempt plus retries).
const START_ATTEMPTS: u32 = 3;

/// What a reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// At least one mutating command was issued to reach the goal state
    Converged,
    /// Every step observed its goal state already in place
    AlreadySatisfied,
}

/// Reconciles single CTIDs against the manifest.
pub struct Reconciler {
    manifest: Arc<Manifest>,
    adapter: Arc<PctAdapter>,
    features: Arc<FeatureRegistry>,
    apps: Arc<AppRegistry>,
    prober: Prober,
    shutdown: ShutdownSignal,
}

impl Reconciler {
    pub fn new(
        manifest: Arc<Manifest>,
        adapter: Arc<PctAdapter>,
        features: Arc<FeatureRegistry>,
        apps: Arc<AppRegistry>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let prober = Prober::new(adapter.clone(), shutdown.clone());
        Self {
            manifest,
            adapter,
            features,
            apps,
            prober,
            shutdown,
        }
    }

    /// Drive `ctid` to its declared goal state.
    ///
    /// Any failure for a template CTID is wrapped as a fatal template
    /// failure.
    pub async fn reconcile(&self, ctid: u32) -> Result<ReconcileOutcome> {
        let spec = self.manifest.get(ctid)?;
        let result = self.reconcile_inner(ctid, spec).await;
        match result {
            Err(e) if spec.is_template => Err(e.into_template_failure(ctid)),
            other => other,
        }
    }

    async fn reconcile_inner(&self, ctid: u32, spec: &ContainerSpec) -> Result<ReconcileOutcome> {
        if self.shutdown.triggered() {
            return Err(PhoenixError::Interrupted { ctid });
        }
        let mutations_before = self.adapter.mutation_count();
        info!(ctid, name = %spec.name, "reconciling");

        self.ensure_exists(ctid, spec).await?;
        self.ensure_configured(ctid, spec).await?;
        self.ensure_running(ctid).await?;

        let ctx = FeatureContext {
            ctid,
            spec,
            manifest: &self.manifest,
            adapter: &self.adapter,
            prober: &self.prober,
        };
        self.features.dispatch(&ctx).await?;
        self.apps.dispatch(&ctx).await?;

        self.finalize_template(ctid, spec).await?;

        if self.adapter.mutation_count() > mutations_before {
            info!(ctid, "reconciled");
            Ok(ReconcileOutcome::Converged)
        } else {
            info!(ctid, "already satisfied");
            Ok(ReconcileOutcome::AlreadySatisfied)
        }
    }

    async fn ensure_exists(&self, ctid: u32, spec: &ContainerSpec) -> Result<()> {
        if self.adapter.exists(ctid).await? {
            info!(ctid, "container exists, reusing");
            return Ok(());
        }

        if spec.is_template && spec.clone_from_ctid.is_none() {
            let params = CreateParams::from_spec(ctid, spec)?;
            info!(ctid, template = %params.template, "creating container from base image");
            self.adapter.create(ctid, &params).await
        } else {
            let source = resolver::resolve_clone_source(&self.manifest, ctid, spec)?;
            let snapshots = self.adapter.list_snapshots(source.ctid).await?;
            if !snapshots.iter().any(|s| *s == source.snapshot) {
                return Err(PhoenixError::Resolve(ResolveError::SourceSnapshotMissing {
                    ctid,
                    source_ctid: source.ctid,
                    snapshot: source.snapshot,
                }));
            }
            PctAdapter::clone_from(
                &self.adapter,
                source.ctid,
                &source.snapshot,
                ctid,
                &spec.name,
                &spec.storage_pool,
            )
            .await
        }
    }

    async fn ensure_configured(&self, ctid: u32, spec: &ContainerSpec) -> Result<()> {
        let current = self.adapter.config(ctid).await?;
        let desired_net0 = spec.net0();

        let mut patch = ConfigPatch::default();
        if current.memory_mb != Some(spec.memory_mb) {
            patch.memory_mb = Some(spec.memory_mb);
        }
        if current.cores != Some(spec.cores) {
            patch.cores = Some(spec.cores);
        }
        let net0_current = current.net0.as_deref().unwrap_or("");
        if !net0_satisfies(net0_current, &desired_net0) {
            patch.net0 = Some(desired_net0);
        }

        if patch.is_empty() {
            debug!(ctid, "configuration up to date");
            Ok(())
        } else {
            info!(ctid, ?patch, "applying configuration");
            self.adapter.set(ctid, &patch).await
        }
    }

    async fn ensure_running(&self, ctid: u32) -> Result<()> {
        if self.adapter.status(ctid).await? != CtStatus::Running {
            let start_config = RetryConfig::container_start();
            retry_async(
                &start_config,
                |attempt| async move {
                    if attempt > 0 {
                        info!(ctid, attempt, "retrying container start");
                    }
                    self.adapter.start(ctid).await?;
                    let outcome = self
                        .prober
                        .wait_for_status(
                            ctid,
                            CtStatus::Running,
                            LIFECYCLE_TIMEOUT,
                            LIFECYCLE_INTERVAL,
                        )
                        .await?;
                    if outcome.ok {
                        Ok(())
                    } else {
                        Err(PhoenixError::ProbeTimeout {
                            ctid,
                            what: "running state after start".to_string(),
                            elapsed: outcome.elapsed,
                            detail: outcome.last_error,
                        })
                    }
                },
                |error| match error {
                    PhoenixError::Command(CommandError::NotFound { .. }) => RetryDecision::Stop,
                    _ => RetryDecision::Retry,
                },
            )
            .await
            .map_err(|e| match e {
                e @ PhoenixError::Command(CommandError::NotFound { .. }) => e,
                _ => PhoenixError::StartFailed {
                    ctid,
                    attempts: START_ATTEMPTS,
                },
            })?;
        }

        // No feature handler runs before the init system answers.
        let ready = self
            .prober
            .wait_for_ready(
                ctid,
                &["uptime".to_string()],
                |out| out.success(),
                READINESS_TIMEOUT,
                READINESS_INTERVAL,
            )
            .await?;
        if !ready.ok {
            return Err(PhoenixError::ProbeTimeout {
                ctid,
                what: "init readiness (uptime)".to_string(),
                elapsed: ready.elapsed,
                detail: ready.last_error,
            });
        }
        Ok(())
    }

    /// Capture the template's finished state as a named snapshot, taken with
    /// the container stopped for a consistent on-disk image.
    async fn finalize_template(&self, ctid: u32, spec: &ContainerSpec) -> Result<()> {
        let Some(name) = &spec.template_snapshot_name else {
            return Ok(());
        };
        let snapshots = self.adapter.list_snapshots(ctid).await?;
        if snapshots.iter().any(|s| s == name) {
            debug!(ctid, name = name.as_str(), "snapshot exists, skipping finalization");
            return Ok(());
        }

        info!(ctid, name = name.as_str(), "finalizing template snapshot");
        self.adapter.shutdown(ctid).await?;
        let stopped = self
            .prober
            .wait_for_status(ctid, CtStatus::Stopped, LIFECYCLE_TIMEOUT, LIFECYCLE_INTERVAL)
            .await?;
        if !stopped.ok {
            return Err(PhoenixError::ProbeTimeout {
                ctid,
                what: "stopped state before snapshot".to_string(),
                elapsed: stopped.elapsed,
                detail: stopped.last_error,
            });
        }

        self.adapter.snapshot(ctid, name).await?;

        self.adapter.start(ctid).await?;
        let running = self
            .prober
            .wait_for_status(ctid, CtStatus::Running, LIFECYCLE_TIMEOUT, LIFECYCLE_INTERVAL)
            .await?;
        if !running.ok {
            return Err(PhoenixError::ProbeTimeout {
                ctid,
                what: "running state after snapshot".to_string(),
                elapsed: running.elapsed,
                detail: running.last_error,
            });
        }
        Ok(())
    }
}

/// Whether the currently applied `net0` covers every desired `key=value`
/// pair. The CLI appends pairs we do not manage (`type=veth`, firewall
/// flags), so equality is on our keys only.
fn net0_satisfies(current: &str, desired: &str) -> bool {
    let parse = |s: &str| -> HashMap<String, String> {
        s.split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect()
    };
    let current = parse(current);
    parse(desired)
        .into_iter()
        .all(|(key, value)| current.get(&key).is_some_and(|v| v.eq_ignore_ascii_case(&value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandExecutor;
    use crate::test_support::{fail, ok, sample_manifest, FakeExecutor};

    fn reconciler(
        fake: FakeExecutor,
        config_dir: &std::path::Path,
    ) -> (Arc<FakeExecutor>, Arc<PctAdapter>, Reconciler) {
        let exec = Arc::new(fake);
        let adapter = Arc::new(PctAdapter::with_config_dir(
            exec.clone() as Arc<dyn CommandExecutor>,
            config_dir.to_path_buf(),
        ));
        let engine = Reconciler::new(
            Arc::new(sample_manifest()),
            adapter.clone(),
            Arc::new(FeatureRegistry::builtin()),
            Arc::new(AppRegistry::builtin()),
            ShutdownSignal::inert(),
        );
        (exec, adapter, engine)
    }

    fn base_template_config() -> &'static str {
        "memory: 2048\ncores: 2\nnet0: name=eth0,bridge=vmbr0,ip=10.0.0.10/24,gw=10.0.0.1,type=veth\n"
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_base_template_runs_full_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeExecutor::new();
        fake.on(
            "pct status 900",
            vec![
                fail(2, "does not exist"), // existence probe
                ok("status: stopped"),     // before start
                ok("status: running"),     // after start
                ok("status: stopped"),     // after shutdown, before snapshot
                ok("status: running"),     // after restart
            ],
        );
        fake.on_ok("pct config 900", base_template_config());
        fake.on("pct listsnapshot 900", vec![ok("")]);
        // base_setup has everything to do.
        fake.on("test -f /.phoenix_base_setup_complete", vec![fail(1, "")]);
        fake.on("dpkg-query -W", vec![fail(1, "not installed")]);
        fake.on("locale -a", vec![fail(1, "")]);

        let (exec, _, engine) = reconciler(fake, dir.path());
        let outcome = engine.reconcile(900).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Converged);

        let joined: Vec<String> = exec
            .mutating_calls()
            .into_iter()
            .map(|c| c.joined)
            .collect();
        let index_of = |needle: &str| {
            joined
                .iter()
                .position(|j| j.contains(needle))
                .unwrap_or_else(|| panic!("missing command: {needle}"))
        };

        let create = index_of("pct create 900");
        let start = index_of("pct start 900");
        let install = index_of("apt-get install -y");
        let shutdown = index_of("pct shutdown 900");
        let snapshot = index_of("pct snapshot 900 base-snapshot");
        assert!(create < start, "create before start");
        assert!(start < install, "customization only after start");
        assert!(install < shutdown, "features before finalization");
        assert!(shutdown < snapshot, "snapshot taken with container stopped");
        let restart = joined
            .iter()
            .rposition(|j| j.contains("pct start 900"))
            .unwrap();
        assert!(snapshot < restart, "restart after snapshot");
        assert_eq!(
            joined.iter().filter(|j| j.contains("pct start 900")).count(),
            2
        );
        // The marker was written through the file-push primitive.
        assert_eq!(exec.calls_containing("pipe-into /.phoenix_base_setup_complete"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_issues_zero_mutating_commands() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeExecutor::new();
        fake.on_ok("pct status 900", "status: running");
        fake.on_ok("pct config 900", base_template_config());
        fake.on_ok(
            "pct listsnapshot 900",
            "`-> base-snapshot 2025-06-01 10:00:00 finished\n `-> current You are here!\n",
        );
        // base_setup probes all satisfied (marker, packages, locale default ok).

        let (exec, _, engine) = reconciler(fake, dir.path());
        let outcome = engine.reconcile(900).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::AlreadySatisfied);
        assert_eq!(exec.mutation_count(), 0);
        assert!(exec.mutating_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn workload_clone_resolves_source_and_verifies_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeExecutor::new();
        fake.on(
            "pct status 950",
            vec![fail(2, "does not exist"), ok("status: stopped"), ok("status: running")],
        );
        fake.on_ok(
            "pct listsnapshot 920",
            "`-> vllm-snapshot 2025-06-01 11:00:00 vllm template\n",
        );
        fake.on_ok(
            "pct config 950",
            "memory: 65536\ncores: 12\nnet0: name=eth0,bridge=vmbr0,hwaddr=BC:24:11:52:9A:01,ip=10.0.0.50/24,gw=10.0.0.1,type=veth\n",
        );
        // All features probe satisfied: the clone came from the full template.
        fake.on_ok("nvidia-smi --query-gpu=driver_version", "580.65.06");
        fake.on_ok("docker --version", "Docker version 27.3.1");
        fake.on_ok("docker info --format", r#"{"nvidia":{}}"#);
        fake.on_ok("docker ps --filter name=^portainer_agent$", "portainer_agent");
        fake.on_ok("pip show vllm", "Editable project location: /opt/vllm");
        fake.on_ok(
            "curl -s http://127.0.0.1:8000/v1/models",
            r#"{"data":[{"id":"Qwen/Qwen2.5-7B-Instruct"}]}"#,
        );

        let (exec, _, engine) = reconciler(fake, dir.path());
        let outcome = engine.reconcile(950).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Converged);

        // 950 has no explicit parent; the cascade picks the full template.
        assert_eq!(
            exec.calls_containing(
                "pct clone 920 950 --snapname vllm-snapshot --hostname vllm-qwen --storage local-zfs"
            ),
            1
        );
        // The snapshot listing was consulted before the clone.
        let calls = exec.calls();
        let listing = calls
            .iter()
            .position(|c| c.joined.contains("pct listsnapshot 920"))
            .unwrap();
        let clone = calls
            .iter()
            .position(|c| c.joined.contains("pct clone 920 950"))
            .unwrap();
        assert!(listing < clone);
        // Only the clone and the first start mutate: every feature and the
        // application probed satisfied on the freshly cloned image.
        assert_eq!(exec.mutation_count(), 2);
        assert_eq!(exec.calls_containing("pct start 950"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_source_snapshot_fails_before_clone() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeExecutor::new();
        fake.on("pct status 950", vec![fail(2, "does not exist")]);
        fake.on("pct listsnapshot 920", vec![ok("")]);

        let (exec, _, engine) = reconciler(fake, dir.path());
        let err = engine.reconcile(950).await.unwrap_err();
        match err {
            PhoenixError::Resolve(ResolveError::SourceSnapshotMissing {
                ctid,
                source_ctid,
                snapshot,
            }) => {
                assert_eq!(ctid, 950);
                assert_eq!(source_ctid, 920);
                assert_eq!(snapshot, "vllm-snapshot");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(exec.calls_containing("pct clone"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_retry_budget_exhaustion_is_start_failed() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeExecutor::new();
        fake.on_ok("pct status 900", "status: stopped");
        fake.on_ok("pct config 900", base_template_config());

        let (exec, _, engine) = reconciler(fake, dir.path());
        let err = engine.reconcile(900).await.unwrap_err();
        // Template failure wraps the start failure.
        match err {
            PhoenixError::Template { ctid, source } => {
                assert_eq!(ctid, 900);
                assert!(matches!(
                    *source,
                    PhoenixError::StartFailed { ctid: 900, attempts: 3 }
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(exec.calls_containing("pct start 900"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn config_drift_is_patched_with_only_changed_fields() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeExecutor::new();
        fake.on_ok("pct status 900", "status: running");
        // Memory drifted; cores and net0 match.
        fake.on_ok(
            "pct config 900",
            "memory: 1024\ncores: 2\nnet0: name=eth0,bridge=vmbr0,ip=10.0.0.10/24,gw=10.0.0.1,type=veth\n",
        );
        fake.on_ok(
            "pct listsnapshot 900",
            "`-> base-snapshot 2025-06-01 10:00:00 finished\n",
        );

        let (exec, _, engine) = reconciler(fake, dir.path());
        engine.reconcile(900).await.unwrap();
        let sets: Vec<_> = exec
            .mutating_calls()
            .into_iter()
            .filter(|c| c.joined.contains("pct set 900"))
            .collect();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].joined, "pct set 900 --memory 2048");
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_traverses_end_to_end_for_absent_container() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeExecutor::dry_run();
        fake.on("pct status 900", vec![fail(2, "does not exist")]);

        let (exec, _, engine) = reconciler(fake, dir.path());
        let outcome = engine.reconcile(900).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Converged);

        // The full pipeline was logged: create, configure, start, feature
        // work, shutdown, snapshot, restart.
        assert_eq!(exec.calls_containing("pct create 900"), 1);
        assert_eq!(exec.calls_containing("pct snapshot 900 base-snapshot"), 1);
        assert!(exec.mutation_count() > 0);
    }

    #[test]
    fn net0_comparison_ignores_unmanaged_pairs_and_case() {
        assert!(net0_satisfies(
            "name=eth0,bridge=vmbr0,hwaddr=BC:24:11:52:9A:01,ip=10.0.0.50/24,gw=10.0.0.1,type=veth",
            "name=eth0,bridge=vmbr0,hwaddr=bc:24:11:52:9a:01,ip=10.0.0.50/24,gw=10.0.0.1"
        ));
        assert!(!net0_satisfies(
            "name=eth0,bridge=vmbr0,ip=10.0.0.51/24",
            "name=eth0,bridge=vmbr0,ip=10.0.0.50/24"
        ));
        assert!(!net0_satisfies("", "name=eth0,bridge=vmbr0,ip=dhcp"));
    }
}
