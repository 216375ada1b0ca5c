//! Fleet driver: every CTID in dependency order
//!
//! CTIDs are processed in ascending numeric order, a convention the manifest
//! must respect (templates sort before their dependents), so a later
//! dependent always observes its template fully finalized. A template
//! failure aborts the whole run; a workload failure is recorded and the run
//! continues. An opt-in parallel mode reconciles non-template CTIDs
//! concurrently once every template is finalized.

use crate::errors::PhoenixError;
use crate::manifest::Manifest;
use crate::probe::ShutdownSignal;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// One failed CTID, with the exit code its error maps to.
#[derive(Debug, Clone)]
pub struct CtidFailure {
    pub ctid: u32,
    pub message: String,
    pub exit_code: i32,
}

impl CtidFailure {
    fn from_error(ctid: u32, error: &PhoenixError) -> Self {
        Self {
            ctid,
            message: error.to_string(),
            exit_code: error.exit_code(),
        }
    }
}

/// Outcome of a fleet run.
#[derive(Debug, Clone, Default)]
pub struct FleetSummary {
    pub total: usize,
    pub succeeded: Vec<u32>,
    pub already_satisfied: Vec<u32>,
    pub failed: Vec<CtidFailure>,
    pub fatal_template: Option<CtidFailure>,
    /// Per-CTID wall-clock time for the CTIDs that were attempted
    pub timings: Vec<(u32, Duration)>,
    /// Whether the run stopped early on SIGINT/SIGTERM
    pub interrupted: bool,
}

impl FleetSummary {
    fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    fn record(&mut self, ctid: u32, result: &Result<ReconcileOutcome, PhoenixError>) {
        match result {
            Ok(ReconcileOutcome::Converged) => self.succeeded.push(ctid),
            Ok(ReconcileOutcome::AlreadySatisfied) => self.already_satisfied.push(ctid),
            Err(error) => self.failed.push(CtidFailure::from_error(ctid, error)),
        }
    }

    /// Process exit code for the whole run.
    pub fn exit_code(&self) -> i32 {
        if let Some(fatal) = &self.fatal_template {
            return fatal.exit_code.max(5);
        }
        if let Some(first) = self.failed.first() {
            return first.exit_code;
        }
        if self.interrupted {
            return 1;
        }
        0
    }

    /// The final summary line.
    pub fn render(&self) -> String {
        let ids = |v: &[u32]| {
            v.iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        let mut line = format!(
            "summary: total={} succeeded=[{}] already-satisfied=[{}] failed=[{}]",
            self.total,
            ids(&self.succeeded),
            ids(&self.already_satisfied),
            self.failed
                .iter()
                .map(|f| f.ctid.to_string())
                .collect::<Vec<_>>()
                .join(","),
        );
        if let Some(fatal) = &self.fatal_template {
            line.push_str(&format!(" fatal-template={}", fatal.ctid));
        }
        if self.interrupted {
            line.push_str(" interrupted=true");
        }
        line
    }
}

/// Iterates the manifest and applies the fatal-vs-continue policy.
pub struct FleetDriver {
    manifest: Arc<Manifest>,
    reconciler: Arc<Reconciler>,
    shutdown: ShutdownSignal,
}

impl FleetDriver {
    pub fn new(
        manifest: Arc<Manifest>,
        reconciler: Arc<Reconciler>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            manifest,
            reconciler,
            shutdown,
        }
    }

    fn is_template(&self, ctid: u32) -> bool {
        self.manifest
            .get(ctid)
            .map(|spec| spec.is_template)
            .unwrap_or(false)
    }

    /// Reconcile every CTID sequentially, ascending.
    pub async fn run_all(&self) -> FleetSummary {
        let ctids = self.manifest.all_ctids();
        let mut summary = FleetSummary::new(ctids.len());

        for ctid in ctids {
            if self.shutdown.triggered() {
                warn!(ctid, "interrupted, not starting further reconciliations");
                summary.interrupted = true;
                break;
            }
            let started = Instant::now();
            let result = self.reconciler.reconcile(ctid).await;
            let elapsed = started.elapsed();
            info!(ctid, ?elapsed, "reconciliation finished");
            summary.timings.push((ctid, elapsed));

            match &result {
                Err(error) if self.is_template(ctid) => {
                    error!(ctid, %error, "template failure is fatal, aborting fleet run");
                    summary.fatal_template = Some(CtidFailure::from_error(ctid, error));
                    break;
                }
                Err(error) => {
                    error!(ctid, %error, "reconciliation failed, continuing with next CTID");
                    summary.record(ctid, &result);
                }
                Ok(_) => summary.record(ctid, &result),
            }
        }
        info!("{}", summary.render());
        summary
    }

    /// Templates sequentially, then non-template CTIDs on a bounded worker
    /// pool. Each CTID is still reconciled by exactly one worker.
    pub async fn run_all_parallel(&self) -> FleetSummary {
        let ctids = self.manifest.all_ctids();
        let mut summary = FleetSummary::new(ctids.len());
        let (templates, leaves): (Vec<u32>, Vec<u32>) =
            ctids.into_iter().partition(|&c| self.is_template(c));

        for ctid in templates {
            if self.shutdown.triggered() {
                summary.interrupted = true;
                info!("{}", summary.render());
                return summary;
            }
            let started = Instant::now();
            let result = self.reconciler.reconcile(ctid).await;
            summary.timings.push((ctid, started.elapsed()));
            match &result {
                Err(error) => {
                    error!(ctid, %error, "template reconciliation failed, aborting fleet run");
                    summary.fatal_template = Some(CtidFailure::from_error(ctid, error));
                    info!("{}", summary.render());
                    return summary;
                }
                Ok(_) => summary.record(ctid, &result),
            }
        }

        let permits = (num_cpus::get() / 2).max(1);
        info!(permits, "reconciling workloads in parallel");
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut handles = Vec::new();
        for ctid in leaves {
            if self.shutdown.triggered() {
                summary.interrupted = true;
                break;
            }
            let semaphore = semaphore.clone();
            let reconciler = self.reconciler.clone();
            handles.push((
                ctid,
                tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return (Err(PhoenixError::Interrupted { ctid }), Duration::ZERO)
                        }
                    };
                    let started = Instant::now();
                    let result = reconciler.reconcile(ctid).await;
                    (result, started.elapsed())
                }),
            ));
        }

        for (ctid, handle) in handles {
            match handle.await {
                Ok((result, elapsed)) => {
                    summary.timings.push((ctid, elapsed));
                    if let Err(error) = &result {
                        error!(ctid, %error, "reconciliation failed");
                    }
                    summary.record(ctid, &result);
                }
                Err(join_error) => {
                    summary.failed.push(CtidFailure {
                        ctid,
                        message: format!("worker panicked: {join_error}"),
                        exit_code: 1,
                    });
                }
            }
        }
        info!("{}", summary.render());
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applications::AppRegistry;
    use crate::exec::CommandExecutor;
    use crate::features::FeatureRegistry;
    use crate::pct::PctAdapter;
    use crate::test_support::{fail, ok, sample_manifest, FakeExecutor};

    fn driver(
        fake: FakeExecutor,
        config_dir: &std::path::Path,
    ) -> (Arc<FakeExecutor>, FleetDriver) {
        let exec = Arc::new(fake);
        let adapter = Arc::new(PctAdapter::with_config_dir(
            exec.clone() as Arc<dyn CommandExecutor>,
            config_dir.to_path_buf(),
        ));
        let manifest = Arc::new(sample_manifest());
        let reconciler = Arc::new(Reconciler::new(
            manifest.clone(),
            adapter,
            Arc::new(FeatureRegistry::builtin()),
            Arc::new(AppRegistry::builtin()),
            ShutdownSignal::inert(),
        ));
        (
            exec.clone(),
            FleetDriver::new(manifest, reconciler, ShutdownSignal::inert()),
        )
    }

    /// Script every CTID in the sample manifest as fully satisfied.
    fn script_all_satisfied(fake: &FakeExecutor) {
        fake.on_ok("pct status", "status: running");
        fake.on_ok(
            "pct config 900",
            "memory: 2048\ncores: 2\nnet0: name=eth0,bridge=vmbr0,ip=10.0.0.10/24,gw=10.0.0.1\n",
        );
        fake.on_ok(
            "pct config 901",
            "memory: 4096\ncores: 4\nnet0: name=eth0,bridge=vmbr0,ip=10.0.0.11/24,gw=10.0.0.1\n",
        );
        fake.on_ok(
            "pct config 902",
            "memory: 4096\ncores: 4\nnet0: name=eth0,bridge=vmbr0,ip=10.0.0.12/24,gw=10.0.0.1\n",
        );
        fake.on_ok(
            "pct config 903",
            "memory: 8192\ncores: 8\nnet0: name=eth0,bridge=vmbr0,ip=10.0.0.13/24,gw=10.0.0.1\n",
        );
        fake.on_ok(
            "pct config 920",
            "memory: 32768\ncores: 8\nnet0: name=eth0,bridge=vmbr0,ip=10.0.0.14/24,gw=10.0.0.1\n",
        );
        fake.on_ok(
            "pct config 950",
            "memory: 65536\ncores: 12\nnet0: name=eth0,bridge=vmbr0,hwaddr=BC:24:11:52:9A:01,ip=10.0.0.50/24,gw=10.0.0.1\n",
        );
        fake.on_ok("pct listsnapshot 900", "`-> base-snapshot 2025-06-01\n");
        fake.on_ok("pct listsnapshot 901", "`-> gpu-snapshot 2025-06-01\n");
        fake.on_ok("pct listsnapshot 902", "`-> docker-snapshot 2025-06-01\n");
        fake.on_ok("pct listsnapshot 903", "`-> docker-gpu-snapshot 2025-06-01\n");
        fake.on_ok("pct listsnapshot 920", "`-> vllm-snapshot 2025-06-01\n");
        fake.on_ok("nvidia-smi --query-gpu=driver_version", "580.65.06");
        fake.on_ok("docker --version", "Docker version 27.3.1");
        fake.on_ok("docker info --format", r#"{"nvidia":{}}"#);
        fake.on_ok("docker ps --filter name=^portainer_agent$", "portainer_agent");
        fake.on_ok("pip show vllm", "Editable project location: /opt/vllm");
        fake.on_ok(
            "curl -s http://127.0.0.1:8000/v1/models",
            r#"{"data":[{"id":"Qwen/Qwen2.5-7B-Instruct"}]}"#,
        );
    }

    #[tokio::test(start_paused = true)]
    async fn satisfied_fleet_reports_and_mutates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeExecutor::new();
        script_all_satisfied(&fake);
        let (exec, driver) = driver(fake, dir.path());

        let summary = driver.run_all().await;
        assert_eq!(summary.total, 6);
        assert_eq!(
            summary.already_satisfied,
            vec![900, 901, 902, 903, 920, 950]
        );
        assert!(summary.succeeded.is_empty());
        assert!(summary.failed.is_empty());
        assert!(summary.fatal_template.is_none());
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(exec.mutation_count(), 0);
        assert_eq!(summary.timings.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn template_failure_aborts_fleet_before_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeExecutor::new();
        script_all_satisfied(&fake);
        // 900's base_setup is incomplete and the package install keeps
        // failing, which is fatal for the whole run.
        fake.on("test -f /.phoenix_base_setup_complete", vec![fail(1, "")]);
        fake.on("dpkg-query -W curl", vec![fail(1, "not installed")]);
        fake.on("apt-get update", vec![fail(100, "network unreachable")]);
        let (exec, driver) = driver(fake, dir.path());

        let summary = driver.run_all().await;
        let fatal = summary.fatal_template.as_ref().expect("template failure expected");
        assert_eq!(fatal.ctid, 900);
        assert_eq!(summary.exit_code(), 5);
        // Later CTIDs were never touched.
        assert_eq!(exec.calls_containing("pct status 901"), 0);
        assert_eq!(exec.calls_containing("pct status 950"), 0);
        // The failed template is not double-counted as a plain failure.
        assert!(summary.failed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn workload_failure_continues_with_next_ctid() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeExecutor::new();
        script_all_satisfied(&fake);
        // 950's inference server is down and will not come back.
        fake.on("systemctl is-active --quiet vllm", vec![fail(3, "")]);
        fake.on("curl -s http://127.0.0.1:8000/v1/models", vec![fail(7, "")]);
        fake.on("systemctl restart vllm", vec![ok("")]);
        let (_, driver) = driver(fake, dir.path());

        let summary = driver.run_all().await;
        assert!(summary.fatal_template.is_none());
        assert_eq!(
            summary.already_satisfied,
            vec![900, 901, 902, 903, 920]
        );
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].ctid, 950);
        // Application failures map to the feature-handler exit code.
        assert_eq!(summary.exit_code(), 4);
        assert!(summary.render().contains("failed=[950]"));
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_mode_matches_sequential_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeExecutor::new();
        script_all_satisfied(&fake);
        let (exec, driver) = driver(fake, dir.path());

        let summary = driver.run_all_parallel().await;
        assert_eq!(summary.total, 6);
        let mut satisfied = summary.already_satisfied.clone();
        satisfied.sort_unstable();
        assert_eq!(satisfied, vec![900, 901, 902, 903, 920, 950]);
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(exec.mutation_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_run_stops_launching_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeExecutor::new();
        script_all_satisfied(&fake);
        let exec = Arc::new(fake);
        let adapter = Arc::new(PctAdapter::with_config_dir(
            exec.clone() as Arc<dyn CommandExecutor>,
            dir.path().to_path_buf(),
        ));
        let manifest = Arc::new(sample_manifest());
        let (handle, signal) = ShutdownSignal::new();
        let reconciler = Arc::new(Reconciler::new(
            manifest.clone(),
            adapter,
            Arc::new(FeatureRegistry::builtin()),
            Arc::new(AppRegistry::builtin()),
            signal.clone(),
        ));
        let driver = FleetDriver::new(manifest, reconciler, signal);

        handle.trigger();
        let summary = driver.run_all().await;
        assert!(summary.interrupted);
        assert!(summary.succeeded.is_empty() && summary.already_satisfied.is_empty());
        assert_eq!(exec.calls().len(), 0);
        assert_ne!(summary.exit_code(), 0);
    }

    #[test]
    fn render_includes_fatal_template() {
        let mut summary = FleetSummary::new(2);
        summary.already_satisfied.push(901);
        summary.fatal_template = Some(CtidFailure {
            ctid: 900,
            message: "boom".to_string(),
            exit_code: 5,
        });
        let line = summary.render();
        assert!(line.contains("total=2"));
        assert!(line.contains("already-satisfied=[901]"));
        assert!(line.contains("fatal-template=900"));
        assert_eq!(summary.exit_code(), 5);
    }
}
