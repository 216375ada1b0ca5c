//! Lifecycle and readiness probing
//!
//! Two probe kinds: polling `pct status` until a container reaches a target
//! lifecycle state, and repeatedly running an in-container command until a
//! predicate on its output holds. Probes never mutate state and never decide
//! significance; they report `(ok, elapsed, last_error)` and the caller
//! classifies. Sleeps between polls are interrupted by the cooperative
//! shutdown signal.

use crate::errors::Result;
use crate::exec::{CommandOutput, ExecOpts};
use crate::pct::{CtStatus, PctAdapter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Default budget for a lifecycle transition.
pub const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval for lifecycle transitions.
pub const LIFECYCLE_INTERVAL: Duration = Duration::from_secs(3);

/// Default budget for basic in-container readiness.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(180);

/// Upper budget for heavy-model readiness.
pub const READINESS_HEAVY_TIMEOUT: Duration = Duration::from_secs(600);

/// Poll interval for readiness probes.
pub const READINESS_INTERVAL: Duration = Duration::from_secs(5);

/// Sender half of the cooperative shutdown channel.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiver half of the cooperative shutdown channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Create a connected handle/signal pair.
    pub fn new() -> (ShutdownHandle, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownHandle { tx }, ShutdownSignal { rx })
    }

    /// A signal that never triggers, for contexts with no signal handling.
    pub fn inert() -> ShutdownSignal {
        static CHANNEL: once_cell::sync::Lazy<(watch::Sender<bool>, watch::Receiver<bool>)> =
            once_cell::sync::Lazy::new(|| watch::channel(false));
        ShutdownSignal {
            rx: CHANNEL.1.clone(),
        }
    }

    /// Whether shutdown has been requested.
    pub fn triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when shutdown is requested. Never resolves if the handle was
    /// dropped without triggering.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Result of a probe. `ok == false` means the budget elapsed (or the run was
/// interrupted) before the condition held.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub ok: bool,
    pub elapsed: Duration,
    pub last_error: Option<String>,
}

impl ProbeOutcome {
    fn success(elapsed: Duration) -> Self {
        Self {
            ok: true,
            elapsed,
            last_error: None,
        }
    }

    fn failure(elapsed: Duration, last_error: Option<String>) -> Self {
        Self {
            ok: false,
            elapsed,
            last_error,
        }
    }
}

/// Poll-based observer of container lifecycle and in-container readiness.
#[derive(Debug, Clone)]
pub struct Prober {
    adapter: Arc<PctAdapter>,
    shutdown: ShutdownSignal,
}

impl Prober {
    pub fn new(adapter: Arc<PctAdapter>, shutdown: ShutdownSignal) -> Self {
        Self { adapter, shutdown }
    }

    /// Poll `pct status` until it reports `target` or `timeout` elapses.
    pub async fn wait_for_status(
        &self,
        ctid: u32,
        target: CtStatus,
        timeout: Duration,
        interval: Duration,
    ) -> Result<ProbeOutcome> {
        let start = Instant::now();
        let mut shutdown = self.shutdown.clone();
        let mut last_error = None;

        loop {
            match self.adapter.status(ctid).await {
                Ok(status) if status == target => {
                    debug!(ctid, %target, elapsed = ?start.elapsed(), "lifecycle probe satisfied");
                    return Ok(ProbeOutcome::success(start.elapsed()));
                }
                Ok(status) => {
                    last_error = Some(format!("status is {status}, waiting for {target}"));
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                }
            }

            if start.elapsed() >= timeout {
                return Ok(ProbeOutcome::failure(start.elapsed(), last_error));
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => {
                    return Ok(ProbeOutcome::failure(
                        start.elapsed(),
                        Some("interrupted".to_string()),
                    ));
                }
            }
        }
    }

    /// Repeatedly run `argv` inside the container until `predicate` accepts
    /// its output or `timeout` elapses.
    pub async fn wait_for_ready<F>(
        &self,
        ctid: u32,
        argv: &[String],
        predicate: F,
        timeout: Duration,
        interval: Duration,
    ) -> Result<ProbeOutcome>
    where
        F: Fn(&CommandOutput) -> bool,
    {
        let start = Instant::now();
        let mut shutdown = self.shutdown.clone();
        let mut last_error = None;
        let opts = ExecOpts::probe();

        loop {
            match self.adapter.exec(ctid, argv, &opts).await {
                Ok(output) if predicate(&output) => {
                    debug!(ctid, elapsed = ?start.elapsed(), "readiness probe satisfied");
                    return Ok(ProbeOutcome::success(start.elapsed()));
                }
                Ok(output) => {
                    last_error = Some(format!(
                        "exit code {}: {}",
                        output.exit_code,
                        output.stdout_trimmed()
                    ));
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                }
            }

            if start.elapsed() >= timeout {
                return Ok(ProbeOutcome::failure(start.elapsed(), last_error));
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => {
                    return Ok(ProbeOutcome::failure(
                        start.elapsed(),
                        Some("interrupted".to_string()),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandExecutor;
    use crate::test_support::{fail, ok, FakeExecutor};

    fn prober_with(fake: FakeExecutor) -> (Arc<FakeExecutor>, Prober, ShutdownHandle) {
        let exec = Arc::new(fake);
        let adapter = Arc::new(PctAdapter::new(exec.clone() as Arc<dyn CommandExecutor>));
        let (handle, signal) = ShutdownSignal::new();
        (exec, Prober::new(adapter, signal), handle)
    }

    #[tokio::test]
    async fn lifecycle_probe_waits_for_target() {
        let fake = FakeExecutor::new();
        fake.on(
            "pct status 900",
            vec![
                ok("status: stopped"),
                ok("status: stopped"),
                ok("status: running"),
            ],
        );
        let (_, prober, _handle) = prober_with(fake);

        let outcome = prober
            .wait_for_status(
                900,
                CtStatus::Running,
                Duration::from_secs(1),
                Duration::from_millis(5),
            )
            .await
            .unwrap();
        assert!(outcome.ok);
        assert!(outcome.last_error.is_none());
    }

    #[tokio::test]
    async fn lifecycle_probe_times_out_with_last_error() {
        let fake = FakeExecutor::new();
        fake.on_ok("pct status 900", "status: stopped");
        let (_, prober, _handle) = prober_with(fake);

        let outcome = prober
            .wait_for_status(
                900,
                CtStatus::Running,
                Duration::from_millis(30),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        assert!(!outcome.ok);
        assert!(outcome.elapsed >= Duration::from_millis(30));
        assert!(outcome.last_error.unwrap().contains("stopped"));
    }

    #[tokio::test]
    async fn readiness_probe_uses_predicate_on_output() {
        let fake = FakeExecutor::new();
        fake.on(
            "curl -s http://127.0.0.1:8000/v1/models",
            vec![fail(7, "connection refused"), ok(r#"{"data":[{"id":"m"}]}"#)],
        );
        let (_, prober, _handle) = prober_with(fake);

        let argv: Vec<String> = ["curl", "-s", "http://127.0.0.1:8000/v1/models"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let outcome = prober
            .wait_for_ready(
                950,
                &argv,
                |out| out.success() && out.stdout.contains("\"id\""),
                Duration::from_secs(1),
                Duration::from_millis(5),
            )
            .await
            .unwrap();
        assert!(outcome.ok);
    }

    #[tokio::test]
    async fn probes_never_mutate() {
        let fake = FakeExecutor::new();
        fake.on_ok("pct status 900", "status: running");
        let (exec, prober, _handle) = prober_with(fake);

        prober
            .wait_for_status(
                900,
                CtStatus::Running,
                Duration::from_millis(50),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        let argv = vec!["uptime".to_string()];
        prober
            .wait_for_ready(
                900,
                &argv,
                CommandOutput::success,
                Duration::from_millis(50),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        assert!(exec.mutating_calls().is_empty());
        assert_eq!(exec.mutation_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_interrupts_sleep_between_polls() {
        let fake = FakeExecutor::new();
        fake.on_ok("pct status 900", "status: stopped");
        let (_, prober, handle) = prober_with(fake);

        handle.trigger();
        let start = Instant::now();
        let outcome = prober
            .wait_for_status(
                900,
                CtStatus::Running,
                Duration::from_secs(60),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.last_error.as_deref(), Some("interrupted"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
