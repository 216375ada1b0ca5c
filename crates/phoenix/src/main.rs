use clap::Parser;
use phoenix_core::applications::AppRegistry;
use phoenix_core::errors::{CommandError, PhoenixError};
use phoenix_core::exec::{CommandExecutor, ExecOpts, HostExecutor};
use phoenix_core::features::FeatureRegistry;
use phoenix_core::fleet::FleetDriver;
use phoenix_core::manifest::Manifest;
use phoenix_core::pct::PctAdapter;
use phoenix_core::probe::{ShutdownHandle, ShutdownSignal};
use phoenix_core::reconcile::{ReconcileOutcome, Reconciler};
use phoenix_core::redaction::SecretRegistry;
use std::sync::Arc;
use tracing::{error, info, warn};

mod cli;
mod logging;

fn main() {
    if let Err(e) = logging::init() {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    // Clap reports usage errors itself with exit code 2.
    let parsed = cli::Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(parsed));
    std::process::exit(code);
}

async fn run(cli: cli::Cli) -> i32 {
    let manifest = match Manifest::load(&cli.global_config_path(), &cli.lxc_config_path()) {
        Ok(manifest) => Arc::new(manifest),
        Err(e) => {
            error!(error = %e, "failed to load manifest");
            return e.exit_code();
        }
    };

    // Validate the requested target before touching the host at all.
    if let Some(ctid) = cli.ctid {
        if let Err(e) = manifest.get(ctid) {
            error!(error = %e, "invalid target");
            return e.exit_code();
        }
    }

    let redactor = SecretRegistry::new();
    if let Some(secret) = &manifest.global().docker.portainer.agent_secret {
        redactor.add_secret(secret);
    }

    let dry_run = cli.dry_run_enabled();
    if dry_run {
        info!("dry-run mode: mutating commands are logged, not executed");
    }
    let executor: Arc<dyn CommandExecutor> = Arc::new(HostExecutor::new(dry_run, redactor));

    if let Err(e) = preflight(&executor).await {
        error!(error = %e, "host prerequisite check failed");
        return e.exit_code();
    }

    let adapter = Arc::new(PctAdapter::new(executor));
    let (handle, signal) = ShutdownSignal::new();
    install_signal_handlers(handle);

    let reconciler = Arc::new(Reconciler::new(
        manifest.clone(),
        adapter,
        Arc::new(FeatureRegistry::builtin()),
        Arc::new(AppRegistry::builtin()),
        signal.clone(),
    ));

    if cli.all {
        let driver = FleetDriver::new(manifest, reconciler, signal);
        let summary = if cli.parallel {
            driver.run_all_parallel().await
        } else {
            driver.run_all().await
        };
        println!("{}", summary.render());
        summary.exit_code()
    } else {
        // Presence was validated above; `ctid` is set in this branch.
        let Some(ctid) = cli.ctid else { return 2 };
        match reconciler.reconcile(ctid).await {
            Ok(outcome) => {
                let verdict = match outcome {
                    ReconcileOutcome::Converged => "reconciled",
                    ReconcileOutcome::AlreadySatisfied => "already satisfied",
                };
                println!("CTID {ctid}: {verdict}");
                0
            }
            Err(e) => {
                error!(ctid, error = %e, "reconciliation failed");
                e.exit_code()
            }
        }
    }
}

/// The container CLI must be invocable before any reconciliation starts.
async fn preflight(executor: &Arc<dyn CommandExecutor>) -> Result<(), PhoenixError> {
    let argv = vec!["which".to_string(), "pct".to_string()];
    match executor.run_host(&argv, &ExecOpts::probe()).await {
        Ok(out) if out.success() => Ok(()),
        Ok(_) => Err(PhoenixError::Prerequisite {
            tool: "pct".to_string(),
        }),
        Err(PhoenixError::Command(CommandError::NotFound { .. })) => {
            Err(PhoenixError::Prerequisite {
                tool: "pct".to_string(),
            })
        }
        Err(other) => Err(other),
    }
}

/// SIGINT/SIGTERM stop new operations; in-flight commands finish or time
/// out, then the summary is emitted and the process exits non-zero.
fn install_signal_handlers(handle: ShutdownHandle) {
    tokio::spawn(async move {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate => {}
        }
        warn!("shutdown requested, finishing in-flight operations");
        handle.trigger();
    });
}
