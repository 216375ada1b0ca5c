//! Application scripts: workload finalization handlers
//!
//! An application script turns a configured container into a serving
//! instance. Handlers follow the same probe-then-act discipline as features
//! and are dispatched by name from `spec.application_script`. The built-in
//! `vllm_server` handler writes a supervised service unit for the inference
//! server, then probes liveness (the model-info endpoint reports the
//! expected model) and validation (a sample request returns a
//! plausibly-shaped response).

use crate::errors::{ConfigError, PhoenixError, Result};
use crate::exec::ExecOpts;
use crate::features::FeatureContext;
use crate::manifest::VllmParams;
use crate::probe::{READINESS_HEAVY_TIMEOUT, READINESS_INTERVAL};
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default budget for the model-info readiness probe.
pub const APP_READINESS_TIMEOUT: Duration = Duration::from_secs(120);

const UNIT_PATH: &str = "/etc/systemd/system/vllm.service";
const UNIT_NAME: &str = "vllm";

/// A named workload finalization handler.
#[async_trait::async_trait]
pub trait Application: Send + Sync {
    /// The name used in `spec.application_script`.
    fn name(&self) -> &'static str;

    /// Whether the workload is already serving as declared.
    async fn is_satisfied(&self, ctx: &FeatureContext<'_>) -> Result<bool>;

    /// Bring the workload up and verify it serves.
    async fn run(&self, ctx: &FeatureContext<'_>) -> Result<()>;
}

/// Maps application script names to handlers.
pub struct AppRegistry {
    handlers: IndexMap<&'static str, Arc<dyn Application>>,
}

impl AppRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self {
            handlers: IndexMap::new(),
        };
        registry.register(Arc::new(VllmServer));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn Application>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Application>> {
        self.handlers.get(name)
    }

    /// Dispatch the spec's application script, if any.
    pub async fn dispatch(&self, ctx: &FeatureContext<'_>) -> Result<()> {
        let Some(script) = &ctx.spec.application_script else {
            return Ok(());
        };
        let handler = self.get(script).ok_or_else(|| {
            PhoenixError::Config(ConfigError::Validation {
                message: format!("CTID {}: unknown application script '{script}'", ctx.ctid),
            })
        })?;

        let satisfied = if ctx.assumed_fresh() {
            false
        } else {
            handler
                .is_satisfied(ctx)
                .await
                .map_err(|e| wrap(ctx.ctid, script, e))?
        };
        if satisfied {
            info!(ctid = ctx.ctid, script = script.as_str(), "application already serving, skipping");
            return Ok(());
        }

        info!(ctid = ctx.ctid, script = script.as_str(), "running application script");
        handler.run(ctx).await.map_err(|e| wrap(ctx.ctid, script, e))
    }
}

fn wrap(ctid: u32, script: &str, source: PhoenixError) -> PhoenixError {
    PhoenixError::Application {
        ctid,
        script: script.to_string(),
        source: Box::new(source),
    }
}

/// Launches the inference server as a systemd service and verifies it.
pub struct VllmServer;

impl VllmServer {
    fn params<'a>(ctx: &'a FeatureContext<'_>) -> Result<&'a VllmParams> {
        ctx.spec.vllm.as_ref().ok_or_else(|| {
            PhoenixError::Config(ConfigError::FieldMissing {
                ctid: ctx.ctid,
                field: "vllm",
            })
        })
    }

    fn models_url(params: &VllmParams) -> String {
        format!("http://127.0.0.1:{}/v1/models", params.port)
    }

    /// Render the service unit for the declared workload parameters.
    fn unit_file(ctx: &FeatureContext<'_>, params: &VllmParams) -> String {
        let venv = format!("{}/.venv", ctx.manifest.global().vllm.install_root);
        let mut exec_start = format!(
            "{venv}/bin/vllm serve {} --host 0.0.0.0 --port {} \
             --tensor-parallel-size {} --gpu-memory-utilization {}",
            params.model, params.port, params.tensor_parallel_size, params.gpu_memory_utilization
        );
        if let Some(max_len) = params.max_model_len {
            exec_start.push_str(&format!(" --max-model-len {max_len}"));
        }
        format!(
            "[Unit]\n\
             Description=vLLM OpenAI-compatible inference server\n\
             After=network-online.target\n\
             Wants=network-online.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart={exec_start}\n\
             Restart=always\n\
             RestartSec=5\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n"
        )
    }

    fn readiness_budget(params: &VllmParams) -> Duration {
        match params.readiness_timeout_secs {
            Some(secs) => Duration::from_secs(secs).min(READINESS_HEAVY_TIMEOUT),
            None => APP_READINESS_TIMEOUT,
        }
    }

    /// Recent service logs, attached to readiness-timeout errors.
    async fn journal_tail(&self, ctx: &FeatureContext<'_>) -> Option<String> {
        let out = ctx
            .adapter
            .exec(
                ctx.ctid,
                &crate::features::argv(&[
                    "journalctl",
                    "-u",
                    UNIT_NAME,
                    "--no-pager",
                    "-n",
                    "40",
                ]),
                &ExecOpts::probe(),
            )
            .await
            .ok()?;
        if out.success() && !out.stdout.trim().is_empty() {
            Some(out.stdout.trim().to_string())
        } else {
            None
        }
    }

    async fn model_served(&self, ctx: &FeatureContext<'_>, params: &VllmParams) -> Result<bool> {
        let out = ctx
            .adapter
            .exec(
                ctx.ctid,
                &crate::features::argv(&["curl", "-s", &Self::models_url(params)]),
                &ExecOpts::probe(),
            )
            .await?;
        Ok(out.success() && out.stdout.contains(&params.model))
    }
}

#[async_trait::async_trait]
impl Application for VllmServer {
    fn name(&self) -> &'static str {
        "vllm_server"
    }

    async fn is_satisfied(&self, ctx: &FeatureContext<'_>) -> Result<bool> {
        let params = Self::params(ctx)?;
        let active = ctx
            .adapter
            .exec(
                ctx.ctid,
                &crate::features::argv(&["systemctl", "is-active", "--quiet", UNIT_NAME]),
                &ExecOpts::probe(),
            )
            .await?
            .success();
        if !active {
            return Ok(false);
        }
        self.model_served(ctx, params).await
    }

    async fn run(&self, ctx: &FeatureContext<'_>) -> Result<()> {
        let params = Self::params(ctx)?;

        let unit = Self::unit_file(ctx, params);
        ctx.adapter
            .executor()
            .pipe_into(ctx.ctid, UNIT_PATH, unit.as_bytes())
            .await?;
        ctx.adapter
            .exec(
                ctx.ctid,
                &crate::features::argv(&["systemctl", "daemon-reload"]),
                &ExecOpts::mutating(),
            )
            .await?;
        ctx.adapter
            .exec(
                ctx.ctid,
                &crate::features::argv(&["systemctl", "enable", UNIT_NAME]),
                &ExecOpts::mutating(),
            )
            .await?;
        ctx.adapter
            .exec(
                ctx.ctid,
                &crate::features::argv(&["systemctl", "restart", UNIT_NAME]),
                &ExecOpts::mutating(),
            )
            .await?;

        if ctx.adapter.executor().is_dry_run() {
            // The restart was only logged; its post-condition is assumed.
            debug!(ctid = ctx.ctid, "dry-run: skipping serving verification");
            return Ok(());
        }

        // Liveness: the model-info endpoint must report the declared model.
        let url = Self::models_url(params);
        let budget = Self::readiness_budget(params);
        let model = params.model.clone();
        let outcome = ctx
            .prober
            .wait_for_ready(
                ctx.ctid,
                &crate::features::argv(&["curl", "-s", &url]),
                |out| out.success() && out.stdout.contains(&model),
                budget,
                READINESS_INTERVAL,
            )
            .await?;
        if !outcome.ok {
            let detail = self.journal_tail(ctx).await;
            return Err(PhoenixError::ProbeTimeout {
                ctid: ctx.ctid,
                what: url,
                elapsed: outcome.elapsed,
                detail,
            });
        }

        // Validation: a sample completion must come back plausibly shaped.
        let body = serde_json::json!({
            "model": params.model,
            "prompt": "Hello",
            "max_tokens": 8,
        })
        .to_string();
        let completion_url = format!("http://127.0.0.1:{}/v1/completions", params.port);
        let out = ctx
            .adapter
            .exec(
                ctx.ctid,
                &crate::features::argv(&[
                    "curl",
                    "-s",
                    "-X",
                    "POST",
                    "-H",
                    "Content-Type: application/json",
                    "-d",
                    &body,
                    &completion_url,
                ]),
                &ExecOpts::query().with_timeout(Duration::from_secs(120)),
            )
            .await?;
        if !out.stdout.contains("\"choices\"") {
            return Err(PhoenixError::Unexpected {
                message: format!(
                    "sample completion from {completion_url} is not plausibly shaped: {}",
                    out.stdout_trimmed()
                ),
            });
        }
        info!(ctid = ctx.ctid, model = %params.model, "inference server validated");
        Ok(())
    }
}
