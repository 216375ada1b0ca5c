//! Inference engine installed from source into an isolated environment
//!
//! The engine is cloned under a fixed in-container root and editable-
//! installed into a venv there, after confirming the GPUs are actually
//! visible inside the container. Skipped entirely when the editable install
//! already points at the expected checkout.

use super::{argv, sh, Feature, FeatureContext};
use crate::errors::Result;
use crate::exec::ExecOpts;
use crate::retry::{default_classifier, retry_async, RetryConfig};
use std::time::Duration;
use tracing::{debug, info};

const CLONE_TIMEOUT: Duration = Duration::from_secs(1800);
const PIP_TIMEOUT: Duration = Duration::from_secs(3600);

pub struct Vllm;

impl Vllm {
    fn venv(root: &str) -> String {
        format!("{root}/.venv")
    }

    /// Whether the engine is editable-installed from the expected checkout.
    async fn editable_install_present(&self, ctx: &FeatureContext<'_>) -> Result<bool> {
        let root = &ctx.manifest.global().vllm.install_root;
        let venv = Self::venv(root);
        let out = ctx
            .adapter
            .exec(
                ctx.ctid,
                &sh(format!("{venv}/bin/pip show vllm | grep -i editable")),
                &ExecOpts::probe(),
            )
            .await?;
        Ok(out.success() && out.stdout.contains(root.as_str()))
    }
}

#[async_trait::async_trait]
impl Feature for Vllm {
    fn name(&self) -> &'static str {
        super::FEATURE_VLLM
    }

    async fn is_satisfied(&self, ctx: &FeatureContext<'_>) -> Result<bool> {
        self.editable_install_present(ctx).await
    }

    async fn apply(&self, ctx: &FeatureContext<'_>) -> Result<()> {
        let settings = &ctx.manifest.global().vllm;
        let root = settings.install_root.as_str();
        let repo_url = settings.repo_url.as_str();
        let venv = Self::venv(root);

        // GPUs must be visible before a source build is worth attempting.
        // In dry-run the driver install was only logged, so the visibility
        // check is assumed along with it.
        if !ctx.adapter.executor().is_dry_run() {
            ctx.adapter
                .exec(ctx.ctid, &argv(&["nvidia-smi"]), &ExecOpts::query())
                .await?;
        }

        let tooling_present = !ctx.assumed_fresh()
            && ctx
                .adapter
                .exec(
                    ctx.ctid,
                    &argv(&["dpkg-query", "-W", "python3-venv", "git"]),
                    &ExecOpts::probe(),
                )
                .await?
                .success();
        if !tooling_present {
            retry_async(
                &RetryConfig::network(),
                |_attempt| async move {
                    ctx.adapter
                        .exec(
                            ctx.ctid,
                            &argv(&["apt-get", "install", "-y", "python3-venv", "python3-pip", "git"]),
                            &ExecOpts::mutating()
                                .with_timeout(Duration::from_secs(900))
                                .with_env("DEBIAN_FRONTEND", "noninteractive"),
                        )
                        .await
                },
                default_classifier,
            )
            .await?;
        }

        let checkout_present = !ctx.assumed_fresh()
            && ctx
                .adapter
                .exec(
                    ctx.ctid,
                    &argv(&["test", "-d", &format!("{root}/.git")]),
                    &ExecOpts::probe(),
                )
                .await?
                .success();
        if checkout_present {
            debug!(ctid = ctx.ctid, root, "engine checkout already present");
        } else {
            info!(ctid = ctx.ctid, repo = repo_url, root, "cloning engine source");
            retry_async(
                &RetryConfig::network(),
                |_attempt| async move {
                    ctx.adapter
                        .exec(
                            ctx.ctid,
                            &argv(&["git", "clone", repo_url, root]),
                            &ExecOpts::mutating().with_timeout(CLONE_TIMEOUT),
                        )
                        .await
                },
                default_classifier,
            )
            .await?;
        }

        let venv_present = !ctx.assumed_fresh()
            && ctx
                .adapter
                .exec(
                    ctx.ctid,
                    &argv(&["test", "-x", &format!("{venv}/bin/python")]),
                    &ExecOpts::probe(),
                )
                .await?
                .success();
        if !venv_present {
            ctx.adapter
                .exec(
                    ctx.ctid,
                    &argv(&["python3", "-m", "venv", &venv]),
                    &ExecOpts::mutating(),
                )
                .await?;
        }

        let installed = !ctx.assumed_fresh() && self.editable_install_present(ctx).await?;
        if installed {
            debug!(ctid = ctx.ctid, "editable install already present");
            return Ok(());
        }

        ctx.adapter
            .exec(
                ctx.ctid,
                &argv(&[&format!("{venv}/bin/pip"), "install", "--upgrade", "pip"]),
                &ExecOpts::mutating().with_timeout(Duration::from_secs(600)),
            )
            .await?;
        info!(ctid = ctx.ctid, "building engine from source, this can take a while");
        ctx.adapter
            .exec(
                ctx.ctid,
                &argv(&[&format!("{venv}/bin/pip"), "install", "-e", root]),
                &ExecOpts::mutating().with_timeout(PIP_TIMEOUT),
            )
            .await?;
        Ok(())
    }
}
