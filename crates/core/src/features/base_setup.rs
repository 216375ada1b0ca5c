//! Essential packages and locale for every container

use super::{argv, sh, Feature, FeatureContext};
use crate::errors::Result;
use crate::exec::ExecOpts;
use crate::retry::{default_classifier, retry_async, RetryConfig};
use std::time::Duration;
use tracing::debug;

/// Marker written after a successful run; checked alongside the package and
/// locale queries so a deleted marker forces re-verification, not a blind
/// reinstall.
pub const MARKER_PATH: &str = "/.phoenix_base_setup_complete";

/// Command-line utilities every container is expected to carry.
pub const ESSENTIAL_PACKAGES: &[&str] = &[
    "curl",
    "wget",
    "git",
    "jq",
    "htop",
    "vim",
    "locales",
    "gnupg",
    "ca-certificates",
];

const LOCALE: &str = "en_US.UTF-8";
const APT_TIMEOUT: Duration = Duration::from_secs(900);

pub struct BaseSetup;

impl BaseSetup {
    async fn missing_packages(&self, ctx: &FeatureContext<'_>) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for package in ESSENTIAL_PACKAGES {
            let out = ctx
                .adapter
                .exec(ctx.ctid, &argv(&["dpkg-query", "-W", package]), &ExecOpts::probe())
                .await?;
            if !out.success() {
                missing.push(package.to_string());
            }
        }
        Ok(missing)
    }

    async fn locale_present(&self, ctx: &FeatureContext<'_>) -> Result<bool> {
        let out = ctx
            .adapter
            .exec(
                ctx.ctid,
                &sh("locale -a | grep -iqx en_US.utf8"),
                &ExecOpts::probe(),
            )
            .await?;
        Ok(out.success())
    }
}

#[async_trait::async_trait]
impl Feature for BaseSetup {
    fn name(&self) -> &'static str {
        super::FEATURE_BASE_SETUP
    }

    async fn is_satisfied(&self, ctx: &FeatureContext<'_>) -> Result<bool> {
        let marker = ctx
            .adapter
            .exec(ctx.ctid, &argv(&["test", "-f", MARKER_PATH]), &ExecOpts::probe())
            .await?;
        if !marker.success() {
            return Ok(false);
        }
        if !self.missing_packages(ctx).await?.is_empty() {
            return Ok(false);
        }
        self.locale_present(ctx).await
    }

    async fn apply(&self, ctx: &FeatureContext<'_>) -> Result<()> {
        let missing = if ctx.assumed_fresh() {
            ESSENTIAL_PACKAGES.iter().map(|p| p.to_string()).collect()
        } else {
            self.missing_packages(ctx).await?
        };

        if missing.is_empty() {
            debug!(ctid = ctx.ctid, "all essential packages already installed");
        } else {
            retry_async(
                &RetryConfig::network(),
                |_attempt| async move {
                    ctx.adapter
                        .exec(
                            ctx.ctid,
                            &argv(&["apt-get", "update"]),
                            &ExecOpts::mutating().with_timeout(APT_TIMEOUT),
                        )
                        .await
                },
                default_classifier,
            )
            .await?;

            let mut install = argv(&["apt-get", "install", "-y"]);
            install.extend(missing.iter().cloned());
            let install = &install;
            retry_async(
                &RetryConfig::network(),
                |_attempt| async move {
                    ctx.adapter
                        .exec(
                            ctx.ctid,
                            install,
                            &ExecOpts::mutating()
                                .with_timeout(APT_TIMEOUT)
                                .with_env("DEBIAN_FRONTEND", "noninteractive"),
                        )
                        .await
                },
                default_classifier,
            )
            .await?;
        }

        let locale_ok = !ctx.assumed_fresh() && self.locale_present(ctx).await?;
        if !locale_ok {
            ctx.adapter
                .exec(
                    ctx.ctid,
                    &sh(format!(
                        "grep -qx '{LOCALE} UTF-8' /etc/locale.gen || \
                         sed -i 's/^# *{LOCALE} UTF-8/{LOCALE} UTF-8/' /etc/locale.gen"
                    )),
                    &ExecOpts::mutating(),
                )
                .await?;
            ctx.adapter
                .exec(ctx.ctid, &argv(&["locale-gen", LOCALE]), &ExecOpts::mutating())
                .await?;
            ctx.adapter
                .exec(
                    ctx.ctid,
                    &argv(&["update-locale", &format!("LANG={LOCALE}")]),
                    &ExecOpts::mutating(),
                )
                .await?;
        }

        let stamp = format!("provisioned {}\n", chrono::Utc::now().to_rfc3339());
        ctx.adapter
            .executor()
            .pipe_into(ctx.ctid, MARKER_PATH, stamp.as_bytes())
            .await?;
        Ok(())
    }
}
