//! GPU passthrough and driver installation
//!
//! Three stages: append the device passthrough declarations to the host-side
//! container config, bounce the container so the devices appear, then
//! install the driver (silent runfile, no kernel modules) and the CUDA
//! toolkit inside. The driver install is skipped when the running driver
//! already reports the declared version.

use super::{argv, Feature, FeatureContext};
use crate::errors::{PhoenixError, Result};
use crate::exec::ExecOpts;
use crate::pct::CtStatus;
use crate::probe::{LIFECYCLE_INTERVAL, LIFECYCLE_TIMEOUT, READINESS_INTERVAL};
use crate::retry::{default_classifier, retry_async, RetryConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Control devices passed through alongside the per-index GPU nodes.
const CONTROL_DEVICES: &[&str] = &[
    "/dev/nvidiactl",
    "/dev/nvidia-uvm",
    "/dev/nvidia-uvm-tools",
    "/dev/nvidia-modeset",
];

/// Character-device majors for nvidia, nvidia-caps and nvidia-uvm.
const DEVICE_MAJORS: &[u32] = &[195, 234, 510];

const RUNFILE_PATH: &str = "/tmp/nvidia-driver.run";
const KEYRING_PATH: &str = "/tmp/cuda-keyring.deb";
const INSTALL_TIMEOUT: Duration = Duration::from_secs(1800);

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9]+(?:\.[0-9]+)+)").expect("static regex"));

pub struct Nvidia;

/// Mount entry for a device node, bind-mounted at the same relative path.
fn mount_entry(device: &str) -> String {
    let relative = device.trim_start_matches('/');
    format!("lxc.mount.entry: {device} {relative} none bind,optional,create=file")
}

fn cgroup_allow(major: u32) -> String {
    format!("lxc.cgroup2.devices.allow: c {major}:* rwm")
}

impl Nvidia {
    /// Running driver version inside the container, if the query tool works.
    async fn driver_version(&self, ctx: &FeatureContext<'_>) -> Result<Option<String>> {
        let out = ctx
            .adapter
            .exec(
                ctx.ctid,
                &argv(&[
                    "nvidia-smi",
                    "--query-gpu=driver_version",
                    "--format=csv,noheader",
                ]),
                &ExecOpts::probe(),
            )
            .await?;
        if !out.success() {
            return Ok(None);
        }
        Ok(VERSION_RE
            .captures(&out.stdout)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string()))
    }

    /// Config lines for the assigned GPU indices plus control devices and
    /// cgroup allow rules. Index devices absent from the host are skipped.
    async fn passthrough_lines(&self, ctx: &FeatureContext<'_>) -> Result<Vec<String>> {
        let mut lines: Vec<String> = DEVICE_MAJORS.iter().map(|m| cgroup_allow(*m)).collect();

        for index in ctx.spec.gpu_assignment.indices() {
            let device = format!("/dev/nvidia{index}");
            let present = ctx
                .adapter
                .executor()
                .run_host(&argv(&["test", "-e", &device]), &ExecOpts::probe())
                .await?
                .success();
            if present {
                lines.push(mount_entry(&device));
            } else {
                warn!(
                    ctid = ctx.ctid,
                    device = %device,
                    "assigned GPU device not present on host, skipping mount entry"
                );
            }
        }
        for device in CONTROL_DEVICES {
            lines.push(mount_entry(device));
        }
        Ok(lines)
    }

    async fn bounce(&self, ctx: &FeatureContext<'_>) -> Result<()> {
        info!(ctid = ctx.ctid, "bouncing container for device visibility");
        ctx.adapter.stop(ctx.ctid).await?;
        let stopped = ctx
            .prober
            .wait_for_status(ctx.ctid, CtStatus::Stopped, LIFECYCLE_TIMEOUT, LIFECYCLE_INTERVAL)
            .await?;
        if !stopped.ok {
            return Err(PhoenixError::ProbeTimeout {
                ctid: ctx.ctid,
                what: "stopped state during bounce".to_string(),
                elapsed: stopped.elapsed,
                detail: stopped.last_error,
            });
        }
        ctx.adapter.start(ctx.ctid).await?;
        let running = ctx
            .prober
            .wait_for_status(ctx.ctid, CtStatus::Running, LIFECYCLE_TIMEOUT, LIFECYCLE_INTERVAL)
            .await?;
        if !running.ok {
            return Err(PhoenixError::ProbeTimeout {
                ctid: ctx.ctid,
                what: "running state after bounce".to_string(),
                elapsed: running.elapsed,
                detail: running.last_error,
            });
        }
        let ready = ctx
            .prober
            .wait_for_ready(
                ctx.ctid,
                &argv(&["uptime"]),
                |out| out.success(),
                LIFECYCLE_TIMEOUT,
                READINESS_INTERVAL,
            )
            .await?;
        if !ready.ok {
            return Err(PhoenixError::ProbeTimeout {
                ctid: ctx.ctid,
                what: "init readiness after bounce".to_string(),
                elapsed: ready.elapsed,
                detail: ready.last_error,
            });
        }
        Ok(())
    }

    async fn install_driver(&self, ctx: &FeatureContext<'_>) -> Result<()> {
        let runfile_url = ctx.manifest.nvidia().runfile_url.as_str();
        info!(ctid = ctx.ctid, url = %runfile_url, "installing NVIDIA driver");
        retry_async(
            &RetryConfig::network(),
            |_attempt| async move {
                ctx.adapter
                    .exec(
                        ctx.ctid,
                        &argv(&["curl", "-fsSL", runfile_url, "-o", RUNFILE_PATH]),
                        &ExecOpts::mutating().with_timeout(INSTALL_TIMEOUT),
                    )
                    .await
            },
            default_classifier,
        )
        .await?;
        ctx.adapter
            .exec(
                ctx.ctid,
                &argv(&["sh", RUNFILE_PATH, "--silent", "--no-kernel-module"]),
                &ExecOpts::mutating().with_timeout(INSTALL_TIMEOUT),
            )
            .await?;
        Ok(())
    }

    async fn install_cuda_toolkit(&self, ctx: &FeatureContext<'_>) -> Result<()> {
        let installed = !ctx.assumed_fresh()
            && ctx
                .adapter
                .exec(
                    ctx.ctid,
                    &argv(&["dpkg-query", "-W", "cuda-toolkit"]),
                    &ExecOpts::probe(),
                )
                .await?
                .success();
        if installed {
            debug!(ctid = ctx.ctid, "CUDA toolkit already installed");
            return Ok(());
        }

        let keyring_url = format!("{}/cuda-keyring_1.1-1_all.deb", ctx.manifest.nvidia().repo_url);
        let keyring_url = keyring_url.as_str();
        retry_async(
            &RetryConfig::network(),
            |_attempt| async move {
                ctx.adapter
                    .exec(
                        ctx.ctid,
                        &argv(&["curl", "-fsSL", keyring_url, "-o", KEYRING_PATH]),
                        &ExecOpts::mutating().with_timeout(INSTALL_TIMEOUT),
                    )
                    .await
            },
            default_classifier,
        )
        .await?;
        ctx.adapter
            .exec(
                ctx.ctid,
                &argv(&["dpkg", "-i", KEYRING_PATH]),
                &ExecOpts::mutating(),
            )
            .await?;
        retry_async(
            &RetryConfig::network(),
            |_attempt| async move {
                ctx.adapter
                    .exec(
                        ctx.ctid,
                        &argv(&["apt-get", "update"]),
                        &ExecOpts::mutating().with_timeout(INSTALL_TIMEOUT),
                    )
                    .await
            },
            default_classifier,
        )
        .await?;
        retry_async(
            &RetryConfig::network(),
            |_attempt| async move {
                ctx.adapter
                    .exec(
                        ctx.ctid,
                        &argv(&["apt-get", "install", "-y", "cuda-toolkit"]),
                        &ExecOpts::mutating()
                            .with_timeout(INSTALL_TIMEOUT)
                            .with_env("DEBIAN_FRONTEND", "noninteractive"),
                    )
                    .await
            },
            default_classifier,
        )
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Feature for Nvidia {
    fn name(&self) -> &'static str {
        super::FEATURE_NVIDIA
    }

    async fn is_satisfied(&self, ctx: &FeatureContext<'_>) -> Result<bool> {
        match self.driver_version(ctx).await? {
            Some(version) => Ok(version == ctx.manifest.nvidia().driver_version),
            None => Ok(false),
        }
    }

    async fn apply(&self, ctx: &FeatureContext<'_>) -> Result<()> {
        let mut appended_any = false;
        for line in self.passthrough_lines(ctx).await? {
            if ctx.adapter.append_unique_config_line(ctx.ctid, &line).await? {
                appended_any = true;
            }
        }
        if appended_any {
            self.bounce(ctx).await?;
        }

        let expected = &ctx.manifest.nvidia().driver_version;
        let running = self.driver_version(ctx).await?;
        match running {
            Some(version) if &version == expected => {
                debug!(ctid = ctx.ctid, version = %version, "driver already at declared version");
            }
            other => {
                if let Some(version) = other {
                    info!(
                        ctid = ctx.ctid,
                        running = %version,
                        expected = %expected,
                        "driver version mismatch, reinstalling"
                    );
                }
                self.install_driver(ctx).await?;
            }
        }

        self.install_cuda_toolkit(ctx).await?;

        // Verify through the query tool; a passthrough or install problem
        // surfaces here rather than at first workload start. In dry-run the
        // install was only logged, so there is nothing real to verify.
        if !ctx.adapter.executor().is_dry_run() {
            ctx.adapter
                .exec(ctx.ctid, &argv(&["nvidia-smi"]), &ExecOpts::query())
                .await?;
            let verified = self.driver_version(ctx).await?;
            if verified.as_deref() != Some(expected.as_str()) {
                return Err(PhoenixError::Unexpected {
                    message: format!(
                        "driver reports version {} after install, expected {expected}",
                        verified.unwrap_or_else(|| "none".to_string())
                    ),
                });
            }
        }
        Ok(())
    }
}
