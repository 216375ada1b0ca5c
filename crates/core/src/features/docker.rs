//! Container runtime, GPU container toolkit, and fleet dashboard
//!
//! Installs the runtime from its package repository, configures the
//! GPU-aware runtime as default when the container has GPUs assigned
//! (verified by running the query tool in a minimal GPU-visible container),
//! adds the default user to the runtime group, and optionally deploys the
//! fleet-management dashboard as server or agent.

use super::{argv, sh, Feature, FeatureContext};
use crate::errors::{PhoenixError, Result};
use crate::exec::ExecOpts;
use crate::manifest::PortainerRole;
use crate::probe::{READINESS_INTERVAL, READINESS_TIMEOUT};
use crate::retry::{default_classifier, retry_async, RetryConfig};
use std::time::Duration;
use tracing::{debug, info};

const APT_TIMEOUT: Duration = Duration::from_secs(900);

/// HTTP statuses that mean the dashboard is up (login redirects and auth
/// walls included).
const READY_HTTP_STATUSES: &[&str] = &["200", "204", "302", "401", "403"];

const SERVER_CONTAINER: &str = "portainer";
const AGENT_CONTAINER: &str = "portainer_agent";

pub struct Docker;

impl Docker {
    async fn engine_installed(&self, ctx: &FeatureContext<'_>) -> Result<bool> {
        Ok(ctx
            .adapter
            .exec(ctx.ctid, &argv(&["docker", "--version"]), &ExecOpts::probe())
            .await?
            .success())
    }

    async fn service_active(&self, ctx: &FeatureContext<'_>) -> Result<bool> {
        Ok(ctx
            .adapter
            .exec(
                ctx.ctid,
                &argv(&["systemctl", "is-active", "--quiet", "docker"]),
                &ExecOpts::probe(),
            )
            .await?
            .success())
    }

    /// Whether the runtime reports a GPU-aware runtime entry.
    async fn nvidia_runtime_configured(&self, ctx: &FeatureContext<'_>) -> Result<bool> {
        let out = ctx
            .adapter
            .exec(
                ctx.ctid,
                &argv(&["docker", "info", "--format", "{{json .Runtimes}}"]),
                &ExecOpts::probe(),
            )
            .await?;
        if !out.success() {
            return Ok(false);
        }
        match serde_json::from_str::<serde_json::Value>(out.stdout_trimmed()) {
            Ok(runtimes) => Ok(runtimes
                .as_object()
                .is_some_and(|obj| obj.contains_key("nvidia"))),
            Err(_) => Ok(false),
        }
    }

    async fn dashboard_container_running(
        &self,
        ctx: &FeatureContext<'_>,
        name: &str,
    ) -> Result<bool> {
        let out = ctx
            .adapter
            .exec(
                ctx.ctid,
                &argv(&[
                    "docker",
                    "ps",
                    "--filter",
                    &format!("name=^{name}$"),
                    "--format",
                    "{{.Names}}",
                ]),
                &ExecOpts::probe(),
            )
            .await?;
        Ok(out.success() && out.stdout_trimmed() == name)
    }

    async fn install_engine(&self, ctx: &FeatureContext<'_>) -> Result<()> {
        info!(ctid = ctx.ctid, "installing container runtime");
        retry_async(
            &RetryConfig::network(),
            |_attempt| async move {
                ctx.adapter
                    .exec(
                        ctx.ctid,
                        &sh("install -m 0755 -d /etc/apt/keyrings && \
                             curl -fsSL https://download.docker.com/linux/ubuntu/gpg \
                               -o /etc/apt/keyrings/docker.asc && \
                             chmod a+r /etc/apt/keyrings/docker.asc"),
                        &ExecOpts::mutating().with_timeout(APT_TIMEOUT),
                    )
                    .await
            },
            default_classifier,
        )
        .await?;
        ctx.adapter
            .exec(
                ctx.ctid,
                &sh("echo \"deb [arch=$(dpkg --print-architecture) \
                     signed-by=/etc/apt/keyrings/docker.asc] \
                     https://download.docker.com/linux/ubuntu \
                     $(. /etc/os-release && echo $VERSION_CODENAME) stable\" \
                     > /etc/apt/sources.list.d/docker.list"),
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
                        &ExecOpts::mutating().with_timeout(APT_TIMEOUT),
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
                        &argv(&[
                            "apt-get",
                            "install",
                            "-y",
                            "docker-ce",
                            "docker-ce-cli",
                            "containerd.io",
                            "docker-buildx-plugin",
                            "docker-compose-plugin",
                        ]),
                        &ExecOpts::mutating()
                            .with_timeout(APT_TIMEOUT)
                            .with_env("DEBIAN_FRONTEND", "noninteractive"),
                    )
                    .await
            },
            default_classifier,
        )
        .await?;
        Ok(())
    }

    async fn configure_gpu_runtime(&self, ctx: &FeatureContext<'_>) -> Result<()> {
        info!(ctid = ctx.ctid, "configuring GPU container toolkit");
        let toolkit_installed = !ctx.assumed_fresh()
            && ctx
                .adapter
                .exec(
                    ctx.ctid,
                    &argv(&["dpkg-query", "-W", "nvidia-container-toolkit"]),
                    &ExecOpts::probe(),
                )
                .await?
                .success();
        if !toolkit_installed {
            retry_async(
                &RetryConfig::network(),
                |_attempt| async move {
                    ctx.adapter
                        .exec(
                            ctx.ctid,
                            &sh("curl -fsSL https://nvidia.github.io/libnvidia-container/gpgkey | \
                                 gpg --dearmor --yes \
                                   -o /usr/share/keyrings/nvidia-container-toolkit-keyring.gpg && \
                                 curl -fsSL https://nvidia.github.io/libnvidia-container/stable/deb/nvidia-container-toolkit.list | \
                                 sed 's#deb https://#deb [signed-by=/usr/share/keyrings/nvidia-container-toolkit-keyring.gpg] https://#g' \
                                   > /etc/apt/sources.list.d/nvidia-container-toolkit.list"),
                            &ExecOpts::mutating().with_timeout(APT_TIMEOUT),
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
                            &argv(&["apt-get", "update"]),
                            &ExecOpts::mutating().with_timeout(APT_TIMEOUT),
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
                            &argv(&["apt-get", "install", "-y", "nvidia-container-toolkit"]),
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

        ctx.adapter
            .exec(
                ctx.ctid,
                &argv(&[
                    "nvidia-ctk",
                    "runtime",
                    "configure",
                    "--runtime=docker",
                    "--set-as-default",
                ]),
                &ExecOpts::mutating(),
            )
            .await?;
        ctx.adapter
            .exec(
                ctx.ctid,
                &argv(&["systemctl", "restart", "docker"]),
                &ExecOpts::mutating(),
            )
            .await?;

        // A GPU-visible container must be able to run the query tool.
        let image = &ctx.manifest.global().docker.gpu_test_image;
        ctx.adapter
            .exec(
                ctx.ctid,
                &argv(&["docker", "run", "--rm", "--gpus", "all", image, "nvidia-smi"]),
                &ExecOpts::mutating().with_timeout(Duration::from_secs(600)),
            )
            .await?;
        Ok(())
    }

    async fn ensure_group_membership(&self, ctx: &FeatureContext<'_>) -> Result<()> {
        let user = &ctx.manifest.global().docker.user;
        let in_group = !ctx.assumed_fresh()
            && ctx
                .adapter
                .exec(
                    ctx.ctid,
                    &sh(format!("id -nG {user} | grep -qw docker")),
                    &ExecOpts::probe(),
                )
                .await?
                .success();
        if in_group {
            return Ok(());
        }
        let user_exists = ctx.assumed_fresh()
            || ctx
                .adapter
                .exec(ctx.ctid, &argv(&["id", "-u", user]), &ExecOpts::probe())
                .await?
                .success();
        if !user_exists {
            ctx.adapter
                .exec(
                    ctx.ctid,
                    &argv(&["useradd", "-m", "-s", "/bin/bash", user]),
                    &ExecOpts::mutating(),
                )
                .await?;
        }
        ctx.adapter
            .exec(
                ctx.ctid,
                &argv(&["usermod", "-aG", "docker", user]),
                &ExecOpts::mutating(),
            )
            .await?;
        Ok(())
    }

    async fn wait_for_dashboard(&self, ctx: &FeatureContext<'_>, url: &str) -> Result<()> {
        if ctx.adapter.executor().is_dry_run() {
            // The deployment was only logged; its post-condition is assumed.
            debug!(ctid = ctx.ctid, url, "dry-run: skipping dashboard readiness probe");
            return Ok(());
        }
        let probe = argv(&[
            "curl",
            "-ks",
            "-o",
            "/dev/null",
            "-w",
            "%{http_code}",
            url,
        ]);
        let outcome = ctx
            .prober
            .wait_for_ready(
                ctx.ctid,
                &probe,
                |out| {
                    out.success() && READY_HTTP_STATUSES.contains(&out.stdout_trimmed())
                },
                READINESS_TIMEOUT,
                READINESS_INTERVAL,
            )
            .await?;
        if !outcome.ok {
            return Err(PhoenixError::ProbeTimeout {
                ctid: ctx.ctid,
                what: url.to_string(),
                elapsed: outcome.elapsed,
                detail: outcome.last_error,
            });
        }
        Ok(())
    }

    async fn deploy_dashboard(&self, ctx: &FeatureContext<'_>) -> Result<()> {
        let portainer = &ctx.manifest.global().docker.portainer;
        match ctx.spec.portainer_role {
            PortainerRole::None => Ok(()),
            PortainerRole::Server => {
                let running = !ctx.assumed_fresh()
                    && self.dashboard_container_running(ctx, SERVER_CONTAINER).await?;
                if !running {
                    info!(ctid = ctx.ctid, "deploying dashboard server");
                    ctx.adapter
                        .exec(
                            ctx.ctid,
                            &argv(&[
                                "docker",
                                "run",
                                "-d",
                                "--name",
                                SERVER_CONTAINER,
                                "--restart=always",
                                "-p",
                                &format!("{0}:{0}", portainer.ui_port),
                                "-p",
                                "8000:8000",
                                "-v",
                                "/var/run/docker.sock:/var/run/docker.sock",
                                "-v",
                                "portainer_data:/data",
                                &portainer.server_image,
                            ]),
                            &ExecOpts::mutating().with_timeout(Duration::from_secs(600)),
                        )
                        .await?;
                }
                self.wait_for_dashboard(
                    ctx,
                    &format!("https://127.0.0.1:{}", portainer.ui_port),
                )
                .await
            }
            PortainerRole::Agent => {
                let running = !ctx.assumed_fresh()
                    && self.dashboard_container_running(ctx, AGENT_CONTAINER).await?;
                if !running {
                    info!(ctid = ctx.ctid, "deploying dashboard agent");
                    let mut run = argv(&[
                        "docker",
                        "run",
                        "-d",
                        "--name",
                        AGENT_CONTAINER,
                        "--restart=always",
                        "-p",
                        &format!("{0}:9001", portainer.agent_port),
                        "-v",
                        "/var/run/docker.sock:/var/run/docker.sock",
                        "-v",
                        "/var/lib/docker/volumes:/var/lib/docker/volumes",
                    ]);
                    if let Some(secret) = &portainer.agent_secret {
                        run.push("-e".to_string());
                        run.push(format!("AGENT_SECRET={secret}"));
                    }
                    if let Some(server) = &portainer.server_host {
                        run.push("-e".to_string());
                        run.push(format!("AGENT_CLUSTER_ADDR={server}"));
                    }
                    run.push(portainer.agent_image.clone());
                    ctx.adapter
                        .exec(
                            ctx.ctid,
                            &run,
                            &ExecOpts::mutating().with_timeout(Duration::from_secs(600)),
                        )
                        .await?;
                }
                self.wait_for_dashboard(
                    ctx,
                    &format!("https://127.0.0.1:{}/ping", portainer.agent_port),
                )
                .await
            }
        }
    }
}

#[async_trait::async_trait]
impl Feature for Docker {
    fn name(&self) -> &'static str {
        super::FEATURE_DOCKER
    }

    async fn is_satisfied(&self, ctx: &FeatureContext<'_>) -> Result<bool> {
        if !self.engine_installed(ctx).await? || !self.service_active(ctx).await? {
            return Ok(false);
        }
        if ctx.spec.needs_gpu() && !self.nvidia_runtime_configured(ctx).await? {
            return Ok(false);
        }
        match ctx.spec.portainer_role {
            PortainerRole::None => Ok(true),
            PortainerRole::Server => self.dashboard_container_running(ctx, SERVER_CONTAINER).await,
            PortainerRole::Agent => self.dashboard_container_running(ctx, AGENT_CONTAINER).await,
        }
    }

    async fn apply(&self, ctx: &FeatureContext<'_>) -> Result<()> {
        let installed = !ctx.assumed_fresh() && self.engine_installed(ctx).await?;
        if installed {
            debug!(ctid = ctx.ctid, "runtime already installed");
        } else {
            self.install_engine(ctx).await?;
        }

        let active = !ctx.assumed_fresh() && self.service_active(ctx).await?;
        if !active {
            ctx.adapter
                .exec(
                    ctx.ctid,
                    &argv(&["systemctl", "enable", "--now", "docker"]),
                    &ExecOpts::mutating(),
                )
                .await?;
        }

        if ctx.spec.needs_gpu() {
            let configured =
                !ctx.assumed_fresh() && self.nvidia_runtime_configured(ctx).await?;
            if configured {
                debug!(ctid = ctx.ctid, "GPU runtime already configured");
            } else {
                self.configure_gpu_runtime(ctx).await?;
            }
        }

        self.ensure_group_membership(ctx).await?;
        self.deploy_dashboard(ctx).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandExecutor;
    use crate::pct::PctAdapter;
    use crate::probe::{Prober, ShutdownSignal};
    use crate::test_support::{fail, ok, sample_manifest, FakeExecutor};
    use std::sync::Arc;

    fn harness(fake: FakeExecutor) -> (Arc<FakeExecutor>, Arc<PctAdapter>, Prober) {
        let exec = Arc::new(fake);
        let adapter = Arc::new(PctAdapter::new(exec.clone() as Arc<dyn CommandExecutor>));
        let prober = Prober::new(adapter.clone(), ShutdownSignal::inert());
        (exec, adapter, prober)
    }

    #[tokio::test]
    async fn satisfied_when_engine_service_gpu_and_agent_present() {
        let fake = FakeExecutor::new();
        fake.on_ok("docker --version", "Docker version 27.3.1");
        fake.on_ok("docker info --format", r#"{"nvidia":{"path":"nvidia-container-runtime"}}"#);
        fake.on_ok("docker ps --filter name=^portainer_agent$", "portainer_agent");
        let (exec, adapter, prober) = harness(fake);
        let manifest = sample_manifest();
        let ctx = crate::features::FeatureContext {
            ctid: 950,
            spec: manifest.get(950).unwrap(),
            manifest: &manifest,
            adapter: &adapter,
            prober: &prober,
        };
        assert!(Docker.is_satisfied(&ctx).await.unwrap());
        assert!(exec.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn unsatisfied_without_gpu_runtime_when_gpu_assigned() {
        let fake = FakeExecutor::new();
        fake.on_ok("docker --version", "Docker version 27.3.1");
        fake.on_ok("docker info --format", r#"{"io.containerd.runc.v2":{}}"#);
        let (_, adapter, prober) = harness(fake);
        let manifest = sample_manifest();
        let ctx = crate::features::FeatureContext {
            ctid: 903,
            spec: manifest.get(903).unwrap(),
            manifest: &manifest,
            adapter: &adapter,
            prober: &prober,
        };
        assert!(!Docker.is_satisfied(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn gpu_configuration_runs_verification_container() {
        let fake = FakeExecutor::new();
        fake.on_ok("docker --version", "Docker version 27.3.1");
        // Runtime list lacks nvidia until nvidia-ctk configures it.
        fake.on(
            "docker info --format",
            vec![
                ok(r#"{"io.containerd.runc.v2":{}}"#),
                ok(r#"{"nvidia":{"path":"nvidia-container-runtime"}}"#),
            ],
        );
        // Toolkit already installed; group membership fine; no dashboard.
        let (exec, adapter, prober) = harness(fake);
        let manifest = sample_manifest();
        let ctx = crate::features::FeatureContext {
            ctid: 903,
            spec: manifest.get(903).unwrap(),
            manifest: &manifest,
            adapter: &adapter,
            prober: &prober,
        };
        Docker.apply(&ctx).await.unwrap();

        assert_eq!(
            exec.calls_containing("nvidia-ctk runtime configure --runtime=docker --set-as-default"),
            1
        );
        assert_eq!(
            exec.calls_containing(
                "docker run --rm --gpus all nvidia/cuda:12.8.0-base-ubuntu24.04 nvidia-smi"
            ),
            1
        );
        assert_eq!(exec.calls_containing("systemctl restart docker"), 1);
        // Engine was present, so no package installs.
        assert_eq!(exec.calls_containing("apt-get install -y docker-ce"), 0);
    }

    #[tokio::test]
    async fn agent_deploy_passes_coordinates_and_waits_for_ping() {
        let fake = FakeExecutor::new();
        fake.on_ok("docker --version", "Docker version 27.3.1");
        fake.on_ok("docker info --format", r#"{"nvidia":{}}"#);
        fake.on("docker ps --filter name=^portainer_agent$", vec![ok("")]);
        fake.on_ok("curl -ks -o /dev/null -w %{http_code}", "200");
        let (exec, adapter, prober) = harness(fake);
        let manifest = sample_manifest();
        let ctx = crate::features::FeatureContext {
            ctid: 950,
            spec: manifest.get(950).unwrap(),
            manifest: &manifest,
            adapter: &adapter,
            prober: &prober,
        };
        Docker.apply(&ctx).await.unwrap();

        let deploys: Vec<_> = exec
            .mutating_calls()
            .into_iter()
            .filter(|c| c.joined.contains("docker run -d --name portainer_agent"))
            .collect();
        assert_eq!(deploys.len(), 1);
        assert!(deploys[0].joined.contains("AGENT_SECRET=portainer-agent-secret"));
        assert!(deploys[0].joined.contains("AGENT_CLUSTER_ADDR=10.0.0.40"));
        assert!(deploys[0].joined.contains("portainer/agent:2.21.4"));
        assert_eq!(exec.calls_containing("https://127.0.0.1:9001/ping"), 1);
    }

    #[tokio::test]
    async fn dashboard_timeout_is_a_probe_timeout() {
        let fake = FakeExecutor::new();
        fake.on_ok("docker --version", "Docker version 27.3.1");
        fake.on_ok("docker info --format", r#"{"nvidia":{}}"#);
        fake.on("docker ps --filter name=^portainer_agent$", vec![ok("")]);
        fake.on("curl -ks -o /dev/null -w %{http_code}", vec![fail(7, "")]);
        let (_, _adapter, prober) = harness(fake);

        // Shrink the budget by probing directly.
        let outcome = prober
            .wait_for_ready(
                950,
                &argv(&["curl", "-ks", "-o", "/dev/null", "-w", "%{http_code}", "https://127.0.0.1:9001/ping"]),
                |out| out.success() && READY_HTTP_STATUSES.contains(&out.stdout_trimmed()),
                Duration::from_millis(30),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        assert!(!outcome.ok);
    }
}
