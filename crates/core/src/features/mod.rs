//! Feature registry and dispatch
//!
//! A feature is a named, idempotent unit of in-container configuration.
//! Features are applied in the exact order declared in the spec; ordering is
//! the only dependency mechanism. Every handler starts with an idempotency
//! probe and returns without side effects when the probe shows the feature
//! is already satisfied. Handlers mutate container state only through the
//! host adapter and the command executor.

mod base_setup;
mod docker;
mod nvidia;
mod vllm;

pub use base_setup::BaseSetup;
pub use docker::Docker;
pub use nvidia::Nvidia;
pub use vllm::Vllm;

use crate::errors::{ConfigError, PhoenixError, Result};
use crate::manifest::{ContainerSpec, Manifest};
use crate::pct::PctAdapter;
use crate::probe::Prober;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, info};

pub const FEATURE_BASE_SETUP: &str = "base_setup";
pub const FEATURE_NVIDIA: &str = "nvidia";
pub const FEATURE_DOCKER: &str = "docker";
pub const FEATURE_VLLM: &str = "vllm";

/// Everything a handler may touch while customizing one container.
pub struct FeatureContext<'a> {
    pub ctid: u32,
    pub spec: &'a ContainerSpec,
    pub manifest: &'a Manifest,
    pub adapter: &'a PctAdapter,
    pub prober: &'a Prober,
}

impl FeatureContext<'_> {
    /// Whether this container only exists as a dry-run assumption, in which
    /// case in-container probes cannot observe anything real.
    pub fn assumed_fresh(&self) -> bool {
        self.adapter.executor().is_dry_run_container(self.ctid)
    }
}

/// Build an argv from string literals.
pub(crate) fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// A single in-container shell invocation for explicit pipelines and
/// redirections.
pub(crate) fn sh(script: impl Into<String>) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.into()]
}

/// A named, idempotent unit of in-container configuration.
#[async_trait::async_trait]
pub trait Feature: Send + Sync {
    /// The tag used in `spec.features`.
    fn name(&self) -> &'static str;

    /// Idempotency probe: whether the feature is already satisfied. Must not
    /// mutate anything.
    async fn is_satisfied(&self, ctx: &FeatureContext<'_>) -> Result<bool>;

    /// Drive the container to the feature's goal state. Re-runnable; the
    /// handler owns any container restarts it needs.
    async fn apply(&self, ctx: &FeatureContext<'_>) -> Result<()>;
}

/// Maps declared feature names to handlers, preserving registration order.
pub struct FeatureRegistry {
    handlers: IndexMap<&'static str, Arc<dyn Feature>>,
}

impl FeatureRegistry {
    /// Registry with the built-in handlers.
    pub fn builtin() -> Self {
        let mut registry = Self {
            handlers: IndexMap::new(),
        };
        registry.register(Arc::new(BaseSetup));
        registry.register(Arc::new(Nvidia));
        registry.register(Arc::new(Docker));
        registry.register(Arc::new(Vllm));
        registry
    }

    /// Empty registry, for composing a custom handler set.
    pub fn empty() -> Self {
        Self {
            handlers: IndexMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn Feature>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Feature>> {
        self.handlers.get(name)
    }

    /// Apply every feature declared in the spec, in declared order.
    ///
    /// A handler failure aborts the container's reconciliation with an error
    /// naming the feature. For a container that only exists as a dry-run
    /// assumption the idempotency probe is skipped: the expected
    /// post-condition of the logged creation is "nothing applied yet".
    pub async fn dispatch(&self, ctx: &FeatureContext<'_>) -> Result<()> {
        for name in &ctx.spec.features {
            let handler = self.get(name).ok_or_else(|| {
                PhoenixError::Config(ConfigError::Validation {
                    message: format!("CTID {}: unknown feature '{name}'", ctx.ctid),
                })
            })?;

            let satisfied = if ctx.assumed_fresh() {
                false
            } else {
                handler
                    .is_satisfied(ctx)
                    .await
                    .map_err(|e| wrap(ctx.ctid, name, e))?
            };
            if satisfied {
                info!(ctid = ctx.ctid, feature = name.as_str(), "feature already satisfied, skipping");
                continue;
            }

            info!(ctid = ctx.ctid, feature = name.as_str(), "applying feature");
            handler
                .apply(ctx)
                .await
                .map_err(|e| wrap(ctx.ctid, name, e))?;
            debug!(ctid = ctx.ctid, feature = name.as_str(), "feature applied");
        }
        Ok(())
    }
}

fn wrap(ctid: u32, feature: &str, source: PhoenixError) -> PhoenixError {
    PhoenixError::Feature {
        ctid,
        feature: feature.to_string(),
        source: Box::new(source),
    }
}
