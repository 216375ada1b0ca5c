//! Clone-source resolution
//!
//! When a spec names `clone_from_ctid` explicitly, that wins. Otherwise the
//! source template is selected by a deterministic priority cascade over the
//! spec's capabilities, parameterized by the template CTIDs the manifest
//! declares in `clone_hierarchy`. Either way the chosen source must declare
//! a `template_snapshot_name`; whether that snapshot actually exists on the
//! host is checked at clone time by the engine.

use crate::errors::{ConfigError, PhoenixError, ResolveError, Result};
use crate::manifest::{ContainerSpec, Manifest};
use tracing::debug;

/// A resolved `(source CTID, snapshot name)` pair to clone from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneSource {
    pub ctid: u32,
    pub snapshot: String,
}

/// Resolve the clone source for `ctid`.
pub fn resolve_clone_source(
    manifest: &Manifest,
    ctid: u32,
    spec: &ContainerSpec,
) -> Result<CloneSource> {
    let source_ctid = match spec.clone_from_ctid {
        Some(explicit) => explicit,
        None => select_by_capabilities(manifest, ctid, spec)?,
    };

    let source_spec = manifest.get(source_ctid)?;
    let snapshot = source_spec.template_snapshot_name.clone().ok_or_else(|| {
        PhoenixError::Config(ConfigError::FieldMissing {
            ctid: source_ctid,
            field: "template_snapshot_name",
        })
    })?;

    debug!(ctid, source_ctid, snapshot = %snapshot, "clone source resolved");
    Ok(CloneSource {
        ctid: source_ctid,
        snapshot,
    })
}

/// The capability cascade: most specific template first.
fn select_by_capabilities(manifest: &Manifest, ctid: u32, spec: &ContainerSpec) -> Result<u32> {
    let hierarchy = manifest.clone_hierarchy();
    let needs_docker = spec.needs_docker();
    let needs_gpu = spec.needs_gpu();
    let needs_vllm = spec.needs_vllm();

    let selected = match (needs_docker, needs_gpu, needs_vllm) {
        (true, true, true) => hierarchy.docker_gpu_vllm,
        (true, true, false) => hierarchy.docker_gpu,
        (true, false, _) => hierarchy.docker,
        (false, true, _) => hierarchy.gpu,
        (false, false, _) => hierarchy.base,
    };

    selected.ok_or_else(|| {
        PhoenixError::Resolve(ResolveError::NoSuitableSource {
            ctid,
            needs_docker,
            needs_gpu,
            needs_vllm,
        })
    })
}
