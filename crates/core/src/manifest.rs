//! Manifest loading and typed access
//!
//! The orchestrator is driven by two JSON files at well-known paths: the
//! global settings file and the LXC configs file. Both are read once at
//! startup into a [`Manifest`] that is immutable for the rest of the run.
//! Schema validation happens upstream; this module still refuses manifests
//! that violate the structural invariants it depends on (unique CTIDs,
//! template ordering, capability implications).

use crate::errors::{ConfigError, PhoenixError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Default path of the global settings file.
pub const DEFAULT_GLOBAL_CONFIG_PATH: &str = "/usr/local/etc/phoenix_hypervisor_config.json";

/// Default path of the LXC configs file.
pub const DEFAULT_LXC_CONFIG_PATH: &str = "/usr/local/etc/phoenix_lxc_configs.json";

fn default_bridge() -> String {
    "vmbr0".to_string()
}

fn default_iface() -> String {
    "eth0".to_string()
}

fn default_docker_user() -> String {
    "phoenix".to_string()
}

fn default_gpu_test_image() -> String {
    "nvidia/cuda:12.8.0-base-ubuntu24.04".to_string()
}

fn default_portainer_server_image() -> String {
    "portainer/portainer-ce:2.21.4".to_string()
}

fn default_portainer_agent_image() -> String {
    "portainer/agent:2.21.4".to_string()
}

fn default_portainer_ui_port() -> u16 {
    9443
}

fn default_portainer_agent_port() -> u16 {
    9001
}

fn default_vllm_repo_url() -> String {
    "https://github.com/vllm-project/vllm.git".to_string()
}

fn default_vllm_install_root() -> String {
    "/opt/vllm".to_string()
}

fn default_unprivileged() -> bool {
    true
}

/// Host-wide defaults from the global settings file.
///
/// Every field is optional in the JSON; the documented defaults apply when
/// absent.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GlobalSettings {
    /// Network defaults applied when a container spec leaves them out
    #[serde(default)]
    pub network: NetworkDefaults,
    /// Container-runtime settings (default user, Portainer coordinates)
    #[serde(default)]
    pub docker: DockerSettings,
    /// Inference-engine install settings
    #[serde(default)]
    pub vllm: VllmSettings,
}

/// Default network parameters. Zero values: bridge `vmbr0`, no gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkDefaults {
    #[serde(default = "default_bridge")]
    pub bridge: String,
    #[serde(default)]
    pub gateway: Option<String>,
}

impl Default for NetworkDefaults {
    fn default() -> Self {
        Self {
            bridge: default_bridge(),
            gateway: None,
        }
    }
}

/// Container-runtime settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerSettings {
    /// User added to the runtime group inside containers. Zero value: `phoenix`.
    #[serde(default = "default_docker_user")]
    pub user: String,
    /// Image used to verify GPU visibility through the runtime
    #[serde(default = "default_gpu_test_image")]
    pub gpu_test_image: String,
    /// Fleet-dashboard coordinates and image tags
    #[serde(default)]
    pub portainer: PortainerSettings,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            user: default_docker_user(),
            gpu_test_image: default_gpu_test_image(),
            portainer: PortainerSettings::default(),
        }
    }
}

/// Fleet-dashboard deployment settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PortainerSettings {
    #[serde(default = "default_portainer_server_image")]
    pub server_image: String,
    #[serde(default = "default_portainer_agent_image")]
    pub agent_image: String,
    /// HTTPS UI port bound by the server role. Zero value: 9443.
    #[serde(default = "default_portainer_ui_port")]
    pub ui_port: u16,
    /// Port bound by the agent role. Zero value: 9001.
    #[serde(default = "default_portainer_agent_port")]
    pub agent_port: u16,
    /// Address agents use to reach the server. Zero value: none (agents
    /// listen and wait to be registered).
    #[serde(default)]
    pub server_host: Option<String>,
    /// Shared agent secret; redacted from all logs when present
    #[serde(default)]
    pub agent_secret: Option<String>,
}

impl Default for PortainerSettings {
    fn default() -> Self {
        Self {
            server_image: default_portainer_server_image(),
            agent_image: default_portainer_agent_image(),
            ui_port: default_portainer_ui_port(),
            agent_port: default_portainer_agent_port(),
            server_host: None,
            agent_secret: None,
        }
    }
}

/// Inference-engine install settings.
#[derive(Debug, Clone, Deserialize)]
pub struct VllmSettings {
    #[serde(default = "default_vllm_repo_url")]
    pub repo_url: String,
    /// Fixed in-container checkout and venv root. Zero value: `/opt/vllm`.
    #[serde(default = "default_vllm_install_root")]
    pub install_root: String,
}

impl Default for VllmSettings {
    fn default() -> Self {
        Self {
            repo_url: default_vllm_repo_url(),
            install_root: default_vllm_install_root(),
        }
    }
}

/// NVIDIA driver coordinates, required at the top of the LXC configs file.
#[derive(Debug, Clone, Deserialize)]
pub struct NvidiaSettings {
    #[serde(rename = "nvidia_driver_version")]
    pub driver_version: String,
    #[serde(rename = "nvidia_repo_url")]
    pub repo_url: String,
    #[serde(rename = "nvidia_runfile_url")]
    pub runfile_url: String,
}

/// Template CTIDs declared for automatic clone-source selection, keyed by
/// capability role.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CloneHierarchy {
    #[serde(default)]
    pub base: Option<u32>,
    #[serde(default)]
    pub gpu: Option<u32>,
    #[serde(default)]
    pub docker: Option<u32>,
    #[serde(default)]
    pub docker_gpu: Option<u32>,
    #[serde(default)]
    pub docker_gpu_vllm: Option<u32>,
}

/// GPU indices assigned to a container: `"none"` or comma-separated indices.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum GpuAssignment {
    #[default]
    None,
    Indices(Vec<u32>),
}

impl GpuAssignment {
    /// Whether any GPU is assigned.
    pub fn is_assigned(&self) -> bool {
        matches!(self, GpuAssignment::Indices(_))
    }

    /// Assigned indices; empty when none.
    pub fn indices(&self) -> &[u32] {
        match self {
            GpuAssignment::None => &[],
            GpuAssignment::Indices(indices) => indices,
        }
    }
}

impl TryFrom<String> for GpuAssignment {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
            return Ok(GpuAssignment::None);
        }
        let mut indices = Vec::new();
        for part in trimmed.split(',') {
            let index = part
                .trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid gpu_assignment '{value}': expected 'none' or comma-separated indices"))?;
            indices.push(index);
        }
        Ok(GpuAssignment::Indices(indices))
    }
}

impl fmt::Display for GpuAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuAssignment::None => write!(f, "none"),
            GpuAssignment::Indices(indices) => {
                let parts: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

/// Role in the fleet-management dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortainerRole {
    Server,
    Agent,
    #[default]
    None,
}

impl fmt::Display for PortainerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortainerRole::Server => write!(f, "server"),
            PortainerRole::Agent => write!(f, "agent"),
            PortainerRole::None => write!(f, "none"),
        }
    }
}

/// Per-container network attachment.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Interface name inside the container. Zero value: `eth0`.
    #[serde(default = "default_iface")]
    pub name: String,
    pub bridge: String,
    /// CIDR address, e.g. `10.0.0.50/24`
    pub ip: String,
    #[serde(default)]
    pub gw: Option<String>,
}

/// Workload parameters for the inference server.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct VllmParams {
    pub model: String,
    #[serde(default = "VllmParams::default_tensor_parallel_size")]
    pub tensor_parallel_size: u32,
    #[serde(default = "VllmParams::default_gpu_memory_utilization")]
    pub gpu_memory_utilization: f64,
    #[serde(default)]
    pub max_model_len: Option<u64>,
    #[serde(default = "VllmParams::default_port")]
    pub port: u16,
    /// Readiness budget override in seconds for heavy models. Zero value:
    /// the 120 s application default, never above 600 s.
    #[serde(default)]
    pub readiness_timeout_secs: Option<u64>,
}

impl VllmParams {
    fn default_tensor_parallel_size() -> u32 {
        1
    }

    fn default_gpu_memory_utilization() -> f64 {
        0.90
    }

    fn default_port() -> u16 {
        8000
    }
}

/// Declarative goal state for one container.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSpec {
    /// Hostname
    pub name: String,
    pub memory_mb: u64,
    pub cores: u32,
    /// Base image reference, required for containers created from scratch
    #[serde(default)]
    pub template: Option<String>,
    pub storage_pool: String,
    pub storage_size_gb: u64,
    #[serde(default = "default_unprivileged")]
    pub unprivileged: bool,
    pub network_config: NetworkConfig,
    #[serde(default)]
    pub mac_address: Option<String>,
    /// Ordered feature tags; dependencies are expressed by ordering
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub gpu_assignment: GpuAssignment,
    #[serde(default)]
    pub portainer_role: PortainerRole,
    #[serde(default)]
    pub is_template: bool,
    /// Snapshot that represents this template's finished state
    #[serde(default)]
    pub template_snapshot_name: Option<String>,
    /// Explicit clone parent; wins over capability matching
    #[serde(default)]
    pub clone_from_ctid: Option<u32>,
    /// Finalization handler name
    #[serde(default)]
    pub application_script: Option<String>,
    #[serde(default)]
    pub vllm: Option<VllmParams>,
}

impl ContainerSpec {
    /// Whether `feature` appears in the declared feature sequence.
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn needs_gpu(&self) -> bool {
        self.gpu_assignment.is_assigned()
    }

    pub fn needs_docker(&self) -> bool {
        self.has_feature(crate::features::FEATURE_DOCKER)
    }

    pub fn needs_vllm(&self) -> bool {
        self.has_feature(crate::features::FEATURE_VLLM)
    }

    /// Render the `net0` value for `pct create` / `pct set`.
    pub fn net0(&self) -> String {
        let net = &self.network_config;
        let mut parts = vec![
            format!("name={}", net.name),
            format!("bridge={}", net.bridge),
        ];
        if let Some(mac) = &self.mac_address {
            parts.push(format!("hwaddr={mac}"));
        }
        parts.push(format!("ip={}", net.ip));
        if let Some(gw) = &net.gw {
            parts.push(format!("gw={gw}"));
        }
        parts.join(",")
    }

    /// `pool:size` rootfs argument for `pct create`.
    pub fn rootfs(&self) -> String {
        format!("{}:{}", self.storage_pool, self.storage_size_gb)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct LxcConfigFile {
    #[serde(flatten)]
    nvidia: NvidiaSettings,
    #[serde(default)]
    clone_hierarchy: CloneHierarchy,
    lxc_configs: BTreeMap<String, ContainerSpec>,
}

/// Read-only view over both manifest files, keyed by numeric CTID.
#[derive(Debug, Clone)]
pub struct Manifest {
    global: GlobalSettings,
    nvidia: NvidiaSettings,
    clone_hierarchy: CloneHierarchy,
    specs: BTreeMap<u32, ContainerSpec>,
}

impl Manifest {
    /// Load both manifest files from disk and validate.
    pub fn load(global_path: &Path, lxc_path: &Path) -> Result<Manifest> {
        let global_text = read_manifest_file(global_path)?;
        let lxc_text = read_manifest_file(lxc_path)?;
        Self::parse(
            &global_text,
            &lxc_text,
            &global_path.display().to_string(),
            &lxc_path.display().to_string(),
        )
    }

    /// Parse manifest content. `global_name`/`lxc_name` only label errors.
    pub fn parse(
        global_json: &str,
        lxc_json: &str,
        global_name: &str,
        lxc_name: &str,
    ) -> Result<Manifest> {
        let global: GlobalSettings =
            serde_json::from_str(global_json).map_err(|e| ConfigError::Parse {
                path: global_name.to_string(),
                message: e.to_string(),
            })?;
        let lxc: LxcConfigFile = serde_json::from_str(lxc_json).map_err(|e| ConfigError::Parse {
            path: lxc_name.to_string(),
            message: e.to_string(),
        })?;

        let mut specs = BTreeMap::new();
        for (key, spec) in lxc.lxc_configs {
            let ctid: u32 = key.parse().map_err(|_| ConfigError::Parse {
                path: lxc_name.to_string(),
                message: format!("lxc_configs key '{key}' is not a positive integer CTID"),
            })?;
            if ctid == 0 {
                return Err(PhoenixError::Config(ConfigError::Parse {
                    path: lxc_name.to_string(),
                    message: "CTID 0 is not a valid container identifier".to_string(),
                }));
            }
            specs.insert(ctid, spec);
        }

        let manifest = Manifest {
            global,
            nvidia: lxc.nvidia,
            clone_hierarchy: lxc.clone_hierarchy,
            specs,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural invariants the reconciler depends on.
    fn validate(&self) -> Result<()> {
        for (&ctid, spec) in &self.specs {
            if spec.needs_gpu() && !spec.has_feature(crate::features::FEATURE_NVIDIA) {
                return Err(validation(format!(
                    "CTID {ctid}: gpu_assignment '{}' requires the '{}' feature",
                    spec.gpu_assignment,
                    crate::features::FEATURE_NVIDIA
                )));
            }
            if spec.portainer_role != PortainerRole::None && !spec.needs_docker() {
                return Err(validation(format!(
                    "CTID {ctid}: portainer_role '{}' requires the '{}' feature",
                    spec.portainer_role,
                    crate::features::FEATURE_DOCKER
                )));
            }
            if let Some(parent) = spec.clone_from_ctid {
                let parent_spec = self.specs.get(&parent).ok_or_else(|| {
                    validation(format!(
                        "CTID {ctid}: clone_from_ctid {parent} is not declared in the manifest"
                    ))
                })?;
                if parent_spec.template_snapshot_name.is_none() {
                    return Err(validation(format!(
                        "CTID {ctid}: clone parent {parent} declares no template_snapshot_name"
                    )));
                }
                if parent >= ctid {
                    return Err(validation(format!(
                        "CTID {ctid}: clone parent {parent} must sort before its dependent \
                         (templates are reconciled in ascending CTID order)"
                    )));
                }
            }
            if spec.is_template && spec.template_snapshot_name.is_none() {
                return Err(validation(format!(
                    "CTID {ctid}: is_template requires template_snapshot_name"
                )));
            }
            if spec.is_template && spec.clone_from_ctid.is_none() && spec.template.is_none() {
                return Err(validation(format!(
                    "CTID {ctid}: root template requires a base image in 'template'"
                )));
            }
        }

        for (role, declared) in [
            ("base", self.clone_hierarchy.base),
            ("gpu", self.clone_hierarchy.gpu),
            ("docker", self.clone_hierarchy.docker),
            ("docker_gpu", self.clone_hierarchy.docker_gpu),
            ("docker_gpu_vllm", self.clone_hierarchy.docker_gpu_vllm),
        ] {
            if let Some(template_ctid) = declared {
                let spec = self.specs.get(&template_ctid).ok_or_else(|| {
                    validation(format!(
                        "clone_hierarchy.{role} references undeclared CTID {template_ctid}"
                    ))
                })?;
                if spec.template_snapshot_name.is_none() {
                    return Err(validation(format!(
                        "clone_hierarchy.{role} CTID {template_ctid} declares no template_snapshot_name"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Spec for `ctid`, or `SpecMissing`.
    pub fn get(&self, ctid: u32) -> Result<&ContainerSpec> {
        self.specs
            .get(&ctid)
            .ok_or_else(|| PhoenixError::Config(ConfigError::SpecMissing { ctid }))
    }

    pub fn global(&self) -> &GlobalSettings {
        &self.global
    }

    pub fn nvidia(&self) -> &NvidiaSettings {
        &self.nvidia
    }

    pub fn clone_hierarchy(&self) -> &CloneHierarchy {
        &self.clone_hierarchy
    }

    /// All CTIDs, ascending. Templates sort before their dependents by
    /// manifest convention, which `validate` enforces for explicit parents.
    pub fn all_ctids(&self) -> Vec<u32> {
        self.specs.keys().copied().collect()
    }

    /// Number of declared containers.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

fn validation(message: String) -> PhoenixError {
    PhoenixError::Config(ConfigError::Validation { message })
}

fn read_manifest_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PhoenixError::Config(ConfigError::NotFound {
                path: path.display().to_string(),
            })
        } else {
            PhoenixError::Config(ConfigError::Io { source: e })
        }
    })
}
