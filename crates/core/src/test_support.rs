//! Shared test fixtures: a scripted fake executor and a sample manifest.
//!
//! The fake executor records every invocation with its command class, which
//! is what the idempotence tests count: a satisfied reconciliation must
//! produce zero mutating calls.

use crate::errors::Result;
use crate::exec::{finalize_output, CommandClass, CommandExecutor, CommandOutput, ExecOpts};
use crate::manifest::Manifest;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Where a recorded call was directed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CallScope {
    Host,
    Container(u32),
    PipeInto { ctid: u32, path: String },
}

/// One recorded executor invocation.
#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub scope: CallScope,
    pub argv: Vec<String>,
    pub class: CommandClass,
    pub joined: String,
}

struct Rule {
    needle: String,
    responses: VecDeque<CommandOutput>,
    last: CommandOutput,
}

#[derive(Default)]
pub(crate) struct FakeExecutor {
    dry_run: bool,
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<RecordedCall>>,
    mutations: AtomicU64,
    dry_run_containers: Mutex<HashSet<u32>>,
}

pub(crate) fn output(exit_code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub(crate) fn ok(stdout: &str) -> CommandOutput {
    output(0, stdout)
}

pub(crate) fn fail(exit_code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    /// Respond to any command whose joined argv contains `needle`.
    /// The last scripted response repeats once the queue drains.
    /// Later rules take precedence over earlier ones.
    pub fn on(&self, needle: &str, responses: Vec<CommandOutput>) {
        assert!(!responses.is_empty(), "at least one response required");
        let last = responses.last().cloned().unwrap_or_default();
        self.rules
            .lock()
            .unwrap()
            .push(Rule {
                needle: needle.to_string(),
                responses: responses.into_iter().collect(),
                last,
            });
    }

    /// Shorthand: single success response with the given stdout.
    pub fn on_ok(&self, needle: &str, stdout: &str) {
        self.on(needle, vec![ok(stdout)]);
    }

    /// Shorthand: single failing response.
    pub fn on_fail(&self, needle: &str, exit_code: i32, stderr: &str) {
        self.on(needle, vec![fail(exit_code, stderr)]);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mutating_calls(&self) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.class == CommandClass::Mutating)
            .collect()
    }

    pub fn calls_containing(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.joined.contains(needle))
            .count()
    }

    fn respond(&self, joined: &str) -> CommandOutput {
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut().rev() {
            if joined.contains(&rule.needle) {
                return match rule.responses.len() {
                    0 => rule.last.clone(),
                    1 => rule.responses.front().cloned().unwrap_or_default(),
                    _ => rule.responses.pop_front().unwrap_or_default(),
                };
            }
        }
        CommandOutput::default()
    }

    fn record(&self, scope: CallScope, argv: &[String], class: CommandClass) -> String {
        let joined = argv.join(" ");
        let joined_with_scope = match &scope {
            CallScope::Container(ctid) => format!("ctid:{ctid} {joined}"),
            _ => joined.clone(),
        };
        self.calls.lock().unwrap().push(RecordedCall {
            scope,
            argv: argv.to_vec(),
            class,
            joined: joined_with_scope.clone(),
        });
        joined_with_scope
    }
}

#[async_trait::async_trait]
impl CommandExecutor for FakeExecutor {
    async fn run_host(&self, argv: &[String], opts: &ExecOpts) -> Result<CommandOutput> {
        let joined = self.record(CallScope::Host, argv, opts.class);
        if opts.class == CommandClass::Mutating {
            self.mutations.fetch_add(1, Ordering::SeqCst);
            if self.dry_run {
                return Ok(CommandOutput::default());
            }
        }
        let response = self.respond(&joined);
        finalize_output(response, opts, &joined)
    }

    async fn run_in_container(
        &self,
        ctid: u32,
        argv: &[String],
        opts: &ExecOpts,
    ) -> Result<CommandOutput> {
        let joined = self.record(CallScope::Container(ctid), argv, opts.class);
        if opts.class == CommandClass::Mutating {
            self.mutations.fetch_add(1, Ordering::SeqCst);
            if self.dry_run {
                return Ok(CommandOutput::default());
            }
        }
        if self.dry_run && self.is_dry_run_container(ctid) {
            return Ok(CommandOutput::default());
        }
        let response = self.respond(&joined);
        finalize_output(response, opts, &joined)
    }

    async fn pipe_into(&self, ctid: u32, path: &str, bytes: &[u8]) -> Result<()> {
        self.calls.lock().unwrap().push(RecordedCall {
            scope: CallScope::PipeInto {
                ctid,
                path: path.to_string(),
            },
            argv: vec![String::from_utf8_lossy(bytes).to_string()],
            class: CommandClass::Mutating,
            joined: format!("ctid:{ctid} pipe-into {path}"),
        });
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    fn note_dry_run_container(&self, ctid: u32) {
        if self.dry_run {
            self.dry_run_containers.lock().unwrap().insert(ctid);
        }
    }

    fn is_dry_run_container(&self, ctid: u32) -> bool {
        self.dry_run && self.dry_run_containers.lock().unwrap().contains(&ctid)
    }
}

pub(crate) const GLOBAL_JSON: &str = r#"{
    "network": { "bridge": "vmbr0", "gateway": "10.0.0.1" },
    "docker": {
        "user": "phoenix",
        "portainer": { "server_host": "10.0.0.40", "agent_secret": "portainer-agent-secret" }
    }
}"#;

pub(crate) const LXC_JSON: &str = r#"{
    "nvidia_driver_version": "580.65.06",
    "nvidia_repo_url": "https://developer.download.nvidia.com/compute/cuda/repos/ubuntu2404/x86_64",
    "nvidia_runfile_url": "https://us.download.nvidia.com/XFree86/Linux-x86_64/580.65.06/NVIDIA-Linux-x86_64-580.65.06.run",
    "clone_hierarchy": {
        "base": 900,
        "gpu": 901,
        "docker": 902,
        "docker_gpu": 903,
        "docker_gpu_vllm": 920
    },
    "lxc_configs": {
        "900": {
            "name": "template-base",
            "memory_mb": 2048,
            "cores": 2,
            "template": "local:vztmpl/ubuntu-24.04-standard_24.04-2_amd64.tar.zst",
            "storage_pool": "local-zfs",
            "storage_size_gb": 16,
            "network_config": { "bridge": "vmbr0", "ip": "10.0.0.10/24", "gw": "10.0.0.1" },
            "features": ["base_setup"],
            "is_template": true,
            "template_snapshot_name": "base-snapshot"
        },
        "901": {
            "name": "template-gpu",
            "memory_mb": 4096,
            "cores": 4,
            "storage_pool": "local-zfs",
            "storage_size_gb": 32,
            "network_config": { "bridge": "vmbr0", "ip": "10.0.0.11/24", "gw": "10.0.0.1" },
            "features": ["base_setup", "nvidia"],
            "gpu_assignment": "0,1",
            "is_template": true,
            "template_snapshot_name": "gpu-snapshot",
            "clone_from_ctid": 900
        },
        "902": {
            "name": "template-docker",
            "memory_mb": 4096,
            "cores": 4,
            "storage_pool": "local-zfs",
            "storage_size_gb": 32,
            "network_config": { "bridge": "vmbr0", "ip": "10.0.0.12/24", "gw": "10.0.0.1" },
            "features": ["base_setup", "docker"],
            "is_template": true,
            "template_snapshot_name": "docker-snapshot",
            "clone_from_ctid": 900
        },
        "903": {
            "name": "template-docker-gpu",
            "memory_mb": 8192,
            "cores": 8,
            "storage_pool": "local-zfs",
            "storage_size_gb": 48,
            "network_config": { "bridge": "vmbr0", "ip": "10.0.0.13/24", "gw": "10.0.0.1" },
            "features": ["base_setup", "nvidia", "docker"],
            "gpu_assignment": "0",
            "is_template": true,
            "template_snapshot_name": "docker-gpu-snapshot",
            "clone_from_ctid": 901
        },
        "920": {
            "name": "template-vllm",
            "memory_mb": 32768,
            "cores": 8,
            "storage_pool": "local-zfs",
            "storage_size_gb": 96,
            "network_config": { "bridge": "vmbr0", "ip": "10.0.0.14/24", "gw": "10.0.0.1" },
            "features": ["base_setup", "nvidia", "docker", "vllm"],
            "gpu_assignment": "0,1",
            "is_template": true,
            "template_snapshot_name": "vllm-snapshot",
            "clone_from_ctid": 903
        },
        "950": {
            "name": "vllm-qwen",
            "memory_mb": 65536,
            "cores": 12,
            "storage_pool": "local-zfs",
            "storage_size_gb": 128,
            "network_config": { "bridge": "vmbr0", "ip": "10.0.0.50/24", "gw": "10.0.0.1" },
            "mac_address": "BC:24:11:52:9A:01",
            "features": ["base_setup", "nvidia", "docker", "vllm"],
            "gpu_assignment": "0,1",
            "portainer_role": "agent",
            "application_script": "vllm_server",
            "vllm": {
                "model": "Qwen/Qwen2.5-7B-Instruct",
                "tensor_parallel_size": 2,
                "gpu_memory_utilization": 0.9,
                "max_model_len": 32768
            }
        }
    }
}"#;

pub(crate) fn sample_manifest() -> Manifest {
    Manifest::parse(GLOBAL_JSON, LXC_JSON, "global.json", "lxc.json").unwrap()
}
