// Copyright 2024-2025 Joblet Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::logs::DEFAULT_CAPACITY_BYTES;
use crate::services::executor::ExecutorSettings;
use crate::services::monitor::MonitorSettings;
use crate::services::network::{parse_cidr, NetworkKind};
use joblet_common::config::ConfigLoader;
use joblet_common::error::JobletError;
use joblet_common::model::{Empty, NetworkName};
use joblet_common::tracing::TracingConfig;
use joblet_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobletConfig {
    pub tracing: TracingConfig,
    /// Port the (externally provided) control RPC layer binds.
    pub grpc_port: u16,
    pub workspace_root: PathBuf,
    pub volumes_path: PathBuf,
    pub runtimes_path: PathBuf,
    pub cgroup_root: PathBuf,
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    pub preserve_workspaces: bool,
    pub run_as: Option<RunAsConfig>,
    pub log_buffer_capacity: usize,
    pub monitor: MonitorConfig,
    pub persistence: PersistenceConfig,
    pub networks: BTreeMap<String, NetworkConfig>,
}

impl Default for JobletConfig {
    fn default() -> Self {
        let mut networks = BTreeMap::new();
        networks.insert(
            "bridge".to_string(),
            NetworkConfig {
                bridge: Some("joblet0".to_string()),
                cidr: Some("172.30.0.0/24".to_string()),
            },
        );
        JobletConfig {
            tracing: TracingConfig::local_dev("joblet-executor"),
            grpc_port: 50051,
            workspace_root: PathBuf::from("/var/lib/joblet/jobs"),
            volumes_path: PathBuf::from("/var/lib/joblet/volumes"),
            runtimes_path: PathBuf::from("/opt/joblet/runtimes"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/joblet"),
            grace_period: Duration::from_secs(10),
            preserve_workspaces: false,
            run_as: None,
            log_buffer_capacity: DEFAULT_CAPACITY_BYTES,
            monitor: MonitorConfig::default(),
            persistence: PersistenceConfig::default(),
            networks,
        }
    }
}

impl SafeDisplay for JobletConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "gRPC port: {}", self.grpc_port);
        let _ = writeln!(&mut result, "workspace root: {:?}", self.workspace_root);
        let _ = writeln!(&mut result, "volumes path: {:?}", self.volumes_path);
        let _ = writeln!(&mut result, "runtimes path: {:?}", self.runtimes_path);
        let _ = writeln!(&mut result, "cgroup root: {:?}", self.cgroup_root);
        let _ = writeln!(&mut result, "grace period: {:?}", self.grace_period);
        let _ = writeln!(
            &mut result,
            "preserve workspaces: {}",
            self.preserve_workspaces
        );
        let _ = writeln!(
            &mut result,
            "log buffer capacity: {}",
            self.log_buffer_capacity
        );
        let _ = writeln!(&mut result, "monitor:");
        let _ = writeln!(&mut result, "{}", self.monitor.to_safe_string_indented());
        let _ = writeln!(&mut result, "persistence:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.persistence.to_safe_string_indented()
        );
        for (name, network) in &self.networks {
            let _ = writeln!(&mut result, "network {name}:");
            let _ = writeln!(&mut result, "{}", network.to_safe_string_indented());
        }
        result
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RunAsConfig {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub top_processes: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            interval: Duration::from_millis(1000),
            top_processes: 10,
        }
    }
}

impl SafeDisplay for MonitorConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "interval: {:?}, top processes: {}",
            self.interval, self.top_processes
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum PersistenceBackendConfig {
    InMemory(Empty),
    DynamoDb(DynamoDbConfig),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DynamoDbConfig {
    pub table: String,
    pub region: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackendConfig,
    pub queue_capacity: usize,
    /// TTL applied to terminal job records.
    #[serde(with = "humantime_serde")]
    pub terminal_ttl: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            backend: PersistenceBackendConfig::InMemory(Empty {}),
            queue_capacity: 1024,
            terminal_ttl: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

impl SafeDisplay for PersistenceConfig {
    fn to_safe_string(&self) -> String {
        let backend = match &self.backend {
            PersistenceBackendConfig::InMemory(_) => "in-memory".to_string(),
            PersistenceBackendConfig::DynamoDb(config) => format!(
                "dynamodb table {} (region {})",
                config.table,
                config.region.as_deref().unwrap_or("default")
            ),
        };
        format!(
            "backend: {backend}, queue capacity: {}, terminal TTL: {:?}",
            self.queue_capacity, self.terminal_ttl
        )
    }
}

/// A named bridge network; `host`, `none` and `isolated` are built in
/// and need no configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub bridge: Option<String>,
    pub cidr: Option<String>,
}

impl SafeDisplay for NetworkConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "bridge: {}, cidr: {}",
            self.bridge.as_deref().unwrap_or("-"),
            self.cidr.as_deref().unwrap_or("-")
        )
    }
}

impl JobletConfig {
    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            workspace_root: self.workspace_root.clone(),
            grace_period: self.grace_period,
            preserve_workspaces: self.preserve_workspaces,
            run_as: self.run_as.map(|run_as| (run_as.uid, run_as.gid)),
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            interval: self.monitor.interval,
            top_processes: self.monitor.top_processes,
        }
    }

    pub fn network_definitions(&self) -> Result<Vec<(NetworkName, NetworkKind)>, JobletError> {
        let mut definitions = Vec::new();
        for (name, network) in &self.networks {
            let name = NetworkName::new(name.as_str())?;
            let cidr = network.cidr.as_deref().ok_or_else(|| {
                JobletError::validation(format!("network {name} is missing a cidr"))
            })?;
            let (address, prefix_len) = parse_cidr(cidr)?;
            definitions.push((
                name.clone(),
                NetworkKind::Bridge {
                    bridge: network
                        .bridge
                        .clone()
                        .unwrap_or_else(|| format!("jb-{name}")),
                    network: address,
                    prefix_len,
                },
            ));
        }
        Ok(definitions)
    }
}

pub fn make_config_loader() -> ConfigLoader<JobletConfig> {
    ConfigLoader::new(&PathBuf::from("config/joblet-executor.toml"))
}
