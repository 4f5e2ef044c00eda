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

pub mod limits;

use crate::error::JobletError;
use crate::SafeDisplay;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use limits::{LimitError, ResourceLimits};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use strum_macros::{Display as StrumDisplay, EnumIter, EnumString};
use uuid::Uuid;

/// Unit payload for config enum variants and empty responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

fn validate_label(entity: &'static str, value: &str) -> Result<(), JobletError> {
    if value.is_empty() || value.len() > 63 {
        return Err(JobletError::validation(format!(
            "{entity} must be 1..=63 characters: {value:?}"
        )));
    }
    let mut chars = value.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphanumeric() {
        return Err(JobletError::validation(format!(
            "{entity} must start with an alphanumeric character: {value:?}"
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(JobletError::validation(format!(
            "{entity} may only contain alphanumerics, '-' and '_': {value:?}"
        )));
    }
    Ok(())
}

macro_rules! newtype_label {
    ($name:ident, $entity:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, JobletError> {
                let value = value.into();
                validate_label($entity, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = JobletError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value).map_err(|err| err.to_string())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.0
            }
        }
    };
}

newtype_label!(JobName, "job name");
newtype_label!(VolumeName, "volume name");
newtype_label!(NetworkName, "network name");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = JobletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|_| JobletError::validation(format!("invalid job id: {s:?}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for WorkflowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkflowId {
    type Err = JobletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(WorkflowId)
            .map_err(|_| JobletError::validation(format!("invalid workflow id: {s:?}")))
    }
}

/// A pre-installed execution runtime, identified as `name` or
/// `name:version`; `latest` resolves to the highest installed version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RuntimeSpec {
    pub name: String,
    pub version: Option<String>,
}

impl RuntimeSpec {
    pub fn new(name: impl Into<String>, version: Option<String>) -> Result<Self, JobletError> {
        let name = name.into();
        validate_label("runtime name", &name)?;
        Ok(Self { name, version })
    }
}

impl Display for RuntimeSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}:{}", self.name, version),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for RuntimeSpec {
    type Err = JobletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((name, version)) if !version.is_empty() => {
                RuntimeSpec::new(name, Some(version.to_string()))
            }
            Some(_) => Err(JobletError::validation(format!(
                "invalid runtime spec: {s:?}"
            ))),
            None => RuntimeSpec::new(s, None),
        }
    }
}

impl TryFrom<String> for RuntimeSpec {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse().map_err(|err: JobletError| err.to_string())
    }
}

impl From<RuntimeSpec> for String {
    fn from(value: RuntimeSpec) -> String {
        value.to_string()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    StrumDisplay,
    EnumString,
    EnumIter,
)]
pub enum JobStatus {
    Pending,
    Initializing,
    Scheduled,
    Running,
    Completed,
    Failed,
    Stopped,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped | JobStatus::Canceled
        )
    }

    /// The legal lifecycle graph. Terminal states absorb everything;
    /// status never regresses along Initializing -> Running -> terminal.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            (Pending, Initializing) | (Pending, Canceled) => true,
            (Initializing, Scheduled)
            | (Initializing, Running)
            | (Initializing, Failed)
            | (Initializing, Stopped)
            | (Initializing, Canceled) => true,
            (Scheduled, Running)
            | (Scheduled, Failed)
            | (Scheduled, Stopped)
            | (Scheduled, Canceled) => true,
            (Running, Completed) | (Running, Failed) | (Running, Stopped) => true,
            _ => false,
        }
    }
}

/// A single job owned by this node.
///
/// Mutated only through [`Job::transition`] and the executor-owned
/// setters; the store hands out deep copies.
#[derive(Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: Option<JobName>,
    pub command: String,
    pub args: Vec<String>,
    pub limits: ResourceLimits,
    pub status: JobStatus,
    pub pid: Option<u32>,
    pub cgroup_path: Option<PathBuf>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
    pub network: Option<NetworkName>,
    pub volumes: Vec<VolumeName>,
    pub runtime: Option<RuntimeSpec>,
    pub env: HashMap<String, String>,
    pub secret_env: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn create(id: JobId, spec: &JobSpec, now: DateTime<Utc>) -> Job {
        Job {
            id,
            name: spec.name.clone(),
            command: spec.command.clone(),
            args: spec.args.clone(),
            limits: spec.limits.clone(),
            status: JobStatus::Pending,
            pid: None,
            cgroup_path: None,
            start_time: None,
            end_time: None,
            scheduled_time: spec.schedule,
            exit_code: None,
            failure_reason: None,
            network: spec.network.clone(),
            volumes: spec.volumes.clone(),
            runtime: spec.runtime.clone(),
            env: spec.env.clone(),
            secret_env: spec.secret_env.clone(),
            created_at: now,
        }
    }

    /// Moves the job to `to`, maintaining the timestamp invariants:
    /// `start_time` is set on entering `Running`, `end_time` iff the
    /// status is terminal. Returns the previous status.
    pub fn transition(
        &mut self,
        to: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, JobletError> {
        if !self.status.can_transition(to) {
            return Err(JobletError::conflict(format!(
                "invalid transition {} -> {to}",
                self.status
            ))
            .with_context("job_id", self.id));
        }
        let previous = self.status;
        self.status = to;
        if to == JobStatus::Running && self.start_time.is_none() {
            self.start_time = Some(now);
        }
        if to.is_terminal() {
            self.end_time = Some(now);
        }
        Ok(previous)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("status", &self.status)
            .field("pid", &self.pid)
            .field("cgroup_path", &self.cgroup_path)
            .field("exit_code", &self.exit_code)
            .field("network", &self.network)
            .field("volumes", &self.volumes)
            .field("runtime", &self.runtime)
            .field("env", &self.env)
            .field("secret_env", &"****")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    File,
    Directory,
}

/// One client-described upload entry, applied inside the job's
/// workspace before exec.
#[derive(Clone, PartialEq, Eq)]
pub struct UploadEntry {
    pub kind: UploadKind,
    pub relative_path: String,
    pub mode: u32,
    pub data: Bytes,
}

impl UploadEntry {
    pub fn file(relative_path: impl Into<String>, mode: u32, data: impl Into<Bytes>) -> Self {
        Self {
            kind: UploadKind::File,
            relative_path: relative_path.into(),
            mode,
            data: data.into(),
        }
    }

    pub fn directory(relative_path: impl Into<String>, mode: u32) -> Self {
        Self {
            kind: UploadKind::Directory,
            relative_path: relative_path.into(),
            mode,
            data: Bytes::new(),
        }
    }
}

impl fmt::Debug for UploadEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadEntry")
            .field("kind", &self.kind)
            .field("relative_path", &self.relative_path)
            .field("mode", &format_args!("{:o}", self.mode))
            .field("len", &self.data.len())
            .finish()
    }
}

/// Everything a client submits to start a job.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub command: String,
    pub args: Vec<String>,
    pub name: Option<JobName>,
    pub limits: ResourceLimits,
    pub uploads: Vec<UploadEntry>,
    pub volumes: Vec<VolumeName>,
    pub network: Option<NetworkName>,
    pub runtime: Option<RuntimeSpec>,
    pub env: HashMap<String, String>,
    pub secret_env: HashMap<String, String>,
    pub schedule: Option<DateTime<Utc>>,
}

impl JobSpec {
    pub fn command(command: impl Into<String>, args: impl IntoIterator<Item = &'static str>) -> Self {
        JobSpec {
            command: command.into(),
            args: args.into_iter().map(|s| s.to_string()).collect(),
            ..JobSpec::default()
        }
    }
}

/// Emitted on every store mutation; ordered per job.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Created {
        job: Job,
        at: DateTime<Utc>,
    },
    StatusChanged {
        job: Job,
        previous: JobStatus,
        at: DateTime<Utc>,
    },
    Deleted {
        job_id: JobId,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Created { job, .. } => job.id,
            JobEvent::StatusChanged { job, .. } => job.id,
            JobEvent::Deleted { job_id, .. } => *job_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay)]
pub enum LogOrigin {
    Stdout,
    Stderr,
    System,
}

/// A slice of job output with a per-job, per-stream sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub job_id: JobId,
    pub origin: LogOrigin,
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub job_id: JobId,
    pub at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_current_bytes: u64,
    pub memory_peak_bytes: u64,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
    pub gpu_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskStats {
    pub mount_point: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceStats {
    pub name: String,
    pub received_bytes: u64,
    pub transmitted_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub at: DateTime<Utc>,
    pub cpu_per_core: Vec<f32>,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub disks: Vec<DiskStats>,
    pub interfaces: Vec<InterfaceStats>,
    pub top_processes: Vec<ProcessStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricSample {
    Job(JobMetrics),
    System(SystemMetrics),
}

/// An address handed to a job on a named network, released when the
/// job terminates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNetworkAllocation {
    pub job_id: JobId,
    pub network: NetworkName,
    pub ip: std::net::Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Option<std::net::Ipv4Addr>,
    pub mac: String,
    /// Host-side veth interface name; the peer end becomes `eth0`
    /// inside the job's namespace.
    pub veth_host: String,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay, EnumString,
)]
pub enum VolumeType {
    Filesystem,
    Memory,
}

/// On-disk volume metadata, one `volume-info.json` per volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    pub name: VolumeName,
    #[serde(rename = "type")]
    pub volume_type: VolumeType,
    pub size: String,
    pub size_bytes: u64,
    pub created_time: DateTime<Utc>,
}

/// A volume as known to the registry, including its live refcount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub name: VolumeName,
    pub volume_type: VolumeType,
    pub size: String,
    pub size_bytes: u64,
    pub path: PathBuf,
    pub created_time: DateTime<Utc>,
    pub refcount: u32,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay, EnumString,
)]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

/// Limits as written in a workflow file; parsed with the value-object
/// parsers when the node is submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsSpec {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub cores: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub io_bandwidth: Option<String>,
}

impl LimitsSpec {
    pub fn to_limits(&self) -> Result<ResourceLimits, LimitError> {
        Ok(ResourceLimits {
            cpu: self.cpu.as_deref().map(str::parse).transpose()?.unwrap_or_default(),
            cores: self
                .cores
                .as_deref()
                .map(str::parse)
                .transpose()?
                .unwrap_or_default(),
            memory: self
                .memory
                .as_deref()
                .map(str::parse)
                .transpose()?
                .unwrap_or_default(),
            io_bandwidth: self
                .io_bandwidth
                .as_deref()
                .map(str::parse)
                .transpose()?
                .unwrap_or_default(),
        })
    }
}

/// One node of a workflow file: a job spec plus its predecessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowJobSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub limits: Option<LimitsSpec>,
    #[serde(default)]
    pub volumes: Vec<VolumeName>,
    #[serde(default)]
    pub network: Option<NetworkName>,
    #[serde(default)]
    pub runtime: Option<RuntimeSpec>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A parsed workflow file: node name -> spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub jobs: BTreeMap<String, WorkflowJobSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowJobState {
    pub requires: Vec<String>,
    pub job_id: Option<JobId>,
    pub status: JobStatus,
}

/// Aggregated state of a submitted workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub status: WorkflowStatus,
    pub jobs: BTreeMap<String, WorkflowJobState>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    /// Empty means all statuses.
    pub statuses: Vec<JobStatus>,
    pub name: Option<JobName>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.name.as_ref().is_none_or(|name| job.name.as_ref() == Some(name))
    }
}

impl SafeDisplay for Job {
    fn to_safe_string(&self) -> String {
        format!(
            "job {} ({}) status {} command {:?}",
            self.id,
            self.name.as_ref().map(|n| n.as_str()).unwrap_or("-"),
            self.status,
            self.command,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use strum::IntoEnumIterator;
    use test_r::test;

    #[test]
    fn labels_are_validated() {
        assert!(VolumeName::new("data1").is_ok());
        assert!(VolumeName::new("data_1-x").is_ok());
        assert!(VolumeName::new("").is_err());
        assert!(VolumeName::new("-leading").is_err());
        assert!(VolumeName::new("has space").is_err());
        assert!(VolumeName::new("a".repeat(64)).is_err());
    }

    #[test]
    fn runtime_spec_round_trips() {
        let spec: RuntimeSpec = "python:3.11".parse().unwrap();
        assert_eq!(spec.name, "python");
        assert_eq!(spec.version.as_deref(), Some("3.11"));
        assert_eq!(spec.to_string().parse::<RuntimeSpec>().unwrap(), spec);

        let bare: RuntimeSpec = "python".parse().unwrap();
        assert_eq!(bare.version, None);
        assert!("python:".parse::<RuntimeSpec>().is_err());
    }

    #[test]
    fn terminal_statuses_absorb_all_transitions() {
        for from in JobStatus::iter().filter(JobStatus::is_terminal) {
            for to in JobStatus::iter() {
                assert!(
                    !from.can_transition(to),
                    "{from} -> {to} must be rejected"
                );
            }
        }
    }

    #[test]
    fn status_never_regresses() {
        assert!(!JobStatus::Running.can_transition(JobStatus::Initializing));
        assert!(!JobStatus::Running.can_transition(JobStatus::Scheduled));
        assert!(!JobStatus::Scheduled.can_transition(JobStatus::Initializing));
        assert!(!JobStatus::Initializing.can_transition(JobStatus::Pending));
    }

    #[test]
    fn fuzzed_transitions_keep_terminal_states_monotonic() {
        let mut rng = StdRng::seed_from_u64(7);
        let statuses: Vec<JobStatus> = JobStatus::iter().collect();
        for _ in 0..200 {
            let mut job = Job::create(JobId::new_v4(), &JobSpec::command("/bin/true", []), Utc::now());
            let mut reached_terminal = false;
            for _ in 0..50 {
                let to = statuses[rng.random_range(0..statuses.len())];
                let result = job.transition(to, Utc::now());
                if reached_terminal {
                    assert!(result.is_err(), "terminal state must absorb {to}");
                }
                if job.status.is_terminal() {
                    reached_terminal = true;
                    assert!(job.end_time.is_some());
                }
            }
        }
    }

    #[test]
    fn transition_sets_timestamps() {
        let mut job = Job::create(JobId::new_v4(), &JobSpec::command("/bin/echo", ["hi"]), Utc::now());
        job.transition(JobStatus::Initializing, Utc::now()).unwrap();
        assert!(job.start_time.is_none() && job.end_time.is_none());
        job.transition(JobStatus::Running, Utc::now()).unwrap();
        assert!(job.start_time.is_some() && job.end_time.is_none());
        job.transition(JobStatus::Completed, Utc::now()).unwrap();
        assert!(job.end_time.is_some());
    }

    #[test]
    fn job_debug_redacts_secret_env() {
        let mut spec = JobSpec::command("/bin/env", []);
        spec.secret_env
            .insert("API_KEY".to_string(), "hunter2".to_string());
        let job = Job::create(JobId::new_v4(), &spec, Utc::now());
        let rendered = format!("{job:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("****"));
    }

    #[test]
    fn volume_info_uses_the_on_disk_field_names() {
        let info = VolumeInfo {
            name: VolumeName::new("v1").unwrap(),
            volume_type: VolumeType::Filesystem,
            size: "1MB".to_string(),
            size_bytes: 1024 * 1024,
            created_time: Utc::now(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["name"], "v1");
        assert_eq!(json["type"], "Filesystem");
        assert_eq!(json["size"], "1MB");
        assert_eq!(json["sizeBytes"], 1024 * 1024);
        assert!(json["createdTime"].is_string());
    }
}
