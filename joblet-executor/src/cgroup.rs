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

//! Translates [`ResourceLimits`] into cgroup v2 control-file writes.

use crate::platform::Platform;
use joblet_common::error::JobletError;
use joblet_common::model::limits::ResourceLimits;
use joblet_common::model::JobId;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const CPU_PERIOD_USEC: u64 = 100_000;

const RMDIR_ATTEMPTS: u32 = 10;

pub struct CgroupBuilder {
    platform: Arc<dyn Platform>,
    root: PathBuf,
}

impl CgroupBuilder {
    pub fn new(platform: Arc<dyn Platform>, root: PathBuf) -> Self {
        CgroupBuilder { platform, root }
    }

    pub fn cgroup_path(&self, job_id: &JobId) -> PathBuf {
        self.root.join(format!("job-{job_id}"))
    }

    /// Rejects limits the node cannot honor before anything is written.
    pub fn cross_validate(&self, limits: &ResourceLimits) -> Result<(), JobletError> {
        limits
            .memory
            .validate_limit()
            .map_err(|err| JobletError::validation(err.to_string()))?;
        if !limits.cores.is_empty() {
            let online = self
                .platform
                .online_cpus()
                .map_err(|err| JobletError::from(err).with_context("operation", "online_cpus"))?;
            for core in limits.cores.iter() {
                if !online.contains(&core) {
                    return Err(JobletError::validation(format!(
                        "core {core} is not in the online CPU set"
                    )));
                }
            }
        }
        Ok(())
    }

    fn ensure_root(&self) {
        if let Err(err) = self.platform.create_dir_all(&self.root) {
            warn!(root = %self.root.display(), %err, "Failed to create cgroup root");
            return;
        }
        // Child groups only see the controllers delegated here.
        if let Err(err) = self.platform.write_file(
            &self.root.join("cgroup.subtree_control"),
            b"+cpu +cpuset +memory +io",
        ) {
            warn!(%err, "Failed to enable cgroup controllers; limits may not apply");
        }
    }

    pub fn create(&self, job_id: &JobId, limits: &ResourceLimits) -> Result<PathBuf, JobletError> {
        self.cross_validate(limits)?;
        self.ensure_root();

        let path = self.cgroup_path(job_id);
        let result = self.write_limits(&path, limits);
        if let Err(err) = result {
            let _ = self.platform.remove_dir(&path);
            return Err(JobletError::from(err)
                .with_context("job_id", job_id)
                .with_context("operation", "cgroup_create"));
        }
        Ok(path)
    }

    fn write_limits(&self, path: &Path, limits: &ResourceLimits) -> io::Result<()> {
        self.platform.create_dir_all(path)?;

        let quota = if limits.cpu.is_unlimited() {
            "max".to_string()
        } else {
            (u64::from(limits.cpu.as_percent()) * CPU_PERIOD_USEC / 100).to_string()
        };
        self.platform.write_file(
            &path.join("cpu.max"),
            format!("{quota} {CPU_PERIOD_USEC}").as_bytes(),
        )?;

        if !limits.cores.is_empty() {
            self.platform
                .write_file(&path.join("cpuset.cpus"), limits.cores.to_string().as_bytes())?;
        }

        let memory = if limits.memory.is_unlimited() {
            "max".to_string()
        } else {
            limits.memory.as_bytes().to_string()
        };
        self.platform
            .write_file(&path.join("memory.max"), memory.as_bytes())?;
        let swap = if limits.memory.is_unlimited() { "max" } else { "0" };
        self.platform
            .write_file(&path.join("memory.swap.max"), swap.as_bytes())?;

        if !limits.io_bandwidth.is_unlimited() {
            let bps = limits.io_bandwidth.as_bytes_per_sec();
            for device in self.platform.block_devices()? {
                self.platform.write_file(
                    &path.join("io.max"),
                    format!("{}:{} rbps={bps} wbps={bps}", device.major, device.minor).as_bytes(),
                )?;
            }
        }

        Ok(())
    }

    pub fn add_process(&self, path: &Path, pid: u32) -> Result<(), JobletError> {
        self.platform
            .write_file(&path.join("cgroup.procs"), pid.to_string().as_bytes())
            .map_err(|err| {
                JobletError::from(err)
                    .with_context("operation", "cgroup_add_process")
                    .with_context("pid", pid)
            })
    }

    /// Tears the group down, killing leftovers first. Errors are
    /// logged, never surfaced.
    pub fn destroy(&self, path: &Path) {
        if !self.platform.exists(path) {
            return;
        }
        if let Err(err) = self.platform.write_file(&path.join("cgroup.kill"), b"1") {
            warn!(path = %path.display(), %err, "Failed to kill cgroup members");
        }
        for attempt in 0..RMDIR_ATTEMPTS {
            match self.platform.remove_dir(path) {
                Ok(()) => return,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return,
                Err(err) => {
                    if attempt + 1 == RMDIR_ATTEMPTS {
                        warn!(path = %path.display(), %err, "Failed to remove cgroup");
                    } else {
                        std::thread::sleep(Duration::from_millis(20));
                    }
                }
            }
        }
    }

    // Statistic readers used by the monitor.

    pub fn read_cpu_usage_usec(&self, path: &Path) -> io::Result<u64> {
        let contents = self.platform.read_file(&path.join("cpu.stat"))?;
        let text = String::from_utf8_lossy(&contents);
        for line in text.lines() {
            if let Some(value) = line.strip_prefix("usage_usec ") {
                return value
                    .trim()
                    .parse()
                    .map_err(|_| io::Error::other("malformed cpu.stat"));
            }
        }
        Err(io::Error::other("usage_usec missing from cpu.stat"))
    }

    pub fn read_memory_current(&self, path: &Path) -> io::Result<u64> {
        let contents = self.platform.read_file(&path.join("memory.current"))?;
        String::from_utf8_lossy(&contents)
            .trim()
            .parse()
            .map_err(|_| io::Error::other("malformed memory.current"))
    }

    pub fn read_memory_peak(&self, path: &Path) -> io::Result<u64> {
        let contents = self.platform.read_file(&path.join("memory.peak"))?;
        String::from_utf8_lossy(&contents)
            .trim()
            .parse()
            .map_err(|_| io::Error::other("malformed memory.peak"))
    }

    /// Total bytes read/written across all devices from `io.stat`.
    pub fn read_io_totals(&self, path: &Path) -> io::Result<(u64, u64)> {
        let contents = self.platform.read_file(&path.join("io.stat"))?;
        let text = String::from_utf8_lossy(&contents);
        let mut read_bytes = 0u64;
        let mut write_bytes = 0u64;
        for line in text.lines() {
            for field in line.split_whitespace() {
                if let Some(value) = field.strip_prefix("rbytes=") {
                    read_bytes += value.parse::<u64>().unwrap_or(0);
                } else if let Some(value) = field.strip_prefix("wbytes=") {
                    write_bytes += value.parse::<u64>().unwrap_or(0);
                }
            }
        }
        Ok((read_bytes, write_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakePlatform;
    use joblet_common::model::limits::{CpuCoreSet, CpuPercent, IoBandwidth, MemorySize};
    use test_r::test;

    fn builder() -> (Arc<FakePlatform>, CgroupBuilder) {
        let platform = Arc::new(FakePlatform::new());
        let builder = CgroupBuilder::new(platform.clone(), PathBuf::from("/sys/fs/cgroup/joblet"));
        (platform, builder)
    }

    fn contents(platform: &FakePlatform, path: &Path) -> String {
        String::from_utf8(platform.file_contents(path).unwrap()).unwrap()
    }

    #[test]
    fn unlimited_cpu_writes_max_with_fixed_period() {
        let (platform, builder) = builder();
        let path = builder
            .create(&JobId::new_v4(), &ResourceLimits::default())
            .unwrap();
        assert_eq!(contents(&platform, &path.join("cpu.max")), "max 100000");
        assert_eq!(contents(&platform, &path.join("memory.max")), "max");
        assert_eq!(contents(&platform, &path.join("memory.swap.max")), "max");
        assert!(platform.file_contents(&path.join("cpuset.cpus")).is_none());
        assert!(platform.file_contents(&path.join("io.max")).is_none());
    }

    #[test]
    fn percentages_scale_the_quota() {
        let (platform, builder) = builder();
        let limits = ResourceLimits {
            cpu: CpuPercent(150),
            ..ResourceLimits::default()
        };
        let path = builder.create(&JobId::new_v4(), &limits).unwrap();
        assert_eq!(contents(&platform, &path.join("cpu.max")), "150000 100000");
    }

    #[test]
    fn core_set_and_memory_and_io_are_written() {
        let (platform, builder) = builder();
        let limits = ResourceLimits {
            cpu: CpuPercent(50),
            cores: "0-2".parse::<CpuCoreSet>().unwrap(),
            memory: MemorySize(64 * 1024 * 1024),
            io_bandwidth: IoBandwidth(10 * 1024 * 1024),
        };
        let path = builder.create(&JobId::new_v4(), &limits).unwrap();
        assert_eq!(contents(&platform, &path.join("cpuset.cpus")), "0-2");
        assert_eq!(contents(&platform, &path.join("memory.max")), "67108864");
        assert_eq!(contents(&platform, &path.join("memory.swap.max")), "0");
        assert_eq!(
            contents(&platform, &path.join("io.max")),
            "8:0 rbps=10485760 wbps=10485760"
        );
    }

    #[test]
    fn oversized_memory_is_rejected() {
        let (_platform, builder) = builder();
        let limits = ResourceLimits {
            memory: MemorySize(32 * 1024 * 1024 * 1024 + 1),
            ..ResourceLimits::default()
        };
        let error = builder.create(&JobId::new_v4(), &limits).unwrap_err();
        assert_eq!(error.kind, joblet_common::error::ErrorKind::Validation);
    }

    #[test]
    fn cores_outside_the_online_set_are_rejected() {
        let (_platform, builder) = builder();
        let limits = ResourceLimits {
            cores: "6-9".parse::<CpuCoreSet>().unwrap(),
            ..ResourceLimits::default()
        };
        let error = builder.create(&JobId::new_v4(), &limits).unwrap_err();
        assert_eq!(error.kind, joblet_common::error::ErrorKind::Validation);
    }

    #[test]
    fn destroy_removes_the_group() {
        let (platform, builder) = builder();
        let path = builder
            .create(&JobId::new_v4(), &ResourceLimits::default())
            .unwrap();
        builder.destroy(&path);
        assert!(!platform.exists(&path));
    }
}
