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

//! Size-bounded persistent storage for jobs: loop-mounted ext4 images
//! for `Filesystem` volumes, tmpfs for `Memory` volumes.

use crate::metrics;
use crate::platform::Platform;
use crate::unwind::UnwindStack;
use async_trait::async_trait;
use chrono::Utc;
use joblet_common::error::JobletError;
use joblet_common::model::limits::MemorySize;
use joblet_common::model::{JobId, Volume, VolumeInfo, VolumeName, VolumeType};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const METADATA_FILE: &str = "volume-info.json";
pub const LOOP_INFO_FILE: &str = "loop-info.txt";
pub const IMAGE_FILE: &str = "volume.img";

// Serializes losetup find/attach across the process; concurrent
// `losetup -f` races hand two callers the same device.
static LOOP_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, PartialEq, Eq)]
enum VolumeMode {
    Loop { device: PathBuf, backing: PathBuf },
    /// Loop setup unavailable; plain directory, size not enforced.
    PlainDirectory,
    Tmpfs,
}

#[derive(Debug, Clone)]
struct VolumeState {
    info: VolumeInfo,
    dir: PathBuf,
    mode: VolumeMode,
    attached: HashSet<JobId>,
}

impl VolumeState {
    fn to_volume(&self) -> Volume {
        Volume {
            name: self.info.name.clone(),
            volume_type: self.info.volume_type,
            size: self.info.size.clone(),
            size_bytes: self.info.size_bytes,
            path: self.dir.clone(),
            created_time: self.info.created_time,
            refcount: self.attached.len() as u32,
        }
    }

    fn data_path(&self) -> PathBuf {
        self.dir.join("data")
    }
}

#[async_trait]
pub trait VolumeService: Send + Sync {
    async fn create(
        &self,
        name: &VolumeName,
        size: &str,
        volume_type: VolumeType,
    ) -> Result<Volume, JobletError>;
    async fn list(&self) -> Vec<Volume>;
    async fn get(&self, name: &VolumeName) -> Result<Volume, JobletError>;
    /// Fails with `Conflict` while any job still claims the volume.
    async fn remove(&self, name: &VolumeName) -> Result<(), JobletError>;
    /// All-or-nothing across the list; returns `(name, data path)`
    /// pairs for the sandbox mounts.
    async fn attach(
        &self,
        names: &[VolumeName],
        job_id: &JobId,
    ) -> Result<Vec<(String, PathBuf)>, JobletError>;
    async fn detach(&self, names: &[VolumeName], job_id: &JobId);
    async fn validate(&self, names: &[VolumeName]) -> Result<(), JobletError>;
    /// `(used, available)` bytes of the volume filesystem.
    async fn usage(&self, name: &VolumeName) -> Result<(u64, u64), JobletError>;
    /// Rebuilds the registry from disk; re-mounts memory volumes whose
    /// tmpfs did not survive the restart. Returns the volume count.
    async fn scan_on_startup(&self) -> Result<usize, JobletError>;
}

pub struct VolumeServiceDefault {
    platform: Arc<dyn Platform>,
    base_path: PathBuf,
    volumes: RwLock<HashMap<VolumeName, VolumeState>>,
}

impl VolumeServiceDefault {
    pub fn new(platform: Arc<dyn Platform>, base_path: PathBuf) -> Self {
        VolumeServiceDefault {
            platform,
            base_path,
            volumes: RwLock::new(HashMap::new()),
        }
    }

    fn volume_dir(&self, name: &VolumeName) -> PathBuf {
        self.base_path.join(name.as_str())
    }

    fn create_on_disk(
        platform: &Arc<dyn Platform>,
        dir: &Path,
        info: &VolumeInfo,
    ) -> Result<VolumeMode, JobletError> {
        let mut unwind = UnwindStack::new();

        platform.create_dir_all(dir)?;
        {
            let platform = platform.clone();
            let dir = dir.to_path_buf();
            unwind.push("remove volume directory", move || {
                if let Err(err) = platform.remove_dir_all(&dir) {
                    warn!(dir = %dir.display(), %err, "Failed to remove volume directory");
                }
            });
        }

        let data = dir.join("data");
        platform.create_dir_all(&data)?;
        let metadata = serde_json::to_vec_pretty(info)
            .map_err(|err| JobletError::unknown(format!("metadata serialization: {err}")))?;
        platform.write_file(&dir.join(METADATA_FILE), &metadata)?;

        let mode = match info.volume_type {
            VolumeType::Memory => {
                platform.mount_tmpfs(&data, info.size_bytes)?;
                VolumeMode::Tmpfs
            }
            VolumeType::Filesystem => {
                let backing = dir.join(IMAGE_FILE);
                platform.create_sparse_file(&backing, info.size_bytes)?;

                let attached = {
                    let _guard = LOOP_LOCK.lock().unwrap();
                    platform.attach_loop_device(&backing)
                };
                match attached {
                    Err(err) => {
                        // Size enforcement needs the loop device; fall
                        // back to a plain directory and record the mode
                        // by omitting the loop-info sidecar.
                        warn!(
                            volume = %info.name,
                            %err,
                            "Loop setup unavailable; falling back to a plain directory (size not enforced)"
                        );
                        platform.remove_file(&backing)?;
                        VolumeMode::PlainDirectory
                    }
                    Ok(device) => {
                        {
                            let platform = platform.clone();
                            let device = device.clone();
                            unwind.push("detach loop device", move || {
                                let _guard = LOOP_LOCK.lock().unwrap();
                                if let Err(err) = platform.detach_loop_device(&device) {
                                    warn!(device = %device.display(), %err, "Failed to detach loop device");
                                }
                            });
                        }
                        platform.make_ext4(&device)?;
                        platform.mount_device(&device, &data)?;
                        {
                            let platform = platform.clone();
                            let data = data.clone();
                            unwind.push("unmount volume", move || {
                                if let Err(err) = platform.unmount(&data, true) {
                                    warn!(target = %data.display(), %err, "Failed to unmount volume");
                                }
                            });
                        }
                        platform.set_mode(&data, 0o755)?;
                        let loop_info = format!(
                            "loop_device={}\nbacking_file={}\n",
                            device.display(),
                            backing.display()
                        );
                        platform.write_file(&dir.join(LOOP_INFO_FILE), loop_info.as_bytes())?;
                        VolumeMode::Loop {
                            device,
                            backing,
                        }
                    }
                }
            }
        };

        unwind.commit();
        Ok(mode)
    }

    fn remove_on_disk(platform: &Arc<dyn Platform>, state: &VolumeState) {
        let data = state.data_path();
        match &state.mode {
            VolumeMode::Tmpfs => {
                if let Err(err) = platform.unmount(&data, true) {
                    warn!(target = %data.display(), %err, "Failed to unmount tmpfs volume");
                }
            }
            VolumeMode::Loop { device, .. } => {
                if let Err(err) = platform.unmount(&data, true) {
                    warn!(target = %data.display(), %err, "Failed to unmount volume");
                }
                let _guard = LOOP_LOCK.lock().unwrap();
                if let Err(err) = platform.detach_loop_device(device) {
                    warn!(device = %device.display(), %err, "Failed to detach loop device");
                }
            }
            VolumeMode::PlainDirectory => {}
        }
        if let Err(err) = platform.remove_dir_all(&state.dir) {
            warn!(dir = %state.dir.display(), %err, "Failed to remove volume directory");
        }
    }

    fn scan_one(
        platform: &Arc<dyn Platform>,
        dir: &Path,
        mounted: &[PathBuf],
    ) -> Result<VolumeState, JobletError> {
        let metadata = platform.read_file(&dir.join(METADATA_FILE))?;
        let info: VolumeInfo = serde_json::from_slice(&metadata)
            .map_err(|err| JobletError::unknown(format!("malformed {METADATA_FILE}: {err}")))?;
        let data = dir.join("data");

        let mode = match info.volume_type {
            VolumeType::Memory => {
                if !mounted.contains(&data) {
                    info!(volume = %info.name, "Re-mounting memory volume after restart");
                    platform.mount_tmpfs(&data, info.size_bytes)?;
                }
                VolumeMode::Tmpfs
            }
            VolumeType::Filesystem => {
                match platform.read_file(&dir.join(LOOP_INFO_FILE)) {
                    Ok(contents) => {
                        let text = String::from_utf8_lossy(&contents);
                        let mut device = None;
                        let mut backing = None;
                        for line in text.lines() {
                            if let Some(value) = line.strip_prefix("loop_device=") {
                                device = Some(PathBuf::from(value.trim()));
                            } else if let Some(value) = line.strip_prefix("backing_file=") {
                                backing = Some(PathBuf::from(value.trim()));
                            }
                        }
                        match (device, backing) {
                            (Some(device), Some(backing)) => VolumeMode::Loop { device, backing },
                            _ => {
                                return Err(JobletError::unknown(format!(
                                    "malformed {LOOP_INFO_FILE} in {}",
                                    dir.display()
                                )))
                            }
                        }
                    }
                    Err(_) => VolumeMode::PlainDirectory,
                }
            }
        };

        Ok(VolumeState {
            info,
            dir: dir.to_path_buf(),
            mode,
            attached: HashSet::new(),
        })
    }
}

#[async_trait]
impl VolumeService for VolumeServiceDefault {
    async fn create(
        &self,
        name: &VolumeName,
        size: &str,
        volume_type: VolumeType,
    ) -> Result<Volume, JobletError> {
        let parsed: MemorySize = size
            .parse()
            .map_err(|err: joblet_common::model::limits::LimitError| {
                JobletError::validation(err.to_string())
            })?;
        if parsed.is_unlimited() {
            return Err(JobletError::validation("volume size must be non-zero"));
        }

        {
            let volumes = self.volumes.read().await;
            if volumes.contains_key(name) {
                return Err(JobletError::already_exists("volume", name));
            }
        }

        let info = VolumeInfo {
            name: name.clone(),
            volume_type,
            size: size.to_string(),
            size_bytes: parsed.as_bytes(),
            created_time: Utc::now(),
        };
        let dir = self.volume_dir(name);

        let platform = self.platform.clone();
        let blocking_info = info.clone();
        let blocking_dir = dir.clone();
        let mode = tokio::task::spawn_blocking(move || {
            Self::create_on_disk(&platform, &blocking_dir, &blocking_info)
        })
        .await
        .map_err(|err| JobletError::infrastructure(format!("volume worker panicked: {err}")))?
        .map_err(|err| err.with_context("volume", name).with_context("operation", "create"))?;

        let state = VolumeState {
            info,
            dir,
            mode,
            attached: HashSet::new(),
        };
        let volume = state.to_volume();

        let mut volumes = self.volumes.write().await;
        if volumes.contains_key(name) {
            // Raced with a concurrent create; undo our copy.
            let platform = self.platform.clone();
            let state = state.clone();
            tokio::task::spawn_blocking(move || Self::remove_on_disk(&platform, &state));
            return Err(JobletError::already_exists("volume", name));
        }
        volumes.insert(name.clone(), state);
        metrics::set_active_volumes(volumes.len() as i64);
        info!(volume = %name, "Volume created");
        Ok(volume)
    }

    async fn list(&self) -> Vec<Volume> {
        let volumes = self.volumes.read().await;
        let mut result: Vec<Volume> = volumes.values().map(VolumeState::to_volume).collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }

    async fn get(&self, name: &VolumeName) -> Result<Volume, JobletError> {
        let volumes = self.volumes.read().await;
        volumes
            .get(name)
            .map(VolumeState::to_volume)
            .ok_or_else(|| JobletError::not_found("volume", name))
    }

    async fn remove(&self, name: &VolumeName) -> Result<(), JobletError> {
        let state = {
            let mut volumes = self.volumes.write().await;
            let state = volumes
                .get(name)
                .ok_or_else(|| JobletError::not_found("volume", name))?;
            if !state.attached.is_empty() {
                return Err(JobletError::conflict(format!(
                    "volume {name} is attached to {} job(s)",
                    state.attached.len()
                )));
            }
            let state = volumes.remove(name).unwrap();
            metrics::set_active_volumes(volumes.len() as i64);
            state
        };

        let platform = self.platform.clone();
        tokio::task::spawn_blocking(move || Self::remove_on_disk(&platform, &state))
            .await
            .map_err(|err| JobletError::infrastructure(format!("volume worker panicked: {err}")))?;
        info!(volume = %name, "Volume removed");
        Ok(())
    }

    async fn attach(
        &self,
        names: &[VolumeName],
        job_id: &JobId,
    ) -> Result<Vec<(String, PathBuf)>, JobletError> {
        let mut volumes = self.volumes.write().await;
        for name in names {
            if !volumes.contains_key(name) {
                return Err(JobletError::not_found("volume", name)
                    .with_context("job_id", job_id)
                    .with_context("operation", "attach"));
            }
        }
        let mut mounts = Vec::with_capacity(names.len());
        for name in names {
            let state = volumes.get_mut(name).unwrap();
            state.attached.insert(*job_id);
            mounts.push((name.to_string(), state.data_path()));
        }
        Ok(mounts)
    }

    async fn detach(&self, names: &[VolumeName], job_id: &JobId) {
        let mut volumes = self.volumes.write().await;
        for name in names {
            if let Some(state) = volumes.get_mut(name) {
                state.attached.remove(job_id);
            }
        }
    }

    async fn validate(&self, names: &[VolumeName]) -> Result<(), JobletError> {
        let volumes = self.volumes.read().await;
        for name in names {
            if !volumes.contains_key(name) {
                return Err(JobletError::not_found("volume", name));
            }
        }
        Ok(())
    }

    async fn usage(&self, name: &VolumeName) -> Result<(u64, u64), JobletError> {
        let data = {
            let volumes = self.volumes.read().await;
            volumes
                .get(name)
                .map(VolumeState::data_path)
                .ok_or_else(|| JobletError::not_found("volume", name))?
        };
        let usage = self.platform.fs_usage(&data)?;
        Ok((
            usage.total_bytes.saturating_sub(usage.available_bytes),
            usage.available_bytes,
        ))
    }

    async fn scan_on_startup(&self) -> Result<usize, JobletError> {
        if !self.platform.exists(&self.base_path) {
            self.platform.create_dir_all(&self.base_path)?;
            return Ok(0);
        }
        let mounted = self.platform.mounted_targets()?;
        let mut scanned = HashMap::new();
        for entry in self.platform.list_dir(&self.base_path)? {
            if !self.platform.exists(&entry.join(METADATA_FILE)) {
                continue;
            }
            match Self::scan_one(&self.platform, &entry, &mounted) {
                Ok(state) => {
                    scanned.insert(state.info.name.clone(), state);
                }
                Err(err) => {
                    warn!(dir = %entry.display(), %err, "Skipping unreadable volume directory");
                }
            }
        }
        let count = scanned.len();
        let mut volumes = self.volumes.write().await;
        *volumes = scanned;
        metrics::set_active_volumes(volumes.len() as i64);
        info!(count, "Volume scan complete");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakePlatform;
    use joblet_common::error::ErrorKind;
    use test_r::test;

    fn service() -> (Arc<FakePlatform>, VolumeServiceDefault) {
        let platform = Arc::new(FakePlatform::new());
        let service =
            VolumeServiceDefault::new(platform.clone(), PathBuf::from("/var/lib/joblet/volumes"));
        (platform, service)
    }

    fn name(value: &str) -> VolumeName {
        VolumeName::new(value).unwrap()
    }

    #[test]
    async fn filesystem_volume_creates_loop_backed_ext4() {
        let (platform, service) = service();
        let volume = service
            .create(&name("v1"), "1MB", VolumeType::Filesystem)
            .await
            .unwrap();
        assert_eq!(volume.size_bytes, 1024 * 1024);

        let dir = PathBuf::from("/var/lib/joblet/volumes/v1");
        assert!(platform.file_contents(&dir.join(METADATA_FILE)).is_some());
        let loop_info =
            String::from_utf8(platform.file_contents(&dir.join(LOOP_INFO_FILE)).unwrap()).unwrap();
        assert_eq!(
            loop_info,
            format!(
                "loop_device=/dev/loop0\nbacking_file={}\n",
                dir.join(IMAGE_FILE).display()
            )
        );
        assert!(platform.is_mounted(&dir.join("data")));
        assert_eq!(platform.mode_of(&dir.join("data")), Some(0o755));
    }

    #[test]
    async fn memory_volume_mounts_tmpfs() {
        let (platform, service) = service();
        service
            .create(&name("mem1"), "16MB", VolumeType::Memory)
            .await
            .unwrap();
        let ops = platform.operations();
        assert!(ops
            .iter()
            .any(|op| op == "mount_tmpfs /var/lib/joblet/volumes/mem1/data 16777216"));
    }

    #[test]
    async fn loop_failure_falls_back_to_plain_directory() {
        let (platform, service) = service();
        platform.fail_operation("attach_loop_device");
        let volume = service
            .create(&name("v2"), "1MB", VolumeType::Filesystem)
            .await
            .unwrap();
        assert_eq!(volume.size_bytes, 1024 * 1024);
        let dir = PathBuf::from("/var/lib/joblet/volumes/v2");
        assert!(platform.file_contents(&dir.join(LOOP_INFO_FILE)).is_none());
        assert!(platform.file_contents(&dir.join(IMAGE_FILE)).is_none());
    }

    #[test]
    async fn failed_creation_unwinds_every_step() {
        let (platform, service) = service();
        platform.fail_operation("make_ext4");
        let error = service
            .create(&name("v3"), "1MB", VolumeType::Filesystem)
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Infrastructure);
        assert!(!platform.exists(Path::new("/var/lib/joblet/volumes/v3")));
        assert_eq!(platform.loop_device_count(), 0);
    }

    #[test]
    async fn remove_requires_zero_refcount_and_leaves_no_residue() {
        let (platform, service) = service();
        let volume_name = name("v4");
        service
            .create(&volume_name, "2MB", VolumeType::Filesystem)
            .await
            .unwrap();

        let job_id = JobId::new_v4();
        service
            .attach(std::slice::from_ref(&volume_name), &job_id)
            .await
            .unwrap();
        let error = service.remove(&volume_name).await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Conflict);

        service.detach(std::slice::from_ref(&volume_name), &job_id).await;
        service.remove(&volume_name).await.unwrap();
        assert!(!platform.exists(Path::new("/var/lib/joblet/volumes/v4")));
        assert_eq!(platform.loop_device_count(), 0);
        assert_eq!(
            service.get(&volume_name).await.unwrap_err().kind,
            ErrorKind::NotFound
        );
    }

    #[test]
    async fn attach_is_all_or_nothing() {
        let (_platform, service) = service();
        let present = name("v5");
        service
            .create(&present, "1MB", VolumeType::Filesystem)
            .await
            .unwrap();

        let job_id = JobId::new_v4();
        let error = service
            .attach(&[present.clone(), name("missing")], &job_id)
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::NotFound);
        assert_eq!(service.get(&present).await.unwrap().refcount, 0);
    }

    #[test]
    async fn scan_rebuilds_the_registry_and_remounts_tmpfs() {
        let (platform, service) = service();
        service
            .create(&name("disk1"), "1MB", VolumeType::Filesystem)
            .await
            .unwrap();
        service
            .create(&name("mem2"), "8MB", VolumeType::Memory)
            .await
            .unwrap();

        // Simulate a restart: the tmpfs mount is gone, the files stay.
        platform
            .unmount(Path::new("/var/lib/joblet/volumes/mem2/data"), true)
            .unwrap();
        let fresh =
            VolumeServiceDefault::new(platform.clone(), PathBuf::from("/var/lib/joblet/volumes"));
        let count = fresh.scan_on_startup().await.unwrap();
        assert_eq!(count, 2);
        assert!(platform.is_mounted(Path::new("/var/lib/joblet/volumes/mem2/data")));
        assert_eq!(
            fresh.get(&name("disk1")).await.unwrap().size_bytes,
            1024 * 1024
        );
    }
}
