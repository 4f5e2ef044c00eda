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

//! Job launch, stop and teardown. `start_job` returns once the job is
//! registered; the sandbox build continues on a background task and
//! later transitions are observed through the store's event bus.

use crate::cgroup::CgroupBuilder;
use crate::logs::LogRouter;
use crate::metrics;
use crate::platform::{NetworkAttachment, Platform, SandboxSpec, SpawnedChild};
use crate::services::job_store::JobStore;
use crate::services::network::NetworkService;
use crate::services::runtime::RuntimeService;
use crate::services::upload::{UploadService, UploadTransport};
use crate::services::volume::VolumeService;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use joblet_common::error::JobletError;
use joblet_common::model::{
    Job, JobId, JobSpec, JobStatus, LogOrigin, UploadEntry, VolumeName,
};
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub workspace_root: PathBuf,
    pub grace_period: Duration,
    pub preserve_workspaces: bool,
    pub run_as: Option<(u32, u32)>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        ExecutorSettings {
            workspace_root: PathBuf::from("/var/lib/joblet/jobs"),
            grace_period: Duration::from_secs(10),
            preserve_workspaces: false,
            run_as: None,
        }
    }
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Validates, registers and (unless scheduled) launches the job.
    /// Returns once the job is in the store; failures in the
    /// asynchronous launch surface as a `Failed` transition.
    async fn start_job(&self, spec: JobSpec) -> Result<Job, JobletError>;
    /// SIGTERM, bounded grace, then SIGKILL; `force` skips the grace
    /// period. Returns immediately, reaping is asynchronous.
    async fn stop_job(
        &self,
        id: &JobId,
        force: bool,
        reason: Option<String>,
    ) -> Result<Job, JobletError>;
    /// Permitted only in a terminal state; removes the store entry,
    /// the log buffer and the persistence record.
    async fn delete_job(&self, id: &JobId) -> Result<(), JobletError>;
    /// Runs a job already in `Scheduled` now.
    async fn execute_scheduled_job(&self, id: &JobId) -> Result<(), JobletError>;
}

/// Everything allocated so far for one launch; released in reverse on
/// failure and after the terminal reap.
#[derive(Default)]
struct LaunchArtifacts {
    volumes: Vec<VolumeName>,
    attachment: Option<NetworkAttachment>,
    cgroup_path: Option<PathBuf>,
    workspace: Option<PathBuf>,
    transport: Option<Arc<UploadTransport>>,
    child_pid: Option<u32>,
}

pub struct JobExecutorDefault {
    platform: Arc<dyn Platform>,
    store: Arc<dyn JobStore>,
    volumes: Arc<dyn VolumeService>,
    networks: Arc<dyn NetworkService>,
    runtimes: Arc<dyn RuntimeService>,
    uploads: Arc<dyn UploadService>,
    cgroups: Arc<CgroupBuilder>,
    logs: Arc<LogRouter>,
    settings: ExecutorSettings,
    /// Upload payloads staged between submit and streaming; the store
    /// keeps jobs shallow on purpose.
    pending_uploads: DashMap<JobId, Vec<UploadEntry>>,
    /// Jobs with a stop in flight, and why; consulted by the reaper.
    stopping: DashMap<JobId, String>,
    scheduler_notify: Arc<Notify>,
    shutdown: CancellationToken,
    self_handle: Weak<JobExecutorDefault>,
}

impl JobExecutorDefault {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        platform: Arc<dyn Platform>,
        store: Arc<dyn JobStore>,
        volumes: Arc<dyn VolumeService>,
        networks: Arc<dyn NetworkService>,
        runtimes: Arc<dyn RuntimeService>,
        uploads: Arc<dyn UploadService>,
        cgroups: Arc<CgroupBuilder>,
        logs: Arc<LogRouter>,
        settings: ExecutorSettings,
        scheduler_notify: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| JobExecutorDefault {
            platform,
            store,
            volumes,
            networks,
            runtimes,
            uploads,
            cgroups,
            logs,
            settings,
            pending_uploads: DashMap::new(),
            stopping: DashMap::new(),
            scheduler_notify,
            shutdown,
            self_handle: weak.clone(),
        })
    }

    fn arc_self(&self) -> Result<Arc<Self>, JobletError> {
        self.self_handle
            .upgrade()
            .ok_or_else(|| JobletError::unknown("executor is shutting down"))
    }

    fn workspace_dir(&self, id: &JobId) -> PathBuf {
        self.settings.workspace_root.join(id.to_string())
    }

    async fn unwind_launch(&self, id: &JobId, artifacts: LaunchArtifacts) {
        if let Some(pid) = artifacts.child_pid {
            let _ = self.platform.kill_process_group(pid, true);
        }
        if let Some(transport) = &artifacts.transport {
            transport.close();
        }
        if let Some(path) = &artifacts.cgroup_path {
            let cgroups = self.cgroups.clone();
            let path = path.clone();
            let _ = tokio::task::spawn_blocking(move || cgroups.destroy(&path)).await;
        }
        if let Some(attachment) = &artifacts.attachment {
            if let Err(err) = self.platform.teardown_job_network(attachment) {
                warn!(job_id = %id, %err, "Failed to tear down job network");
            }
            self.networks.release(id).await;
        }
        if !artifacts.volumes.is_empty() {
            self.volumes.detach(&artifacts.volumes, id).await;
        }
        if let Some(workspace) = &artifacts.workspace {
            if !self.settings.preserve_workspaces && self.platform.exists(workspace) {
                if let Err(err) = self.platform.remove_dir_all(workspace) {
                    warn!(job_id = %id, %err, "Failed to remove workspace");
                }
            }
        }
    }

    async fn fail_job(&self, id: &JobId, reason: String, artifacts: LaunchArtifacts) {
        warn!(job_id = %id, reason, "Job failed before exec");
        self.unwind_launch(id, artifacts).await;
        self.pending_uploads.remove(id);
        self.logs
            .publish(*id, LogOrigin::System, Bytes::from(reason.clone()));
        let result = self
            .store
            .update(
                id,
                Box::new(move |job| {
                    job.failure_reason = Some(reason);
                    job.transition(JobStatus::Failed, Utc::now()).map(|_| ())
                }),
            )
            .await;
        if let Err(err) = result {
            error!(job_id = %id, %err, "Failed to mark job as failed");
        }
        self.logs.finish(*id);
    }

    async fn cancel_job(&self, id: &JobId, reason: &str, artifacts: LaunchArtifacts) {
        self.unwind_launch(id, artifacts).await;
        self.pending_uploads.remove(id);
        let to = if self.stopping.remove(id).is_some() {
            JobStatus::Stopped
        } else {
            JobStatus::Canceled
        };
        let reason = reason.to_string();
        let _ = self
            .store
            .update(
                id,
                Box::new(move |job| {
                    job.failure_reason = Some(reason);
                    job.transition(to, Utc::now()).map(|_| ())
                }),
            )
            .await;
        self.logs.finish(*id);
    }

    /// Steps 5..12 of the launch sequence; runs on a background task.
    /// Volumes were already attached at submit time.
    async fn launch_running(self: Arc<Self>, job: Job, started: Instant) {
        let id = job.id;
        let mut artifacts = LaunchArtifacts {
            volumes: job.volumes.clone(),
            ..LaunchArtifacts::default()
        };

        // Step 5: network allocation.
        let attachment = match self.networks.attach(job.network.as_ref(), &id).await {
            Ok(attachment) => attachment,
            Err(err) => {
                return self
                    .fail_job(&id, format!("network attach failed: {err}"), artifacts)
                    .await
            }
        };
        artifacts.attachment = Some(attachment.clone());

        // Runtime resolution is deferred to launch so that `latest`
        // means latest at execution time.
        let runtime_mount = match &job.runtime {
            Some(spec) => match self.runtimes.resolve(spec).await {
                Ok(runtime) => Some(runtime.path),
                Err(err) => {
                    return self
                        .fail_job(&id, format!("runtime resolution failed: {err}"), artifacts)
                        .await
                }
            },
            None => None,
        };

        // Step 6: cgroup.
        let cgroup_path = match self.cgroups.create(&id, &job.limits) {
            Ok(path) => path,
            Err(err) => {
                return self
                    .fail_job(&id, format!("cgroup setup failed: {err}"), artifacts)
                    .await
            }
        };
        artifacts.cgroup_path = Some(cgroup_path.clone());

        // The chroot is assembled from this directory.
        let workspace = self.workspace_dir(&id);
        artifacts.workspace = Some(workspace.clone());
        if let Err(err) = self
            .platform
            .create_dir_all(&workspace.join("work"))
            .and_then(|_| self.platform.create_dir_all(&workspace.join("volumes")))
        {
            return self
                .fail_job(&id, format!("workspace setup failed: {err}"), artifacts)
                .await;
        }

        let mut volume_mounts = Vec::with_capacity(job.volumes.len());
        for name in &job.volumes {
            match self.volumes.get(name).await {
                Ok(volume) => volume_mounts.push((name.to_string(), volume.path.join("data"))),
                Err(err) => {
                    return self
                        .fail_job(&id, format!("volume lookup failed: {err}"), artifacts)
                        .await
                }
            }
        }

        // Step 7: upload session and transport.
        let staged = self
            .pending_uploads
            .remove(&id)
            .map(|(_, entries)| entries)
            .unwrap_or_default();
        let upload = if staged.is_empty() {
            None
        } else {
            let session = match self.uploads.prepare(id, staged, job.limits.memory) {
                Ok(session) => session,
                Err(err) => {
                    return self
                        .fail_job(&id, format!("upload validation failed: {err}"), artifacts)
                        .await
                }
            };
            let transport = match self.uploads.provision(&session, &workspace) {
                Ok(transport) => Arc::new(transport),
                Err(err) => {
                    return self
                        .fail_job(&id, format!("upload transport failed: {err}"), artifacts)
                        .await
                }
            };
            artifacts.transport = Some(transport.clone());
            Some((session, transport))
        };

        if self.shutdown.is_cancelled() || self.stopping.contains_key(&id) {
            return self
                .cancel_job(&id, "canceled before exec", artifacts)
                .await;
        }

        let mut env = job.env.clone();
        env.extend(job.secret_env.clone());
        let sandbox = SandboxSpec {
            job_id: id,
            command: job.command.clone(),
            args: job.args.clone(),
            env,
            root_dir: workspace.clone(),
            volume_mounts,
            runtime_mount,
            network: attachment.clone(),
            upload_pipe: upload
                .as_ref()
                .map(|(_, transport)| transport.pipe_path().to_path_buf()),
            run_as: self.settings.run_as,
        };

        // Step 8: fork into fresh namespaces.
        let spawned = {
            let platform = self.platform.clone();
            match tokio::task::spawn_blocking(move || platform.spawn_sandboxed(&sandbox)).await {
                Ok(Ok(spawned)) => spawned,
                Ok(Err(err)) => {
                    return self
                        .fail_job(&id, format!("fork failed: {err}"), artifacts)
                        .await
                }
                Err(err) => {
                    return self
                        .fail_job(&id, format!("fork worker panicked: {err}"), artifacts)
                        .await
                }
            }
        };
        let SpawnedChild {
            pid,
            stdout,
            stderr,
            handshake,
        } = spawned;
        artifacts.child_pid = Some(pid);

        // Bridged/isolated namespaces get their interfaces before go.
        let network_setup = {
            let platform = self.platform.clone();
            let attachment = attachment.clone();
            tokio::task::spawn_blocking(move || platform.setup_job_network(pid, &attachment))
                .await
                .unwrap_or_else(|err| Err(std::io::Error::other(err.to_string())))
        };
        if let Err(err) = network_setup {
            return self
                .fail_job(&id, format!("network setup failed: {err}"), artifacts)
                .await;
        }

        // Step 10: the streamer feeds the fifo while the child ingests.
        let streamer = upload.map(|(session, transport)| {
            let uploads = self.uploads.clone();
            tokio::spawn(async move { uploads.stream(session, transport).await })
        });

        // Step 11: ready -> cgroup placement -> go.
        let handshake = {
            let mut handshake = handshake;
            match tokio::task::spawn_blocking(move || handshake.wait_ready().map(|_| handshake))
                .await
            {
                Ok(Ok(handshake)) => handshake,
                Ok(Err(err)) => {
                    if let Some(streamer) = &streamer {
                        streamer.abort();
                    }
                    return self
                        .fail_job(&id, format!("sandbox setup failed: {err}"), artifacts)
                        .await;
                }
                Err(err) => {
                    return self
                        .fail_job(&id, format!("handshake worker panicked: {err}"), artifacts)
                        .await
                }
            }
        };
        if let Err(err) = self.cgroups.add_process(&cgroup_path, pid) {
            return self
                .fail_job(&id, format!("cgroup placement failed: {err}"), artifacts)
                .await;
        }
        let go = tokio::task::spawn_blocking({
            let mut handshake = handshake;
            move || handshake.send_go()
        })
        .await
        .unwrap_or_else(|err| Err(std::io::Error::other(err.to_string())));
        if let Err(err) = go {
            return self
                .fail_job(&id, format!("go signal failed: {err}"), artifacts)
                .await;
        }

        if let Some(streamer) = streamer {
            match streamer.await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    debug!(job_id = %id, %err, "Upload streamer failed");
                    return self
                        .fail_job(&id, "upload failed".to_string(), artifacts)
                        .await;
                }
                Err(err) if err.is_cancelled() => {
                    return self.cancel_job(&id, "upload canceled", artifacts).await
                }
                Err(err) => {
                    return self
                        .fail_job(&id, format!("upload streamer panicked: {err}"), artifacts)
                        .await
                }
            }
        }

        // Step 12: Running, with pid and cgroup path recorded.
        let cgroup_for_store = cgroup_path.clone();
        let transition = self
            .store
            .update(
                &id,
                Box::new(move |job| {
                    job.pid = Some(pid);
                    job.cgroup_path = Some(cgroup_for_store);
                    job.transition(JobStatus::Running, Utc::now()).map(|_| ())
                }),
            )
            .await;
        if let Err(err) = transition {
            return self
                .fail_job(&id, format!("running transition failed: {err}"), artifacts)
                .await;
        }
        metrics::observe_start_job_seconds(started.elapsed().as_secs_f64());
        info!(job_id = %id, pid, "Job running");

        // A stop that raced the launch lands here: the process exists
        // now, so enforce it.
        if self.stopping.contains_key(&id) {
            let _ = self.platform.kill_process_group(pid, true);
        }

        self.spawn_output_reader(id, LogOrigin::Stdout, stdout);
        self.spawn_output_reader(id, LogOrigin::Stderr, stderr);
        self.spawn_reaper(id, pid, artifacts);
    }

    fn spawn_output_reader(&self, id: JobId, origin: LogOrigin, mut stream: Box<dyn Read + Send>) {
        let logs = self.logs.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => logs.publish(id, origin, Bytes::copy_from_slice(&buf[..n])),
                    Err(err) => {
                        debug!(job_id = %id, ?origin, %err, "Output reader stopped");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_reaper(self: &Arc<Self>, id: JobId, pid: u32, artifacts: LaunchArtifacts) {
        let executor = self.clone();
        tokio::spawn(async move {
            let platform = executor.platform.clone();
            let exit = tokio::task::spawn_blocking(move || platform.wait_child(pid)).await;
            let exit = match exit {
                Ok(Ok(exit)) => exit,
                Ok(Err(err)) => {
                    error!(job_id = %id, %err, "wait_child failed");
                    return;
                }
                Err(err) => {
                    error!(job_id = %id, %err, "Reaper worker panicked");
                    return;
                }
            };

            let code = exit.code();
            let stopped = executor.stopping.remove(&id);
            let status = if stopped.is_some() {
                JobStatus::Stopped
            } else if code == 0 {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
            let reason = match (&stopped, status) {
                (Some((_, reason)), _) => Some(reason.clone()),
                (None, JobStatus::Failed) => Some(match exit.signal {
                    Some(signal) => format!("terminated by signal {signal}"),
                    None => format!("exited with code {code}"),
                }),
                _ => None,
            };

            let result = executor
                .store
                .update(
                    &id,
                    Box::new(move |job| {
                        job.exit_code = Some(code);
                        job.failure_reason = reason;
                        job.transition(status, Utc::now()).map(|_| ())
                    }),
                )
                .await;
            if let Err(err) = result {
                error!(job_id = %id, %err, "Terminal transition failed");
            }
            info!(job_id = %id, code, %status, "Job reaped");

            executor.logs.publish(
                id,
                LogOrigin::System,
                Bytes::from(format!("job finished with exit code {code}")),
            );
            executor.logs.finish(id);
            // Same artifact set as the failure unwind, minus the
            // already-reaped child.
            let mut artifacts = artifacts;
            artifacts.child_pid = None;
            executor.unwind_launch(&id, artifacts).await;
        });
    }
}

#[async_trait]
impl JobExecutor for JobExecutorDefault {
    async fn start_job(&self, spec: JobSpec) -> Result<Job, JobletError> {
        let started = Instant::now();

        // Step 1: build and validate the limit value objects; nothing
        // is allocated yet. Volume, runtime and upload problems belong
        // to their own steps and fail the registered job instead.
        if spec.command.is_empty() {
            return Err(JobletError::validation("command must not be empty"));
        }
        spec.limits
            .validate()
            .map_err(|err| JobletError::validation(err.to_string()))?;
        self.cgroups.cross_validate(&spec.limits)?;

        // Step 2: allocate the id, register, move to Initializing.
        let id = JobId::new_v4();
        let job = Job::create(id, &spec, Utc::now());
        self.store.create(job).await?;
        if !spec.uploads.is_empty() {
            self.pending_uploads.insert(id, spec.uploads.clone());
        }
        let job = self.store.transition(&id, JobStatus::Initializing).await?;

        // Step 3: validate volumes exist and attach (refcount++); the
        // registered job is failed and kept for inspection.
        if let Err(err) = self.volumes.attach(&spec.volumes, &id).await {
            self.fail_job(
                &id,
                format!("volume attach failed: {err}"),
                LaunchArtifacts::default(),
            )
            .await;
            return Err(err);
        }

        // Scheduled jobs park here; the scheduler resumes from step 5.
        if let Some(at) = job.scheduled_time {
            if at > Utc::now() {
                let scheduled = self.store.transition(&id, JobStatus::Scheduled).await?;
                self.scheduler_notify.notify_one();
                info!(job_id = %id, scheduled_for = %at, "Job scheduled");
                return Ok(scheduled);
            }
        }

        let this = self.arc_self()?;
        tokio::spawn(this.launch_running(job.clone(), started));
        Ok(job)
    }

    async fn stop_job(
        &self,
        id: &JobId,
        force: bool,
        reason: Option<String>,
    ) -> Result<Job, JobletError> {
        let job = self.store.get(id).await?;
        let reason = reason.unwrap_or_else(|| "stopped by request".to_string());
        match job.status {
            JobStatus::Running => {
                let pid = job
                    .pid
                    .ok_or_else(|| JobletError::unknown(format!("running job {id} has no pid")))?;
                self.stopping.insert(*id, reason);
                self.platform
                    .kill_process_group(pid, force)
                    .map_err(|err| JobletError::from(err).with_context("job_id", id))?;
                if !force {
                    let platform = self.platform.clone();
                    let grace = self.settings.grace_period;
                    let job_id = *id;
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        if platform.process_exists(pid) {
                            warn!(job_id = %job_id, pid, "Grace period expired; sending SIGKILL");
                            let _ = platform.kill_process_group(pid, true);
                        }
                    });
                }
                Ok(job)
            }
            JobStatus::Scheduled => {
                self.volumes.detach(&job.volumes, id).await;
                let stopped = self
                    .store
                    .update(
                        id,
                        Box::new(move |job| {
                            job.failure_reason = Some(reason);
                            job.transition(JobStatus::Stopped, Utc::now()).map(|_| ())
                        }),
                    )
                    .await?;
                self.pending_uploads.remove(id);
                self.logs.finish(*id);
                self.scheduler_notify.notify_one();
                Ok(stopped)
            }
            JobStatus::Initializing => {
                // No process yet; the launch path observes the flag and
                // unwinds into Stopped.
                self.stopping.insert(*id, reason);
                Ok(job)
            }
            status if status.is_terminal() => Err(JobletError::conflict(format!(
                "job {id} is already {status}"
            ))),
            status => Err(JobletError::conflict(format!(
                "job {id} cannot be stopped while {status}"
            ))),
        }
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), JobletError> {
        self.store.delete(id).await?;
        self.logs.remove(*id);
        self.pending_uploads.remove(id);
        let workspace = self.workspace_dir(id);
        if self.platform.exists(&workspace) {
            if let Err(err) = self.platform.remove_dir_all(&workspace) {
                warn!(job_id = %id, %err, "Failed to remove workspace on delete");
            }
        }
        info!(job_id = %id, "Job deleted");
        Ok(())
    }

    async fn execute_scheduled_job(&self, id: &JobId) -> Result<(), JobletError> {
        let job = self.store.get(id).await?;
        if job.status != JobStatus::Scheduled {
            return Err(JobletError::conflict(format!(
                "job {id} is {}; expected Scheduled",
                job.status
            )));
        }
        let this = self.arc_self()?;
        tokio::spawn(this.launch_running(job, Instant::now()));
        Ok(())
    }
}
