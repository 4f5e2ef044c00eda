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

//! Periodic resource sampler: per-job cgroup statistics and
//! system-wide metrics, fanned out as [`MetricSample`] events.

use crate::cgroup::CgroupBuilder;
use crate::events::EventBus;
use crate::metrics;
use crate::services::job_store::JobStore;
use chrono::Utc;
use joblet_common::model::{
    DiskStats, InterfaceStats, JobFilter, JobId, JobMetrics, JobStatus, MetricSample,
    ProcessStats, SystemMetrics,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Disks, Networks, ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub top_processes: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings {
            interval: Duration::from_millis(1000),
            top_processes: 10,
        }
    }
}

pub struct MonitorService {
    bus: Arc<EventBus<MetricSample>>,
}

struct Sampler {
    store: Arc<dyn JobStore>,
    cgroups: Arc<CgroupBuilder>,
    bus: Arc<EventBus<MetricSample>>,
    settings: MonitorSettings,
    system: System,
    disks: Disks,
    networks: Networks,
    /// Last observed `usage_usec` per job, with its wall-clock instant.
    previous_cpu: HashMap<JobId, (u64, Instant)>,
}

impl Sampler {
    async fn sample_once(&mut self) {
        let started = Instant::now();
        let now = Utc::now();

        let running = self
            .store
            .list(&JobFilter {
                statuses: vec![JobStatus::Running],
                name: None,
            })
            .await;
        self.previous_cpu
            .retain(|id, _| running.iter().any(|job| job.id == *id));

        for job in &running {
            let Some(cgroup_path) = &job.cgroup_path else {
                continue;
            };
            let usage = match self.cgroups.read_cpu_usage_usec(cgroup_path) {
                Ok(usage) => usage,
                Err(err) => {
                    debug!(job_id = %job.id, %err, "Skipping job sample");
                    continue;
                }
            };
            let sampled_at = Instant::now();
            let cpu_percent = match self.previous_cpu.insert(job.id, (usage, sampled_at)) {
                Some((previous_usage, previous_at)) => {
                    let wall_usec = sampled_at.duration_since(previous_at).as_micros() as u64;
                    if wall_usec == 0 {
                        0.0
                    } else {
                        usage.saturating_sub(previous_usage) as f64 / wall_usec as f64 * 100.0
                    }
                }
                None => 0.0,
            };
            let memory_current = self.cgroups.read_memory_current(cgroup_path).unwrap_or(0);
            let memory_peak = self.cgroups.read_memory_peak(cgroup_path).unwrap_or(0);
            let (io_read, io_write) = self.cgroups.read_io_totals(cgroup_path).unwrap_or((0, 0));

            self.bus.publish(MetricSample::Job(JobMetrics {
                job_id: job.id,
                at: now,
                cpu_percent,
                memory_current_bytes: memory_current,
                memory_peak_bytes: memory_peak,
                io_read_bytes: io_read,
                io_write_bytes: io_write,
                gpu_percent: None,
            }));
        }

        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        self.disks.refresh(true);
        self.networks.refresh(true);

        let mut top: Vec<ProcessStats> = self
            .system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessStats {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().to_string(),
                cpu_percent: process.cpu_usage(),
                memory_bytes: process.memory(),
            })
            .collect();
        top.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent));
        top.truncate(self.settings.top_processes);

        self.bus.publish(MetricSample::System(SystemMetrics {
            at: now,
            cpu_per_core: self.system.cpus().iter().map(|cpu| cpu.cpu_usage()).collect(),
            memory_total_bytes: self.system.total_memory(),
            memory_used_bytes: self.system.used_memory(),
            disks: self
                .disks
                .iter()
                .map(|disk| DiskStats {
                    mount_point: disk.mount_point().to_string_lossy().to_string(),
                    total_bytes: disk.total_space(),
                    available_bytes: disk.available_space(),
                })
                .collect(),
            interfaces: self
                .networks
                .iter()
                .map(|(name, data)| InterfaceStats {
                    name: name.clone(),
                    received_bytes: data.total_received(),
                    transmitted_bytes: data.total_transmitted(),
                })
                .collect(),
            top_processes: top,
        }));

        metrics::observe_monitor_sample_seconds(started.elapsed().as_secs_f64());
    }
}

impl MonitorService {
    /// Spawns the sampling loop. Slow cycles skip ticks rather than
    /// queueing them; shutdown flushes one final sample.
    pub fn start(
        store: Arc<dyn JobStore>,
        cgroups: Arc<CgroupBuilder>,
        settings: MonitorSettings,
        shutdown: CancellationToken,
    ) -> (Arc<MonitorService>, JoinHandle<()>) {
        let bus = Arc::new(EventBus::default());
        let service = Arc::new(MonitorService { bus: bus.clone() });

        let handle = tokio::spawn(async move {
            let mut sampler = Sampler {
                store,
                cgroups,
                bus,
                settings: settings.clone(),
                system: System::new(),
                disks: Disks::new_with_refreshed_list(),
                networks: Networks::new_with_refreshed_list(),
                previous_cpu: HashMap::new(),
            };
            let mut ticker = tokio::time::interval(settings.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => sampler.sample_once().await,
                    _ = shutdown.cancelled() => {
                        sampler.sample_once().await;
                        info!("Monitor stopped after final flush");
                        return;
                    }
                }
            }
        });

        (service, handle)
    }

    pub fn subscribe(&self) -> mpsc::Receiver<MetricSample> {
        self.bus.subscribe()
    }
}
