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

//! Single-task scheduler: wakes at the earliest due time and hands the
//! job back to the executor. Late wakes fire immediately.

use crate::services::executor::JobExecutor;
use crate::services::job_store::JobStore;
use chrono::Utc;
use joblet_common::model::{JobFilter, JobId, JobStatus};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct SchedulerService;

impl SchedulerService {
    /// `notify` is poked by the executor whenever a new schedule lands
    /// or a scheduled job is stopped.
    pub fn start(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn JobExecutor>,
        notify: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let scheduled_filter = JobFilter {
                statuses: vec![JobStatus::Scheduled],
                name: None,
            };
            // Jobs already handed to the executor; they stay Scheduled
            // until their Running transition, so the list would hand
            // them out twice otherwise.
            let mut dispatched: HashSet<JobId> = HashSet::new();

            loop {
                if shutdown.is_cancelled() {
                    debug!("Scheduler stopped");
                    return;
                }

                let scheduled = store.list(&scheduled_filter).await;
                dispatched.retain(|id| scheduled.iter().any(|job| job.id == *id));
                let next = scheduled
                    .iter()
                    .filter(|job| !dispatched.contains(&job.id))
                    .filter_map(|job| job.scheduled_time.map(|at| (at, job.id)))
                    .min();

                match next {
                    None => {
                        tokio::select! {
                            _ = notify.notified() => {}
                            _ = shutdown.cancelled() => {}
                        }
                    }
                    Some((at, id)) => {
                        let now = Utc::now();
                        if at <= now {
                            debug!(job_id = %id, "Scheduled job is due");
                            dispatched.insert(id);
                            if let Err(err) = executor.execute_scheduled_job(&id).await {
                                warn!(job_id = %id, %err, "Failed to execute scheduled job");
                            }
                        } else {
                            let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
                            tokio::select! {
                                _ = tokio::time::sleep(wait) => {}
                                _ = notify.notified() => {}
                                _ = shutdown.cancelled() => {}
                            }
                        }
                    }
                }
            }
        })
    }
}
