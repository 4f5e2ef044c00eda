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

use super::ApiError;
use crate::logs::LogRouter;
use crate::services::executor::JobExecutor;
use crate::services::job_store::JobStore;
use crate::services::monitor::MonitorService;
use joblet_common::model::{Job, JobFilter, JobId, JobSpec, LogChunk, MetricSample};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub struct JobsApi {
    executor: Arc<dyn JobExecutor>,
    store: Arc<dyn JobStore>,
    logs: Arc<LogRouter>,
    monitor: Arc<MonitorService>,
}

impl JobsApi {
    pub fn new(
        executor: Arc<dyn JobExecutor>,
        store: Arc<dyn JobStore>,
        logs: Arc<LogRouter>,
        monitor: Arc<MonitorService>,
    ) -> Self {
        JobsApi {
            executor,
            store,
            logs,
            monitor,
        }
    }

    pub async fn start_job(&self, spec: JobSpec) -> Result<Job, ApiError> {
        Ok(self.executor.start_job(spec).await?)
    }

    pub async fn stop_job(
        &self,
        id: &JobId,
        force: bool,
        reason: Option<String>,
    ) -> Result<Job, ApiError> {
        Ok(self.executor.stop_job(id, force, reason).await?)
    }

    pub async fn delete_job(&self, id: &JobId) -> Result<(), ApiError> {
        Ok(self.executor.delete_job(id).await?)
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Job, ApiError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, ApiError> {
        Ok(self.store.list(&filter).await)
    }

    /// Replay-then-stream; the stream ends when the job's log topic is
    /// finished and drained.
    pub async fn stream_logs(&self, id: &JobId) -> Result<ReceiverStream<LogChunk>, ApiError> {
        self.store.get(id).await?;
        Ok(ReceiverStream::new(self.logs.subscribe(*id)))
    }

    /// Live metric samples for one job.
    pub async fn stream_metrics(
        &self,
        id: &JobId,
    ) -> Result<ReceiverStream<MetricSample>, ApiError> {
        self.store.get(id).await?;
        let mut all = self.monitor.subscribe();
        let (sender, receiver) = mpsc::channel(64);
        let job_id = *id;
        tokio::spawn(async move {
            while let Some(sample) = all.recv().await {
                let matches = matches!(&sample, MetricSample::Job(m) if m.job_id == job_id);
                if matches && sender.send(sample).await.is_err() {
                    return;
                }
            }
        });
        Ok(ReceiverStream::new(receiver))
    }
}
