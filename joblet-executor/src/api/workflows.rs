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
use crate::services::workflow::{parse_workflow_yaml, WorkflowService};
use joblet_common::model::{Workflow, WorkflowId, WorkflowSpec};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub struct WorkflowsApi {
    workflows: Arc<dyn WorkflowService>,
}

impl WorkflowsApi {
    pub fn new(workflows: Arc<dyn WorkflowService>) -> Self {
        WorkflowsApi { workflows }
    }

    pub async fn submit_workflow(&self, spec: WorkflowSpec) -> Result<Workflow, ApiError> {
        Ok(self.workflows.submit(spec).await?)
    }

    pub async fn submit_workflow_yaml(&self, yaml: &str) -> Result<Workflow, ApiError> {
        let spec = parse_workflow_yaml(yaml)?;
        Ok(self.workflows.submit(spec).await?)
    }

    pub async fn get_workflow(&self, id: &WorkflowId) -> Result<Workflow, ApiError> {
        Ok(self.workflows.get(id).await?)
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>, ApiError> {
        Ok(self.workflows.list().await)
    }

    pub async fn stop_workflow(&self, id: &WorkflowId) -> Result<Workflow, ApiError> {
        Ok(self.workflows.stop(id).await?)
    }

    /// Status snapshots for one workflow, starting with the current
    /// one.
    pub async fn stream_workflow_status(
        &self,
        id: &WorkflowId,
    ) -> Result<ReceiverStream<Workflow>, ApiError> {
        let current = self.workflows.get(id).await?;
        let mut all = self.workflows.subscribe_status();
        let (sender, receiver) = mpsc::channel(64);
        let workflow_id = *id;
        let _ = sender.send(current).await;
        tokio::spawn(async move {
            while let Some(snapshot) = all.recv().await {
                if snapshot.id == workflow_id && sender.send(snapshot).await.is_err() {
                    return;
                }
            }
        });
        Ok(ReceiverStream::new(receiver))
    }
}
