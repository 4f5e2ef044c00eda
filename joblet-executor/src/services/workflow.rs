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

//! Workflows: YAML specs parsed into DAGs of jobs, submitted as their
//! predecessors complete, with dependency-aware failure handling.

use crate::events::EventBus;
use crate::services::executor::JobExecutor;
use crate::services::job_store::JobStore;
use async_trait::async_trait;
use chrono::Utc;
use joblet_common::error::JobletError;
use joblet_common::model::{
    JobEvent, JobId, JobName, JobSpec, JobStatus, Workflow, WorkflowId, WorkflowJobSpec,
    WorkflowJobState, WorkflowSpec, WorkflowStatus,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub fn parse_workflow_yaml(text: &str) -> Result<WorkflowSpec, JobletError> {
    serde_yaml::from_str(text)
        .map_err(|err| JobletError::validation(format!("invalid workflow spec: {err}")))
}

/// Rejects unknown predecessors and cycles; returns a topological
/// order as a side effect of Kahn's algorithm.
pub fn validate_dag(spec: &WorkflowSpec) -> Result<(), JobletError> {
    if spec.jobs.is_empty() {
        return Err(JobletError::validation("workflow has no jobs"));
    }
    for (name, job) in &spec.jobs {
        JobName::new(name.as_str())
            .map_err(|err| JobletError::validation(format!("invalid node name {name:?}: {err}")))?;
        if job.command.is_empty() {
            return Err(JobletError::validation(format!(
                "node {name:?} has an empty command"
            )));
        }
        for required in &job.requires {
            if !spec.jobs.contains_key(required) {
                return Err(JobletError::validation(format!(
                    "node {name:?} requires unknown node {required:?}"
                )));
            }
            if required == name {
                return Err(JobletError::validation(format!(
                    "node {name:?} requires itself"
                )));
            }
        }
    }

    let mut in_degree: BTreeMap<&str, usize> = spec
        .jobs
        .iter()
        .map(|(name, job)| (name.as_str(), job.requires.len()))
        .collect();
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut visited = 0;
    while let Some(ready) = queue.pop_front() {
        visited += 1;
        for (name, job) in &spec.jobs {
            if job.requires.iter().any(|r| r == ready) {
                let degree = in_degree.get_mut(name.as_str()).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(name);
                }
            }
        }
    }
    if visited != spec.jobs.len() {
        return Err(JobletError::validation("workflow contains a cycle"));
    }
    Ok(())
}

struct WorkflowState {
    workflow: Workflow,
    specs: BTreeMap<String, WorkflowJobSpec>,
    job_to_node: HashMap<JobId, String>,
}

#[async_trait]
pub trait WorkflowService: Send + Sync {
    async fn submit(&self, spec: WorkflowSpec) -> Result<Workflow, JobletError>;
    async fn get(&self, id: &WorkflowId) -> Result<Workflow, JobletError>;
    async fn list(&self) -> Vec<Workflow>;
    /// Stops every non-terminal node and marks the workflow `Stopped`.
    async fn stop(&self, id: &WorkflowId) -> Result<Workflow, JobletError>;
    /// Aggregated status snapshots, published on every change.
    fn subscribe_status(&self) -> mpsc::Receiver<Workflow>;
}

pub struct WorkflowServiceDefault {
    executor: Arc<dyn JobExecutor>,
    workflows: RwLock<HashMap<WorkflowId, WorkflowState>>,
    status_bus: EventBus<Workflow>,
}

impl WorkflowServiceDefault {
    pub fn new(executor: Arc<dyn JobExecutor>) -> Arc<Self> {
        Arc::new(WorkflowServiceDefault {
            executor,
            workflows: RwLock::new(HashMap::new()),
            status_bus: EventBus::default(),
        })
    }

    /// Feeds store events into workflow bookkeeping; run once at boot.
    pub fn start_event_loop(
        self: &Arc<Self>,
        store: Arc<dyn JobStore>,
        shutdown: CancellationToken,
    ) {
        let service = self.clone();
        let mut events = store.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(JobEvent::StatusChanged { job, .. }) => {
                            service.on_job_update(job.id, job.status).await;
                        }
                        Some(_) => {}
                        None => return,
                    },
                    _ = shutdown.cancelled() => return,
                }
            }
        });
    }

    fn node_job_spec(name: &str, node: &WorkflowJobSpec) -> Result<JobSpec, JobletError> {
        let limits = match &node.limits {
            Some(limits) => limits
                .to_limits()
                .map_err(|err| JobletError::validation(err.to_string()))?,
            None => Default::default(),
        };
        Ok(JobSpec {
            command: node.command.clone(),
            args: node.args.clone(),
            name: Some(JobName::new(name)?),
            limits,
            uploads: Vec::new(),
            volumes: node.volumes.clone(),
            network: node.network.clone(),
            runtime: node.runtime.clone(),
            env: node.env.clone(),
            secret_env: HashMap::new(),
            schedule: None,
        })
    }

    /// Submits every Pending node whose predecessors are all Completed.
    async fn submit_ready(&self, state: &mut WorkflowState) {
        if state.workflow.status.is_terminal() {
            return;
        }
        let ready: Vec<String> = state
            .workflow
            .jobs
            .iter()
            .filter(|(_, node)| node.status == JobStatus::Pending)
            .filter(|(_, node)| {
                node.requires.iter().all(|r| {
                    state
                        .workflow
                        .jobs
                        .get(r)
                        .map(|dep| dep.status == JobStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in ready {
            let spec = match Self::node_job_spec(&name, &state.specs[&name]) {
                Ok(spec) => spec,
                Err(err) => {
                    warn!(workflow = %state.workflow.id, node = %name, %err, "Node spec invalid");
                    state.workflow.jobs.get_mut(&name).unwrap().status = JobStatus::Failed;
                    continue;
                }
            };
            match self.executor.start_job(spec).await {
                Ok(job) => {
                    debug!(workflow = %state.workflow.id, node = %name, job_id = %job.id, "Node submitted");
                    state.job_to_node.insert(job.id, name.clone());
                    let node = state.workflow.jobs.get_mut(&name).unwrap();
                    node.job_id = Some(job.id);
                    node.status = job.status;
                }
                Err(err) => {
                    warn!(workflow = %state.workflow.id, node = %name, %err, "Node submission failed");
                    state.workflow.jobs.get_mut(&name).unwrap().status = JobStatus::Failed;
                }
            }
        }
    }

    /// Marks everything transitively requiring `failed_node` Canceled.
    fn cancel_dependents(workflow: &mut Workflow, failed_node: &str) {
        let mut canceled: HashSet<String> = HashSet::new();
        let mut frontier = vec![failed_node.to_string()];
        while let Some(current) = frontier.pop() {
            for (name, node) in workflow.jobs.iter() {
                if node.requires.contains(&current) && !canceled.contains(name) {
                    canceled.insert(name.clone());
                    frontier.push(name.clone());
                }
            }
        }
        for name in canceled {
            let node = workflow.jobs.get_mut(&name).unwrap();
            if node.status == JobStatus::Pending {
                node.status = JobStatus::Canceled;
            }
        }
    }

    fn recompute_status(workflow: &mut Workflow) {
        // Terminal workflow statuses are monotonic; node updates keep
        // flowing in, the aggregate never re-enters Running.
        if workflow.status.is_terminal() {
            return;
        }
        if workflow
            .jobs
            .values()
            .all(|node| node.status == JobStatus::Completed)
        {
            workflow.status = WorkflowStatus::Completed;
        } else if workflow
            .jobs
            .values()
            .any(|node| node.status == JobStatus::Failed)
        {
            workflow.status = WorkflowStatus::Failed;
        } else if workflow
            .jobs
            .values()
            .any(|node| node.status == JobStatus::Stopped)
        {
            workflow.status = WorkflowStatus::Stopped;
        }
    }

    async fn on_job_update(&self, job_id: JobId, status: JobStatus) {
        let mut workflows = self.workflows.write().await;
        let Some(state) = workflows
            .values_mut()
            .find(|state| state.job_to_node.contains_key(&job_id))
        else {
            return;
        };
        let node_name = state.job_to_node[&job_id].clone();
        state.workflow.jobs.get_mut(&node_name).unwrap().status = status;

        match status {
            JobStatus::Completed => {
                self.submit_ready(state).await;
            }
            JobStatus::Failed | JobStatus::Stopped | JobStatus::Canceled => {
                Self::cancel_dependents(&mut state.workflow, &node_name);
            }
            _ => {}
        }
        Self::recompute_status(&mut state.workflow);
        self.status_bus.publish(state.workflow.clone());
    }
}

#[async_trait]
impl WorkflowService for WorkflowServiceDefault {
    async fn submit(&self, spec: WorkflowSpec) -> Result<Workflow, JobletError> {
        validate_dag(&spec)?;

        let id = WorkflowId::new_v4();
        let workflow = Workflow {
            id,
            status: WorkflowStatus::Running,
            jobs: spec
                .jobs
                .iter()
                .map(|(name, node)| {
                    (
                        name.clone(),
                        WorkflowJobState {
                            requires: node.requires.clone(),
                            job_id: None,
                            status: JobStatus::Pending,
                        },
                    )
                })
                .collect(),
            created_at: Utc::now(),
        };
        let state = WorkflowState {
            workflow,
            specs: spec.jobs,
            job_to_node: HashMap::new(),
        };

        // Register first, then submit under the same lock: completions
        // of fast nodes must find the workflow in the registry.
        let mut workflows = self.workflows.write().await;
        workflows.insert(id, state);
        let state = workflows.get_mut(&id).unwrap();
        self.submit_ready(state).await;
        Self::recompute_status(&mut state.workflow);
        let snapshot = state.workflow.clone();
        drop(workflows);

        info!(workflow = %id, nodes = snapshot.jobs.len(), "Workflow submitted");
        self.status_bus.publish(snapshot.clone());
        Ok(snapshot)
    }

    async fn get(&self, id: &WorkflowId) -> Result<Workflow, JobletError> {
        let workflows = self.workflows.read().await;
        workflows
            .get(id)
            .map(|state| state.workflow.clone())
            .ok_or_else(|| JobletError::not_found("workflow", id))
    }

    async fn list(&self) -> Vec<Workflow> {
        let workflows = self.workflows.read().await;
        let mut result: Vec<Workflow> = workflows
            .values()
            .map(|state| state.workflow.clone())
            .collect();
        result.sort_by_key(|workflow| (workflow.created_at, workflow.id));
        result
    }

    async fn stop(&self, id: &WorkflowId) -> Result<Workflow, JobletError> {
        let to_stop: Vec<JobId> = {
            let mut workflows = self.workflows.write().await;
            let state = workflows
                .get_mut(id)
                .ok_or_else(|| JobletError::not_found("workflow", id))?;
            if state.workflow.status.is_terminal() {
                return Ok(state.workflow.clone());
            }
            state.workflow.status = WorkflowStatus::Stopped;
            for node in state.workflow.jobs.values_mut() {
                if node.status == JobStatus::Pending {
                    node.status = JobStatus::Canceled;
                }
            }
            state
                .workflow
                .jobs
                .values()
                .filter(|node| !node.status.is_terminal())
                .filter_map(|node| node.job_id)
                .collect()
        };

        for job_id in to_stop {
            if let Err(err) = self
                .executor
                .stop_job(&job_id, false, Some(format!("workflow {id} stopped")))
                .await
            {
                warn!(workflow = %id, job_id = %job_id, %err, "Failed to stop workflow node");
            }
        }
        let snapshot = self.get(id).await?;
        self.status_bus.publish(snapshot.clone());
        Ok(snapshot)
    }

    fn subscribe_status(&self) -> mpsc::Receiver<Workflow> {
        self.status_bus.subscribe()
    }
}
