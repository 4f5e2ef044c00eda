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

//! The authoritative in-memory job registry: the single funnel through
//! which every state transition is observed, published and persisted.

use crate::events::EventBus;
use crate::metrics;
use crate::services::persistence::PersistenceService;
use async_trait::async_trait;
use chrono::Utc;
use joblet_common::error::JobletError;
use joblet_common::model::{Job, JobEvent, JobFilter, JobId, JobStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

pub type JobMutator = Box<dyn FnOnce(&mut Job) -> Result<(), JobletError> + Send>;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Fails with `AlreadyExists` on a duplicate id.
    async fn create(&self, job: Job) -> Result<Job, JobletError>;
    async fn get(&self, id: &JobId) -> Result<Job, JobletError>;
    /// Applies `mutator` atomically and returns the new snapshot; a
    /// failing mutator leaves the stored job untouched.
    async fn update(&self, id: &JobId, mutator: JobMutator) -> Result<Job, JobletError>;
    async fn transition(&self, id: &JobId, to: JobStatus) -> Result<Job, JobletError>;
    /// Permitted only in a terminal state.
    async fn delete(&self, id: &JobId) -> Result<(), JobletError>;
    async fn list(&self, filter: &JobFilter) -> Vec<Job>;
    fn subscribe(&self) -> mpsc::Receiver<JobEvent>;
    /// Quiet insert used by startup reconciliation; emits no event and
    /// is not echoed back to the persistence backend.
    async fn insert_reference(&self, job: Job);
}

pub struct JobStoreDefault {
    jobs: RwLock<HashMap<JobId, Job>>,
    events: EventBus<JobEvent>,
    persistence: Arc<PersistenceService>,
}

impl JobStoreDefault {
    pub fn new(persistence: Arc<PersistenceService>) -> Self {
        JobStoreDefault {
            jobs: RwLock::new(HashMap::new()),
            events: EventBus::default(),
            persistence,
        }
    }

    fn running_count(jobs: &HashMap<JobId, Job>) -> i64 {
        jobs.values()
            .filter(|job| job.status == JobStatus::Running)
            .count() as i64
    }
}

#[async_trait]
impl JobStore for JobStoreDefault {
    async fn create(&self, job: Job) -> Result<Job, JobletError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(JobletError::already_exists("job", job.id));
        }
        let snapshot = job.clone();
        jobs.insert(job.id, job);
        // Published under the write lock so per-job events stay ordered.
        self.events.publish(JobEvent::Created {
            job: snapshot.clone(),
            at: Utc::now(),
        });
        metrics::record_job_created();
        self.persistence.enqueue_upsert(&snapshot);
        Ok(snapshot)
    }

    async fn get(&self, id: &JobId) -> Result<Job, JobletError> {
        let jobs = self.jobs.read().await;
        jobs.get(id)
            .cloned()
            .ok_or_else(|| JobletError::not_found("job", id))
    }

    async fn update(&self, id: &JobId, mutator: JobMutator) -> Result<Job, JobletError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobletError::not_found("job", id))?;
        let previous = job.status;

        // Mutate a copy so a failing mutator cannot leave partial state.
        let mut candidate = job.clone();
        mutator(&mut candidate)?;
        *job = candidate.clone();

        if candidate.status != previous {
            debug!(job_id = %id, from = %previous, to = %candidate.status, "Job transition");
            metrics::record_job_transition(&candidate.status.to_string());
            metrics::set_running_jobs(Self::running_count(&jobs));
            self.events.publish(JobEvent::StatusChanged {
                job: candidate.clone(),
                previous,
                at: Utc::now(),
            });
        }
        self.persistence.enqueue_upsert(&candidate);
        Ok(candidate)
    }

    async fn transition(&self, id: &JobId, to: JobStatus) -> Result<Job, JobletError> {
        self.update(
            id,
            Box::new(move |job| job.transition(to, Utc::now()).map(|_| ())),
        )
        .await
    }

    async fn delete(&self, id: &JobId) -> Result<(), JobletError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get(id)
            .ok_or_else(|| JobletError::not_found("job", id))?;
        if !job.status.is_terminal() {
            return Err(JobletError::conflict(format!(
                "job {id} is {}; only terminal jobs can be deleted",
                job.status
            )));
        }
        jobs.remove(id);
        self.events.publish(JobEvent::Deleted {
            job_id: *id,
            at: Utc::now(),
        });
        self.persistence.enqueue_delete(*id);
        Ok(())
    }

    async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut result: Vec<Job> = jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        result.sort_by_key(|job| (job.created_at, job.id));
        result
    }

    fn subscribe(&self) -> mpsc::Receiver<JobEvent> {
        self.events.subscribe()
    }

    async fn insert_reference(&self, job: Job) {
        let mut jobs = self.jobs.write().await;
        jobs.entry(job.id).or_insert(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::persistence::InMemoryJobRepo;
    use joblet_common::error::ErrorKind;
    use joblet_common::model::JobSpec;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    use test_r::test;

    fn store() -> JobStoreDefault {
        let persistence = PersistenceService::start(
            Arc::new(InMemoryJobRepo::new()),
            64,
            Duration::from_secs(60),
            CancellationToken::new(),
        );
        JobStoreDefault::new(persistence)
    }

    fn new_job() -> Job {
        Job::create(
            JobId::new_v4(),
            &JobSpec::command("/bin/true", []),
            Utc::now(),
        )
    }

    #[test]
    async fn duplicate_create_fails_with_already_exists() {
        let store = store();
        let job = new_job();
        store.create(job.clone()).await.unwrap();
        let error = store.create(job).await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::AlreadyExists);
    }

    #[test]
    async fn illegal_transitions_leave_state_untouched() {
        let store = store();
        let job = store.create(new_job()).await.unwrap();
        store.transition(&job.id, JobStatus::Initializing).await.unwrap();

        let error = store
            .transition(&job.id, JobStatus::Completed)
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Conflict);
        assert_eq!(
            store.get(&job.id).await.unwrap().status,
            JobStatus::Initializing
        );
    }

    #[test]
    async fn events_are_emitted_in_order_per_job() {
        let store = store();
        let mut events = store.subscribe();
        let job = store.create(new_job()).await.unwrap();
        store.transition(&job.id, JobStatus::Initializing).await.unwrap();
        store.transition(&job.id, JobStatus::Running).await.unwrap();
        store.transition(&job.id, JobStatus::Completed).await.unwrap();
        store.delete(&job.id).await.unwrap();

        assert!(matches!(events.recv().await, Some(JobEvent::Created { .. })));
        match events.recv().await {
            Some(JobEvent::StatusChanged { job: j, previous, .. }) => {
                assert_eq!(previous, JobStatus::Pending);
                assert_eq!(j.status, JobStatus::Initializing);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match events.recv().await {
            Some(JobEvent::StatusChanged { job: j, previous, .. }) => {
                assert_eq!(previous, JobStatus::Initializing);
                assert_eq!(j.status, JobStatus::Running);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match events.recv().await {
            Some(JobEvent::StatusChanged { job: j, .. }) => {
                assert_eq!(j.status, JobStatus::Completed)
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(events.recv().await, Some(JobEvent::Deleted { .. })));
    }

    #[test]
    async fn delete_requires_a_terminal_state() {
        let store = store();
        let job = store.create(new_job()).await.unwrap();
        store.transition(&job.id, JobStatus::Initializing).await.unwrap();
        store.transition(&job.id, JobStatus::Running).await.unwrap();

        let error = store.delete(&job.id).await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Conflict);

        store.transition(&job.id, JobStatus::Completed).await.unwrap();
        store.delete(&job.id).await.unwrap();
        assert_eq!(
            store.get(&job.id).await.unwrap_err().kind,
            ErrorKind::NotFound
        );
    }

    #[test]
    async fn list_applies_the_filter() {
        let store = store();
        let a = store.create(new_job()).await.unwrap();
        let b = store.create(new_job()).await.unwrap();
        store.transition(&a.id, JobStatus::Initializing).await.unwrap();
        store.transition(&a.id, JobStatus::Running).await.unwrap();

        let running = store
            .list(&JobFilter {
                statuses: vec![JobStatus::Running],
                name: None,
            })
            .await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);

        let all = store.list(&JobFilter::default()).await;
        assert_eq!(all.len(), 2);
        let _ = b;
    }

    #[test]
    async fn mutator_failure_is_atomic() {
        let store = store();
        let job = store.create(new_job()).await.unwrap();
        let result = store
            .update(
                &job.id,
                Box::new(|job| {
                    job.command = "/bin/false".to_string();
                    Err(JobletError::validation("forced failure"))
                }),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(store.get(&job.id).await.unwrap().command, "/bin/true");
    }
}
