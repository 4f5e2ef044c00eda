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

use joblet_common::model::{Job, JobId, JobStatus};
use joblet_executor::bootstrap::Services;
use joblet_executor::config::JobletConfig;
use joblet_executor::platform::fake::FakePlatform;
use joblet_executor::services::persistence::InMemoryJobRepo;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct TestHarness {
    pub platform: Arc<FakePlatform>,
    pub repo: Arc<InMemoryJobRepo>,
    pub services: Services,
    pub shutdown: CancellationToken,
}

pub fn test_config() -> JobletConfig {
    let mut config = JobletConfig {
        grace_period: Duration::from_millis(300),
        ..JobletConfig::default()
    };
    config.monitor.interval = Duration::from_millis(100);
    config
}

pub async fn start_harness() -> TestHarness {
    start_harness_with(Arc::new(InMemoryJobRepo::new()), test_config()).await
}

pub async fn start_harness_with(repo: Arc<InMemoryJobRepo>, config: JobletConfig) -> TestHarness {
    let platform = Arc::new(FakePlatform::new());
    let shutdown = CancellationToken::new();
    let services = Services::with_repo(
        platform.clone(),
        repo.clone(),
        &config,
        shutdown.clone(),
    )
    .await
    .expect("Failed to bootstrap services");
    TestHarness {
        platform,
        repo,
        services,
        shutdown,
    }
}

/// Polls the store until the job reaches a terminal state.
pub async fn await_terminal(harness: &TestHarness, id: &JobId) -> Job {
    for _ in 0..500 {
        let job = harness
            .services
            .store
            .get(id)
            .await
            .expect("job disappeared while awaited");
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} did not reach a terminal state in time");
}

pub async fn await_status(harness: &TestHarness, id: &JobId, status: JobStatus) -> Job {
    for _ in 0..500 {
        let job = harness
            .services
            .store
            .get(id)
            .await
            .expect("job disappeared while awaited");
        if job.status == status {
            return job;
        }
        assert!(
            !job.status.is_terminal(),
            "job {id} terminated as {} while waiting for {status}",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never reached {status}");
}
