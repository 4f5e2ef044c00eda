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

use crate::cgroup::CgroupBuilder;
use crate::config::{JobletConfig, PersistenceBackendConfig};
use crate::logs::LogRouter;
use crate::platform::linux::LinuxPlatform;
use crate::platform::Platform;
use crate::services::executor::{JobExecutor, JobExecutorDefault};
use crate::services::job_store::{JobStore, JobStoreDefault};
use crate::services::monitor::MonitorService;
use crate::services::network::{NetworkService, NetworkServiceDefault};
use crate::services::persistence::{
    DynamoDbJobRepo, InMemoryJobRepo, JobRepo, PersistenceService,
};
use crate::services::runtime::{RuntimeService, RuntimeServiceDefault};
use crate::services::scheduler::SchedulerService;
use crate::services::upload::{UploadService, UploadServiceDefault};
use crate::services::volume::{VolumeService, VolumeServiceDefault};
use crate::services::workflow::{WorkflowService, WorkflowServiceDefault};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn JobStore>,
    pub executor: Arc<dyn JobExecutor>,
    pub volumes: Arc<dyn VolumeService>,
    pub networks: Arc<dyn NetworkService>,
    pub runtimes: Arc<dyn RuntimeService>,
    pub uploads: Arc<dyn UploadService>,
    pub workflows: Arc<dyn WorkflowService>,
    pub logs: Arc<LogRouter>,
    pub monitor: Arc<MonitorService>,
    pub persistence: Arc<PersistenceService>,
    pub cgroups: Arc<CgroupBuilder>,
}

impl Services {
    pub async fn new(
        config: &JobletConfig,
        shutdown: CancellationToken,
    ) -> Result<Services, String> {
        Self::with_platform(Arc::new(LinuxPlatform::new()), config, shutdown).await
    }

    /// Builds the full bundle on an arbitrary platform; tests inject
    /// the recording fake here.
    pub async fn with_platform(
        platform: Arc<dyn Platform>,
        config: &JobletConfig,
        shutdown: CancellationToken,
    ) -> Result<Services, String> {
        let repo: Arc<dyn JobRepo> = match &config.persistence.backend {
            PersistenceBackendConfig::InMemory(_) => Arc::new(InMemoryJobRepo::new()),
            PersistenceBackendConfig::DynamoDb(dynamo) => Arc::new(
                DynamoDbJobRepo::new(dynamo.table.clone(), dynamo.region.clone()).await,
            ),
        };
        Self::with_repo(platform, repo, config, shutdown).await
    }

    pub async fn with_repo(
        platform: Arc<dyn Platform>,
        repo: Arc<dyn JobRepo>,
        config: &JobletConfig,
        shutdown: CancellationToken,
    ) -> Result<Services, String> {
        let persistence = PersistenceService::start(
            repo,
            config.persistence.queue_capacity,
            config.persistence.terminal_ttl,
            shutdown.clone(),
        );
        if !persistence.healthy().await {
            warn!("Persistence backend is unhealthy; continuing with degraded durability");
        }

        let store: Arc<dyn JobStore> = Arc::new(JobStoreDefault::new(persistence.clone()));
        let logs = Arc::new(LogRouter::new(config.log_buffer_capacity));
        let cgroups = Arc::new(CgroupBuilder::new(
            platform.clone(),
            config.cgroup_root.clone(),
        ));
        let volumes: Arc<dyn VolumeService> = Arc::new(VolumeServiceDefault::new(
            platform.clone(),
            config.volumes_path.clone(),
        ));
        let networks: Arc<dyn NetworkService> = Arc::new(NetworkServiceDefault::new(
            config
                .network_definitions()
                .map_err(|err| err.to_string())?,
        ));
        let runtimes: Arc<dyn RuntimeService> = Arc::new(RuntimeServiceDefault::new(
            platform.clone(),
            config.runtimes_path.clone(),
        ));
        let uploads: Arc<dyn UploadService> =
            Arc::new(UploadServiceDefault::new(platform.clone()));

        let scheduler_notify = Arc::new(Notify::new());
        let executor: Arc<dyn JobExecutor> = JobExecutorDefault::new(
            platform.clone(),
            store.clone(),
            volumes.clone(),
            networks.clone(),
            runtimes.clone(),
            uploads.clone(),
            cgroups.clone(),
            logs.clone(),
            config.executor_settings(),
            scheduler_notify.clone(),
            shutdown.clone(),
        );

        let workflows = WorkflowServiceDefault::new(executor.clone());
        workflows.start_event_loop(store.clone(), shutdown.clone());
        let workflows: Arc<dyn WorkflowService> = workflows;

        SchedulerService::start(
            store.clone(),
            executor.clone(),
            scheduler_notify,
            shutdown.clone(),
        );
        let (monitor, _monitor_handle) = MonitorService::start(
            store.clone(),
            cgroups.clone(),
            config.monitor_settings(),
            shutdown.clone(),
        );

        // Startup: rebuild volumes from disk, then fold persisted jobs
        // back in as reference-only records.
        let volume_count = volumes
            .scan_on_startup()
            .await
            .map_err(|err| err.to_string())?;
        let persisted = persistence.load_all().await;
        let restored = persisted.len();
        for record in persisted {
            store.insert_reference(record.to_reference_job()).await;
        }
        info!(
            volumes = volume_count,
            restored_jobs = restored,
            "Joblet services ready"
        );

        Ok(Services {
            store,
            executor,
            volumes,
            networks,
            runtimes,
            uploads,
            workflows,
            logs,
            monitor,
            persistence,
            cgroups,
        })
    }
}
