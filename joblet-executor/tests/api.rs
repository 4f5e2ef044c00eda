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

use crate::common::{await_terminal, start_harness, TestHarness};
use assert2::check;
use joblet_common::model::{JobFilter, JobId, JobSpec, JobStatus, VolumeType, WorkflowStatus};
use joblet_executor::api::jobs::JobsApi;
use joblet_executor::api::networks::NetworksApi;
use joblet_executor::api::runtimes::RuntimesApi;
use joblet_executor::api::volumes::VolumesApi;
use joblet_executor::api::workflows::WorkflowsApi;
use joblet_executor::api::StatusCode;
use joblet_executor::platform::fake::ChildPlan;
use joblet_executor::platform::Platform;
use test_r::test;
use tokio_stream::StreamExt;

fn jobs_api(harness: &TestHarness) -> JobsApi {
    JobsApi::new(
        harness.services.executor.clone(),
        harness.services.store.clone(),
        harness.services.logs.clone(),
        harness.services.monitor.clone(),
    )
}

#[test]
async fn jobs_round_trip_through_the_control_surface() {
    let harness = start_harness().await;
    harness
        .platform
        .queue_child(ChildPlan::succeeding_with_stdout(b"out\n".to_vec()));
    let api = jobs_api(&harness);

    let job = api
        .start_job(JobSpec::command("/bin/echo", ["out"]))
        .await
        .unwrap();
    await_terminal(&harness, &job.id).await;

    let fetched = api.get_job(&job.id).await.unwrap();
    check!(fetched.status == JobStatus::Completed);

    let listed = api
        .list_jobs(JobFilter {
            statuses: vec![JobStatus::Completed],
            name: None,
        })
        .await
        .unwrap();
    check!(listed.len() == 1);

    let mut logs = api.stream_logs(&job.id).await.unwrap();
    let mut stdout = Vec::new();
    while let Some(chunk) = logs.next().await {
        if chunk.origin == joblet_common::model::LogOrigin::Stdout {
            stdout.extend_from_slice(&chunk.data);
        }
    }
    check!(stdout == b"out\n".to_vec());

    api.delete_job(&job.id).await.unwrap();
    let error = api.get_job(&job.id).await.unwrap_err();
    check!(error.code == StatusCode::NotFound);
}

#[test]
async fn unknown_jobs_map_to_not_found_status() {
    let harness = start_harness().await;
    let api = jobs_api(&harness);
    let error = api.stream_logs(&JobId::new_v4()).await.unwrap_err();
    check!(error.code == StatusCode::NotFound);
    check!(!error.retryable);
}

#[test]
async fn volumes_and_networks_surface_their_conflicts() {
    let harness = start_harness().await;
    let volumes = VolumesApi::new(harness.services.volumes.clone());
    let networks = NetworksApi::new(harness.services.networks.clone());

    let volume = volumes
        .create_volume("api-vol", "2MB", VolumeType::Memory)
        .await
        .unwrap();
    check!(volume.size_bytes == 2 * 1024 * 1024);
    let error = volumes
        .create_volume("api-vol", "2MB", VolumeType::Memory)
        .await
        .unwrap_err();
    check!(error.code == StatusCode::AlreadyExists);

    let (used, available) = volumes.volume_usage("api-vol").await.unwrap();
    check!(used + available > 0);
    volumes.delete_volume("api-vol").await.unwrap();

    let listed = networks.list_networks().await.unwrap();
    check!(listed.iter().any(|n| n.name.as_str() == "bridge"));
    networks.create_network("api-net", "10.77.0.0/24").await.unwrap();
    let error = networks.delete_network("host").await.unwrap_err();
    check!(error.code == StatusCode::InvalidArgument);
    networks.delete_network("api-net").await.unwrap();
}

#[test]
async fn workflow_submission_and_status_streaming() {
    let harness = start_harness().await;
    harness.platform.queue_child(ChildPlan::default());
    let api = WorkflowsApi::new(harness.services.workflows.clone());

    let workflow = api
        .submit_workflow_yaml(
            r#"
jobs:
  only:
    command: /bin/true
"#,
        )
        .await
        .unwrap();

    let mut stream = api.stream_workflow_status(&workflow.id).await.unwrap();
    let mut last = stream.next().await.expect("initial snapshot");
    for _ in 0..500 {
        if last.status == WorkflowStatus::Completed {
            break;
        }
        match tokio::time::timeout(std::time::Duration::from_millis(50), stream.next()).await {
            Ok(Some(snapshot)) => last = snapshot,
            _ => last = api.get_workflow(&workflow.id).await.unwrap(),
        }
    }
    check!(last.status == WorkflowStatus::Completed);

    let error = api
        .submit_workflow_yaml("jobs:\n  a:\n    command: /bin/true\n    requires: [a]\n")
        .await
        .unwrap_err();
    check!(error.code == StatusCode::InvalidArgument);
}

#[test]
async fn runtimes_listing_reflects_the_install_tree() {
    let harness = start_harness().await;
    harness
        .platform
        .create_dir_all(std::path::Path::new("/opt/joblet/runtimes/python/3.12.1"))
        .unwrap();
    let api = RuntimesApi::new(harness.services.runtimes.clone());

    let runtimes = api.list_runtimes().await.unwrap();
    check!(runtimes.len() == 1);
    check!(runtimes[0].version == "3.12.1");

    let resolved = api.resolve_runtime("python:latest").await.unwrap();
    check!(resolved.version == "3.12.1");
    let error = api.resolve_runtime("ruby").await.unwrap_err();
    check!(error.code == StatusCode::NotFound);
}
