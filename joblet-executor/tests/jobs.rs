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

use crate::common::{await_status, await_terminal, start_harness};
use assert2::check;
use joblet_common::error::ErrorKind;
use joblet_common::model::{
    JobSpec, JobStatus, LogOrigin, UploadEntry, VolumeName, VolumeType,
};
use joblet_executor::platform::Platform;
use joblet_executor::platform::fake::ChildPlan;
use joblet_executor::services::upload::framing;
use std::path::Path;
use test_r::test;

#[test]
async fn echo_job_runs_to_completion_with_its_output() {
    let harness = start_harness().await;
    harness
        .platform
        .queue_child(ChildPlan::succeeding_with_stdout(b"hello\n".to_vec()));

    let job = harness
        .services
        .executor
        .start_job(JobSpec::command("/bin/echo", ["hello"]))
        .await
        .unwrap();
    check!(job.status == JobStatus::Initializing);

    let finished = await_terminal(&harness, &job.id).await;
    check!(finished.status == JobStatus::Completed);
    check!(finished.exit_code == Some(0));
    check!(finished.start_time.is_some());
    check!(finished.end_time.is_some());

    // Replay delivers the full output even after completion.
    let mut logs = harness.services.logs.subscribe(job.id);
    let mut stdout = Vec::new();
    while let Some(chunk) = logs.recv().await {
        if chunk.origin == LogOrigin::Stdout {
            stdout.extend_from_slice(&chunk.data);
        }
    }
    check!(stdout == b"hello\n".to_vec());
}

#[test]
async fn nonzero_exit_fails_the_job() {
    let harness = start_harness().await;
    harness.platform.queue_child(ChildPlan::exiting_with(3));

    let job = harness
        .services
        .executor
        .start_job(JobSpec::command("/bin/false", []))
        .await
        .unwrap();
    let finished = await_terminal(&harness, &job.id).await;
    check!(finished.status == JobStatus::Failed);
    check!(finished.exit_code == Some(3));
    check!(finished.failure_reason.as_deref() == Some("exited with code 3"));
}

#[test]
async fn graceful_stop_transitions_to_stopped() {
    let harness = start_harness().await;
    harness
        .platform
        .queue_child(ChildPlan::running_until_killed());

    let job = harness
        .services
        .executor
        .start_job(JobSpec::command("/bin/sleep", ["600"]))
        .await
        .unwrap();
    let running = await_status(&harness, &job.id, JobStatus::Running).await;
    check!(running.pid.is_some());
    check!(running.cgroup_path.is_some());

    harness
        .services
        .executor
        .stop_job(&job.id, false, Some("test stop".to_string()))
        .await
        .unwrap();
    let stopped = await_terminal(&harness, &job.id).await;
    check!(stopped.status == JobStatus::Stopped);
    check!(stopped.failure_reason.as_deref() == Some("test stop"));

    // The sandbox leaves nothing behind once reaped.
    let cgroup = stopped.cgroup_path.unwrap();
    check!(!harness.platform.exists(&cgroup));
}

#[test]
async fn sigterm_resistant_jobs_are_killed_after_the_grace_period() {
    let harness = start_harness().await;
    harness.platform.queue_child(ChildPlan {
        ignore_sigterm: true,
        ..ChildPlan::running_until_killed()
    });

    let job = harness
        .services
        .executor
        .start_job(JobSpec::command("/bin/sleep", ["600"]))
        .await
        .unwrap();
    await_status(&harness, &job.id, JobStatus::Running).await;

    harness
        .services
        .executor
        .stop_job(&job.id, false, None)
        .await
        .unwrap();
    let stopped = await_terminal(&harness, &job.id).await;
    check!(stopped.status == JobStatus::Stopped);
    let ops = harness.platform.operations();
    check!(ops.iter().any(|op| op.contains("force=true")));
}

#[test]
async fn delete_is_rejected_until_terminal() {
    let harness = start_harness().await;
    harness
        .platform
        .queue_child(ChildPlan::running_until_killed());

    let job = harness
        .services
        .executor
        .start_job(JobSpec::command("/bin/sleep", ["600"]))
        .await
        .unwrap();
    await_status(&harness, &job.id, JobStatus::Running).await;

    let error = harness
        .services
        .executor
        .delete_job(&job.id)
        .await
        .unwrap_err();
    check!(error.kind == ErrorKind::Conflict);

    harness
        .services
        .executor
        .stop_job(&job.id, true, None)
        .await
        .unwrap();
    await_terminal(&harness, &job.id).await;
    harness.services.executor.delete_job(&job.id).await.unwrap();
    check!(
        harness.services.store.get(&job.id).await.unwrap_err().kind == ErrorKind::NotFound
    );
}

#[test]
async fn volume_refcounts_follow_the_job_lifecycle() {
    let harness = start_harness().await;
    let volume_name = VolumeName::new("data1").unwrap();
    harness
        .services
        .volumes
        .create(&volume_name, "1MB", VolumeType::Filesystem)
        .await
        .unwrap();
    harness
        .platform
        .queue_child(ChildPlan::running_until_killed());

    let mut spec = JobSpec::command("/bin/sleep", ["600"]);
    spec.volumes = vec![volume_name.clone()];
    let job = harness.services.executor.start_job(spec).await.unwrap();
    await_status(&harness, &job.id, JobStatus::Running).await;

    check!(harness.services.volumes.get(&volume_name).await.unwrap().refcount == 1);
    let error = harness
        .services
        .volumes
        .remove(&volume_name)
        .await
        .unwrap_err();
    check!(error.kind == ErrorKind::Conflict);

    harness
        .services
        .executor
        .stop_job(&job.id, true, None)
        .await
        .unwrap();
    await_terminal(&harness, &job.id).await;
    // Detach happens during asynchronous teardown.
    for _ in 0..100 {
        if harness.services.volumes.get(&volume_name).await.unwrap().refcount == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    check!(harness.services.volumes.get(&volume_name).await.unwrap().refcount == 0);
    harness.services.volumes.remove(&volume_name).await.unwrap();
}

#[test]
async fn missing_volumes_fail_the_registered_job() {
    let harness = start_harness().await;
    let mut spec = JobSpec::command("/bin/true", []);
    spec.volumes = vec![VolumeName::new("ghost").unwrap()];
    let error = harness.services.executor.start_job(spec).await.unwrap_err();
    check!(error.kind == ErrorKind::NotFound);

    // The job record survives the failed attach for inspection.
    let jobs = harness.services.store.list(&Default::default()).await;
    check!(jobs.len() == 1);
    check!(jobs[0].status == JobStatus::Failed);
    check!(jobs[0]
        .failure_reason
        .as_deref()
        .unwrap_or("")
        .contains("volume attach failed"));
    check!(harness.platform.spawned_specs().is_empty());
}

#[test]
async fn uploads_are_framed_into_the_job_workspace_pipe() {
    let harness = start_harness().await;
    harness.platform.queue_child(ChildPlan::default());

    let mut spec = JobSpec::command("/bin/cat", ["input.txt"]);
    spec.uploads = vec![
        UploadEntry::directory("conf", 0o755),
        UploadEntry::file("input.txt", 0o644, b"payload".to_vec()),
    ];
    let job = harness.services.executor.start_job(spec).await.unwrap();
    let finished = await_terminal(&harness, &job.id).await;
    check!(finished.status == JobStatus::Completed);

    let spawned = harness.platform.spawned_specs();
    check!(spawned.len() == 1);
    let pipe = spawned[0].upload_pipe.clone().unwrap();
    let wire = harness.platform.fifo_contents(&pipe);
    let parsed = framing::read_frames(&mut wire.as_slice()).unwrap();
    check!(parsed.len() == 2);
    check!(parsed[0].relative_path == "conf");
    check!(parsed[1].data.as_ref() == b"payload");
}

#[test]
async fn oversized_uploads_fail_the_job_during_launch() {
    let harness = start_harness().await;
    let mut spec = JobSpec::command("/bin/cat", []);
    spec.limits.memory = "64B".parse().unwrap();
    spec.uploads = vec![UploadEntry::file("big", 0o644, vec![0u8; 128])];
    let job = harness.services.executor.start_job(spec).await.unwrap();

    // Session validation runs at its own step, after registration; the
    // job fails into the store and nothing is forked.
    let finished = await_terminal(&harness, &job.id).await;
    check!(finished.status == JobStatus::Failed);
    check!(finished
        .failure_reason
        .as_deref()
        .unwrap_or("")
        .contains("upload validation failed"));
    check!(harness.platform.spawned_specs().is_empty());
}

#[test]
async fn workspace_is_removed_after_the_job_ends() {
    let harness = start_harness().await;
    harness.platform.queue_child(ChildPlan::default());

    let job = harness
        .services
        .executor
        .start_job(JobSpec::command("/bin/true", []))
        .await
        .unwrap();
    await_terminal(&harness, &job.id).await;

    for _ in 0..100 {
        if !harness
            .platform
            .exists(Path::new(&format!("/var/lib/joblet/jobs/{}", job.id)))
        {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    check!(!harness
        .platform
        .exists(Path::new(&format!("/var/lib/joblet/jobs/{}", job.id))));
}
