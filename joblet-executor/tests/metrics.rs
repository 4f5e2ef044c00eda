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

use crate::common::{await_status, start_harness};
use assert2::check;
use joblet_common::model::{JobSpec, JobStatus, MetricSample};
use joblet_executor::platform::fake::ChildPlan;
use joblet_executor::platform::Platform;
use std::time::Duration;
use test_r::test;

#[test]
async fn monitor_emits_job_and_system_samples() {
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
    let cgroup = running.cgroup_path.unwrap();

    // Seed the cgroup statistic files the sampler reads.
    harness
        .platform
        .write_file(&cgroup.join("cpu.stat"), b"usage_usec 5000\nuser_usec 4000\n")
        .unwrap();
    harness
        .platform
        .write_file(&cgroup.join("memory.current"), b"1048576")
        .unwrap();
    harness
        .platform
        .write_file(&cgroup.join("memory.peak"), b"2097152")
        .unwrap();
    harness
        .platform
        .write_file(&cgroup.join("io.stat"), b"8:0 rbytes=100 wbytes=200\n")
        .unwrap();

    let mut samples = harness.services.monitor.subscribe();
    let mut saw_job = false;
    let mut saw_system = false;
    for _ in 0..100 {
        match tokio::time::timeout(Duration::from_millis(200), samples.recv()).await {
            Ok(Some(MetricSample::Job(metrics))) if metrics.job_id == job.id => {
                check!(metrics.memory_current_bytes == 1048576);
                check!(metrics.memory_peak_bytes == 2097152);
                check!(metrics.io_read_bytes == 100);
                check!(metrics.io_write_bytes == 200);
                saw_job = true;
            }
            Ok(Some(MetricSample::System(system))) => {
                check!(system.memory_total_bytes > 0);
                saw_system = true;
            }
            _ => {}
        }
        if saw_job && saw_system {
            break;
        }
    }
    check!(saw_job, "no job sample observed");
    check!(saw_system, "no system sample observed");

    harness
        .services
        .executor
        .stop_job(&job.id, true, None)
        .await
        .unwrap();
}
