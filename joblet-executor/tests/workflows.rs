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

use crate::common::{start_harness, TestHarness};
use assert2::check;
use joblet_common::model::{JobStatus, Workflow, WorkflowId, WorkflowStatus};
use joblet_executor::platform::fake::ChildPlan;
use joblet_executor::services::workflow::parse_workflow_yaml;
use std::time::Duration;
use test_r::test;

async fn await_workflow_terminal(harness: &TestHarness, id: &WorkflowId) -> Workflow {
    for _ in 0..500 {
        let workflow = harness.services.workflows.get(id).await.unwrap();
        if workflow.status.is_terminal()
            && workflow
                .jobs
                .values()
                .all(|node| node.status.is_terminal() || node.status == JobStatus::Pending)
        {
            return workflow;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workflow {id} did not settle in time");
}

#[test]
async fn diamond_workflow_completes_in_dependency_order() {
    let harness = start_harness().await;
    for _ in 0..3 {
        harness.platform.queue_child(ChildPlan::default());
    }

    let spec = parse_workflow_yaml(
        r#"
jobs:
  a:
    command: /bin/true
  b:
    command: /bin/true
    requires: [a]
  c:
    command: /bin/true
    requires: [a, b]
"#,
    )
    .unwrap();
    let workflow = harness.services.workflows.submit(spec).await.unwrap();
    check!(workflow.status == WorkflowStatus::Running);

    let finished = await_workflow_terminal(&harness, &workflow.id).await;
    check!(finished.status == WorkflowStatus::Completed);
    for node in finished.jobs.values() {
        check!(node.status == JobStatus::Completed);
    }
}

#[test]
async fn node_failure_cancels_dependents_and_fails_the_workflow() {
    let harness = start_harness().await;
    // a succeeds; then b and c are submitted in name order; c fails.
    harness.platform.queue_child(ChildPlan::default());
    harness.platform.queue_child(ChildPlan::default());
    harness.platform.queue_child(ChildPlan::exiting_with(1));

    let spec = parse_workflow_yaml(
        r#"
jobs:
  a:
    command: /bin/true
  b:
    command: /bin/true
    requires: [a]
  c:
    command: /bin/false
    requires: [a]
  d:
    command: /bin/true
    requires: [c]
"#,
    )
    .unwrap();
    let workflow = harness.services.workflows.submit(spec).await.unwrap();
    let finished = await_workflow_terminal(&harness, &workflow.id).await;

    check!(finished.status == WorkflowStatus::Failed);
    check!(finished.jobs["a"].status == JobStatus::Completed);
    check!(finished.jobs["b"].status == JobStatus::Completed);
    check!(finished.jobs["c"].status == JobStatus::Failed);
    check!(finished.jobs["d"].status == JobStatus::Canceled);
}

#[test]
async fn workflow_status_stream_reports_progress() {
    let harness = start_harness().await;
    harness.platform.queue_child(ChildPlan::default());

    let spec = parse_workflow_yaml(
        r#"
jobs:
  only:
    command: /bin/true
"#,
    )
    .unwrap();
    let workflow = harness.services.workflows.submit(spec).await.unwrap();
    let mut stream = harness.services.workflows.subscribe_status();

    let mut last = None;
    for _ in 0..500 {
        match tokio::time::timeout(Duration::from_millis(50), stream.recv()).await {
            Ok(Some(snapshot)) if snapshot.id == workflow.id => {
                let done = snapshot.status == WorkflowStatus::Completed;
                last = Some(snapshot);
                if done {
                    break;
                }
            }
            _ => {}
        }
        if harness.services.workflows.get(&workflow.id).await.unwrap().status
            == WorkflowStatus::Completed
        {
            break;
        }
    }
    let final_status = harness.services.workflows.get(&workflow.id).await.unwrap();
    check!(final_status.status == WorkflowStatus::Completed);
    let _ = last;
}

#[test]
async fn workflows_reaching_a_terminal_status_stay_there() {
    let harness = start_harness().await;
    harness.platform.queue_child(ChildPlan::exiting_with(2));
    harness.platform.queue_child(ChildPlan::default());

    let spec = parse_workflow_yaml(
        r#"
jobs:
  bad:
    command: /bin/false
  slow:
    command: /bin/true
"#,
    )
    .unwrap();
    let workflow = harness.services.workflows.submit(spec).await.unwrap();
    let finished = await_workflow_terminal(&harness, &workflow.id).await;
    check!(finished.status == WorkflowStatus::Failed);

    // The surviving peer finishes, the aggregate never leaves Failed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = harness.services.workflows.get(&workflow.id).await.unwrap();
    check!(after.status == WorkflowStatus::Failed);
}
