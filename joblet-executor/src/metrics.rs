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

use lazy_static::lazy_static;
use prometheus::{
    histogram_opts, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, IntCounter, IntCounterVec, IntGauge, Registry,
};

lazy_static! {
    static ref JOBS_CREATED_TOTAL: IntCounter = register_int_counter!(
        "joblet_jobs_created_total",
        "Number of jobs accepted by this node"
    )
    .unwrap();
    static ref JOB_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "joblet_job_transitions_total",
        "Job status transitions",
        &["status"]
    )
    .unwrap();
    static ref RUNNING_JOBS: IntGauge = register_int_gauge!(
        "joblet_running_jobs",
        "Jobs currently in the Running state"
    )
    .unwrap();
    static ref ACTIVE_VOLUMES: IntGauge = register_int_gauge!(
        "joblet_active_volumes",
        "Volumes known to the registry"
    )
    .unwrap();
    static ref UPLOAD_BYTES_TOTAL: IntCounter = register_int_counter!(
        "joblet_upload_bytes_total",
        "Bytes streamed into job workspaces"
    )
    .unwrap();
    static ref LOG_BYTES_DROPPED_TOTAL: IntCounter = register_int_counter!(
        "joblet_log_bytes_dropped_total",
        "Log bytes overwritten in full buffers"
    )
    .unwrap();
    static ref PERSISTENCE_WRITES_TOTAL: IntCounter = register_int_counter!(
        "joblet_persistence_writes_total",
        "Records handed to the persistence backend"
    )
    .unwrap();
    static ref PERSISTENCE_ERRORS_TOTAL: IntCounter = register_int_counter!(
        "joblet_persistence_errors_total",
        "Persistence backend failures (logged, not surfaced)"
    )
    .unwrap();
    static ref START_JOB_SECONDS: Histogram = register_histogram!(histogram_opts!(
        "joblet_start_job_seconds",
        "Time from request to the Running transition",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ))
    .unwrap();
    static ref MONITOR_SAMPLE_SECONDS: Histogram = register_histogram!(histogram_opts!(
        "joblet_monitor_sample_seconds",
        "Duration of one monitor sampling cycle",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ))
    .unwrap();
}

/// Forces evaluation of every collector and returns the registry the
/// server exposes.
pub fn register_all() -> Registry {
    JOBS_CREATED_TOTAL.reset();
    LOG_BYTES_DROPPED_TOTAL.reset();
    prometheus::default_registry().clone()
}

pub fn record_job_created() {
    JOBS_CREATED_TOTAL.inc();
}

pub fn record_job_transition(status: &str) {
    JOB_TRANSITIONS_TOTAL.with_label_values(&[status]).inc();
}

pub fn set_running_jobs(count: i64) {
    RUNNING_JOBS.set(count);
}

pub fn set_active_volumes(count: i64) {
    ACTIVE_VOLUMES.set(count);
}

pub fn record_upload_bytes(count: u64) {
    UPLOAD_BYTES_TOTAL.inc_by(count);
}

pub fn record_log_bytes_dropped(count: u64) {
    LOG_BYTES_DROPPED_TOTAL.inc_by(count);
}

pub fn record_persistence_write() {
    PERSISTENCE_WRITES_TOTAL.inc();
}

pub fn record_persistence_error() {
    PERSISTENCE_ERRORS_TOTAL.inc();
}

pub fn observe_start_job_seconds(seconds: f64) {
    START_JOB_SECONDS.observe(seconds);
}

pub fn observe_monitor_sample_seconds(seconds: f64) {
    MONITOR_SAMPLE_SECONDS.observe(seconds);
}
