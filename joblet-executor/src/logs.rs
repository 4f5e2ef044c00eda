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

//! Bounded per-job log buffers with replay-then-stream subscriptions.
//!
//! Writers never block: when a topic exceeds its byte capacity the
//! oldest chunks are discarded, and a subscriber that cannot keep up
//! with the live tail is dropped rather than stalling the producer.

use crate::metrics;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use joblet_common::model::{JobId, LogChunk, LogOrigin};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

pub const DEFAULT_CAPACITY_BYTES: usize = 1024 * 1024;

/// Bound on the live tail a subscriber may fall behind by.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

struct TopicInner {
    chunks: VecDeque<LogChunk>,
    buffered_bytes: usize,
    next_seq: [u64; 3],
    subscribers: Vec<mpsc::Sender<LogChunk>>,
    finished: bool,
}

fn origin_index(origin: LogOrigin) -> usize {
    match origin {
        LogOrigin::Stdout => 0,
        LogOrigin::Stderr => 1,
        LogOrigin::System => 2,
    }
}

pub struct LogTopic {
    job_id: JobId,
    capacity: usize,
    inner: Mutex<TopicInner>,
}

impl LogTopic {
    fn new(job_id: JobId, capacity: usize) -> Self {
        LogTopic {
            job_id,
            capacity,
            inner: Mutex::new(TopicInner {
                chunks: VecDeque::new(),
                buffered_bytes: 0,
                next_seq: [0; 3],
                subscribers: Vec::new(),
                finished: false,
            }),
        }
    }

    /// Appends a chunk and fans it out. The lock is held only for the
    /// append and the non-blocking sends.
    pub fn publish(&self, origin: LogOrigin, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.finished {
            return;
        }
        let seq = inner.next_seq[origin_index(origin)];
        inner.next_seq[origin_index(origin)] += 1;
        let chunk = LogChunk {
            job_id: self.job_id,
            origin,
            seq,
            at: Utc::now(),
            data,
        };

        inner.buffered_bytes += chunk.data.len();
        inner.chunks.push_back(chunk.clone());
        while inner.buffered_bytes > self.capacity {
            match inner.chunks.pop_front() {
                Some(dropped) => {
                    inner.buffered_bytes -= dropped.data.len();
                    metrics::record_log_bytes_dropped(dropped.data.len() as u64);
                }
                None => break,
            }
        }

        let job_id = self.job_id;
        inner.subscribers.retain(|sender| {
            match sender.try_send(chunk.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(job_id = %job_id, "Dropping lagging log subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Replay-then-stream: the retained prefix is delivered first, the
    /// live tail follows on the same channel.
    pub fn subscribe(&self) -> mpsc::Receiver<LogChunk> {
        let mut inner = self.inner.lock().unwrap();
        let (sender, receiver) =
            mpsc::channel(inner.chunks.len() + SUBSCRIBER_QUEUE_DEPTH);
        for chunk in &inner.chunks {
            // Capacity covers the whole snapshot, this cannot fail.
            let _ = sender.try_send(chunk.clone());
        }
        if !inner.finished {
            inner.subscribers.push(sender);
        }
        receiver
    }

    /// Ends the live tail: current subscribers drain what they have
    /// and see end-of-stream; the buffer stays readable for replay.
    pub fn finish(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.finished = true;
        inner.subscribers.clear();
    }

    pub fn buffered_bytes(&self) -> usize {
        self.inner.lock().unwrap().buffered_bytes
    }
}

/// Topic registry: one bounded buffer per job.
pub struct LogRouter {
    topics: DashMap<JobId, Arc<LogTopic>>,
    capacity: usize,
}

impl LogRouter {
    pub fn new(capacity: usize) -> Self {
        LogRouter {
            topics: DashMap::new(),
            capacity,
        }
    }

    pub fn topic(&self, job_id: JobId) -> Arc<LogTopic> {
        self.topics
            .entry(job_id)
            .or_insert_with(|| Arc::new(LogTopic::new(job_id, self.capacity)))
            .clone()
    }

    pub fn publish(&self, job_id: JobId, origin: LogOrigin, data: Bytes) {
        self.topic(job_id).publish(origin, data);
    }

    pub fn subscribe(&self, job_id: JobId) -> mpsc::Receiver<LogChunk> {
        self.topic(job_id).subscribe()
    }

    pub fn finish(&self, job_id: JobId) {
        if let Some(topic) = self.topics.get(&job_id) {
            topic.finish();
        }
    }

    /// Drops the buffer entirely; used by job deletion.
    pub fn remove(&self, job_id: JobId) {
        if let Some((_, topic)) = self.topics.remove(&job_id) {
            topic.finish();
        }
    }
}

impl Default for LogRouter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY_BYTES)
    }
}
