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

//! Best-effort typed pub/sub: one bounded channel per subscriber,
//! events dropped (never blocking the publisher) when a queue is full.

use std::sync::Mutex;
use tokio::sync::mpsc;

pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

pub struct EventBus<T: Clone + Send + 'static> {
    subscribers: Mutex<Vec<mpsc::Sender<T>>>,
    queue_depth: usize,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new(queue_depth: usize) -> Self {
        EventBus {
            subscribers: Mutex::new(Vec::new()),
            queue_depth,
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<T> {
        let (sender, receiver) = mpsc::channel(self.queue_depth);
        self.subscribers.lock().unwrap().push(sender);
        receiver
    }

    /// Fan-out with per-subscriber overflow: a full queue drops this
    /// event for that subscriber only; a closed one is removed.
    pub fn publish(&self, event: T) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|sender| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}
