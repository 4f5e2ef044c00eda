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

use tracing::warn;

/// Builder-then-commit unwinding for multi-step resource setup.
///
/// Each allocated resource pushes an undo action; dropping the stack
/// before [`UnwindStack::commit`] runs the actions in reverse order.
pub struct UnwindStack {
    actions: Vec<(&'static str, Box<dyn FnOnce() + Send>)>,
    armed: bool,
}

impl Default for UnwindStack {
    fn default() -> Self {
        Self::new()
    }
}

impl UnwindStack {
    pub fn new() -> Self {
        UnwindStack {
            actions: Vec::new(),
            armed: true,
        }
    }

    pub fn push(&mut self, label: &'static str, action: impl FnOnce() + Send + 'static) {
        self.actions.push((label, Box::new(action)));
    }

    /// Marks the setup as successful; nothing is undone.
    pub fn commit(mut self) {
        self.armed = false;
        self.actions.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Drop for UnwindStack {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        while let Some((label, action)) = self.actions.pop() {
            warn!(step = label, "Unwinding");
            action();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use test_r::test;

    #[test]
    fn unwinds_in_reverse_order_on_drop() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let mut stack = UnwindStack::new();
            for label in ["first", "second", "third"] {
                let order = order.clone();
                stack.push(label, move || order.lock().unwrap().push(label));
            }
        }
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[test]
    fn commit_disarms_the_stack() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let mut stack = UnwindStack::new();
            let count = count.clone();
            stack.push("only", move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
            stack.commit();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
