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

pub mod config;
pub mod error;
pub mod model;
pub mod tracing;

#[cfg(test)]
test_r::enable!();

/// Renders a value in a form that is safe to return to users or write to
/// logs: secrets are masked, internal detail is elided.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
