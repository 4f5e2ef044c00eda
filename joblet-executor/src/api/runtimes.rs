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

use super::ApiError;
use crate::services::runtime::{InstalledRuntime, RuntimeService};
use joblet_common::model::RuntimeSpec;
use std::sync::Arc;

pub struct RuntimesApi {
    runtimes: Arc<dyn RuntimeService>,
}

impl RuntimesApi {
    pub fn new(runtimes: Arc<dyn RuntimeService>) -> Self {
        RuntimesApi { runtimes }
    }

    pub async fn list_runtimes(&self) -> Result<Vec<InstalledRuntime>, ApiError> {
        Ok(self.runtimes.list().await?)
    }

    pub async fn resolve_runtime(&self, spec: &str) -> Result<InstalledRuntime, ApiError> {
        let spec: RuntimeSpec = spec.parse()?;
        Ok(self.runtimes.resolve(&spec).await?)
    }
}
