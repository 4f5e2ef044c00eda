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

//! Locates pre-installed execution runtimes. Resolution is pure
//! filesystem; installation happens outside the service.

use crate::platform::Platform;
use async_trait::async_trait;
use joblet_common::error::JobletError;
use joblet_common::model::RuntimeSpec;
use semver::Version;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// One installed `<base>/<name>/<version>/` tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRuntime {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
}

#[async_trait]
pub trait RuntimeService: Send + Sync {
    async fn list(&self) -> Result<Vec<InstalledRuntime>, JobletError>;
    /// `latest` (or no version) resolves to the highest semver install.
    async fn resolve(&self, spec: &RuntimeSpec) -> Result<InstalledRuntime, JobletError>;
    async fn validate(&self, spec: &RuntimeSpec) -> Result<(), JobletError>;
}

pub struct RuntimeServiceDefault {
    platform: Arc<dyn Platform>,
    base_path: PathBuf,
}

impl RuntimeServiceDefault {
    pub fn new(platform: Arc<dyn Platform>, base_path: PathBuf) -> Self {
        RuntimeServiceDefault {
            platform,
            base_path,
        }
    }

    fn versions_of(&self, name: &str) -> Result<Vec<(Version, PathBuf)>, JobletError> {
        let dir = self.base_path.join(name);
        if !self.platform.exists(&dir) {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in self.platform.list_dir(&dir)? {
            let Some(file_name) = entry.file_name().map(|n| n.to_string_lossy().to_string())
            else {
                continue;
            };
            match Version::parse(&file_name) {
                Ok(version) => versions.push((version, entry)),
                Err(_) => {
                    warn!(runtime = name, version = %file_name, "Ignoring non-semver runtime version directory");
                }
            }
        }
        versions.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(versions)
    }
}

#[async_trait]
impl RuntimeService for RuntimeServiceDefault {
    async fn list(&self) -> Result<Vec<InstalledRuntime>, JobletError> {
        if !self.platform.exists(&self.base_path) {
            return Ok(Vec::new());
        }
        let mut result = Vec::new();
        for entry in self.platform.list_dir(&self.base_path)? {
            let Some(name) = entry.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            for (version, path) in self.versions_of(&name)? {
                result.push(InstalledRuntime {
                    name: name.clone(),
                    version: version.to_string(),
                    path,
                });
            }
        }
        Ok(result)
    }

    async fn resolve(&self, spec: &RuntimeSpec) -> Result<InstalledRuntime, JobletError> {
        let versions = self.versions_of(&spec.name)?;
        if versions.is_empty() {
            return Err(JobletError::not_found("runtime", &spec.name));
        }
        match spec.version.as_deref() {
            None | Some("latest") => {
                let (version, path) = versions.last().unwrap().clone();
                Ok(InstalledRuntime {
                    name: spec.name.clone(),
                    version: version.to_string(),
                    path,
                })
            }
            Some(requested) => {
                let requested_version = Version::parse(requested).map_err(|_| {
                    JobletError::validation(format!("invalid runtime version: {requested:?}"))
                })?;
                versions
                    .into_iter()
                    .find(|(version, _)| *version == requested_version)
                    .map(|(version, path)| InstalledRuntime {
                        name: spec.name.clone(),
                        version: version.to_string(),
                        path,
                    })
                    .ok_or_else(|| JobletError::not_found("runtime", spec))
            }
        }
    }

    async fn validate(&self, spec: &RuntimeSpec) -> Result<(), JobletError> {
        self.resolve(spec).await.map(|_| ())
    }
}
