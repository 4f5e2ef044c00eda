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
use crate::services::volume::VolumeService;
use joblet_common::model::{Volume, VolumeName, VolumeType};
use std::sync::Arc;

pub struct VolumesApi {
    volumes: Arc<dyn VolumeService>,
}

impl VolumesApi {
    pub fn new(volumes: Arc<dyn VolumeService>) -> Self {
        VolumesApi { volumes }
    }

    pub async fn create_volume(
        &self,
        name: &str,
        size: &str,
        volume_type: VolumeType,
    ) -> Result<Volume, ApiError> {
        let name = VolumeName::new(name)?;
        Ok(self.volumes.create(&name, size, volume_type).await?)
    }

    pub async fn list_volumes(&self) -> Result<Vec<Volume>, ApiError> {
        Ok(self.volumes.list().await)
    }

    pub async fn delete_volume(&self, name: &str) -> Result<(), ApiError> {
        let name = VolumeName::new(name)?;
        Ok(self.volumes.remove(&name).await?)
    }

    pub async fn volume_usage(&self, name: &str) -> Result<(u64, u64), ApiError> {
        let name = VolumeName::new(name)?;
        Ok(self.volumes.usage(&name).await?)
    }
}
