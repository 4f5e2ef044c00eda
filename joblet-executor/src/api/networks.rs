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
use crate::services::network::{NetworkInfo, NetworkService};
use joblet_common::model::NetworkName;
use std::sync::Arc;

pub struct NetworksApi {
    networks: Arc<dyn NetworkService>,
}

impl NetworksApi {
    pub fn new(networks: Arc<dyn NetworkService>) -> Self {
        NetworksApi { networks }
    }

    pub async fn list_networks(&self) -> Result<Vec<NetworkInfo>, ApiError> {
        Ok(self.networks.list().await)
    }

    pub async fn create_network(&self, name: &str, cidr: &str) -> Result<NetworkInfo, ApiError> {
        let name = NetworkName::new(name)?;
        Ok(self.networks.create(&name, cidr).await?)
    }

    pub async fn delete_network(&self, name: &str) -> Result<(), ApiError> {
        let name = NetworkName::new(name)?;
        Ok(self.networks.delete(&name).await?)
    }
}
