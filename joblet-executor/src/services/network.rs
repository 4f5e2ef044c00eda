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

//! Named networks and per-job address allocation. The executor turns
//! the returned [`NetworkAttachment`] into namespace plumbing; this
//! service only owns the pools.

use crate::platform::NetworkAttachment;
use async_trait::async_trait;
use joblet_common::error::JobletError;
use joblet_common::model::{JobId, JobNetworkAllocation, NetworkName};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkKind {
    Host,
    None,
    Isolated,
    Bridge {
        bridge: String,
        network: Ipv4Addr,
        prefix_len: u8,
    },
}

/// API-facing description of a named network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub name: NetworkName,
    pub kind: String,
    pub cidr: Option<String>,
    pub builtin: bool,
    pub active_allocations: usize,
}

struct NetworkState {
    kind: NetworkKind,
    builtin: bool,
    used_ips: HashSet<Ipv4Addr>,
    allocations: HashMap<JobId, JobNetworkAllocation>,
}

pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), JobletError> {
    let (address, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| JobletError::validation(format!("invalid CIDR: {cidr:?}")))?;
    let address: Ipv4Addr = address
        .parse()
        .map_err(|_| JobletError::validation(format!("invalid CIDR address: {cidr:?}")))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| JobletError::validation(format!("invalid CIDR prefix: {cidr:?}")))?;
    if prefix < 8 || prefix > 30 {
        return Err(JobletError::validation(format!(
            "CIDR prefix must be 8..=30: {cidr:?}"
        )));
    }
    let mask = u32::MAX << (32 - prefix);
    Ok((Ipv4Addr::from(u32::from(address) & mask), prefix))
}

#[async_trait]
pub trait NetworkService: Send + Sync {
    /// Resolves the requested network into an attachment, allocating
    /// an address for bridged networks. `None` means the `none`
    /// network.
    async fn attach(
        &self,
        name: Option<&NetworkName>,
        job_id: &JobId,
    ) -> Result<NetworkAttachment, JobletError>;
    /// Releases whatever `job_id` holds; safe to call twice.
    async fn release(&self, job_id: &JobId);
    async fn list(&self) -> Vec<NetworkInfo>;
    async fn create(&self, name: &NetworkName, cidr: &str) -> Result<NetworkInfo, JobletError>;
    async fn delete(&self, name: &NetworkName) -> Result<(), JobletError>;
}

pub struct NetworkServiceDefault {
    networks: RwLock<HashMap<NetworkName, NetworkState>>,
}

impl NetworkServiceDefault {
    /// `definitions` comes from config; the four built-ins are always
    /// present.
    pub fn new(definitions: Vec<(NetworkName, NetworkKind)>) -> Self {
        let mut networks = HashMap::new();
        for (name, kind, builtin) in [
            ("host", NetworkKind::Host, true),
            ("none", NetworkKind::None, true),
            ("isolated", NetworkKind::Isolated, true),
        ]
        .into_iter()
        .map(|(n, k, b)| (NetworkName::new(n).unwrap(), k, b))
        {
            networks.insert(
                name,
                NetworkState {
                    kind,
                    builtin,
                    used_ips: HashSet::new(),
                    allocations: HashMap::new(),
                },
            );
        }
        for (name, kind) in definitions {
            networks.insert(
                name,
                NetworkState {
                    kind,
                    builtin: true,
                    used_ips: HashSet::new(),
                    allocations: HashMap::new(),
                },
            );
        }
        NetworkServiceDefault {
            networks: RwLock::new(networks),
        }
    }

    fn random_mac() -> String {
        let mut rng = rand::rng();
        // Locally administered, unicast.
        format!(
            "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            rng.random::<u8>(),
            rng.random::<u8>(),
            rng.random::<u8>(),
            rng.random::<u8>(),
            rng.random::<u8>()
        )
    }

    fn allocate_ip(
        network: Ipv4Addr,
        prefix_len: u8,
        used: &HashSet<Ipv4Addr>,
    ) -> Option<(Ipv4Addr, Ipv4Addr)> {
        let base = u32::from(network);
        let size = 1u32 << (32 - prefix_len);
        let gateway = Ipv4Addr::from(base + 1);
        // Skip network, gateway and broadcast addresses.
        for offset in 2..size - 1 {
            let candidate = Ipv4Addr::from(base + offset);
            if !used.contains(&candidate) {
                return Some((candidate, gateway));
            }
        }
        None
    }
}

#[async_trait]
impl NetworkService for NetworkServiceDefault {
    async fn attach(
        &self,
        name: Option<&NetworkName>,
        job_id: &JobId,
    ) -> Result<NetworkAttachment, JobletError> {
        let none = NetworkName::new("none").unwrap();
        let name = name.unwrap_or(&none);
        let mut networks = self.networks.write().await;
        let state = networks
            .get_mut(name)
            .ok_or_else(|| JobletError::not_found("network", name))?;

        match state.kind.clone() {
            NetworkKind::Host => Ok(NetworkAttachment::Host),
            NetworkKind::None => Ok(NetworkAttachment::None),
            NetworkKind::Isolated => Ok(NetworkAttachment::Isolated),
            NetworkKind::Bridge {
                bridge,
                network,
                prefix_len,
            } => {
                let (ip, gateway) = Self::allocate_ip(network, prefix_len, &state.used_ips)
                    .ok_or_else(|| {
                        JobletError::resource_exhausted(format!(
                            "network {name} has no free addresses"
                        ))
                    })?;
                let allocation = JobNetworkAllocation {
                    job_id: *job_id,
                    network: name.clone(),
                    ip,
                    prefix_len,
                    gateway: Some(gateway),
                    mac: Self::random_mac(),
                    veth_host: format!("vj{}", &job_id.0.simple().to_string()[..8]),
                };
                state.used_ips.insert(ip);
                state.allocations.insert(*job_id, allocation.clone());
                debug!(job_id = %job_id, network = %name, ip = %ip, "Allocated job network address");
                Ok(NetworkAttachment::Bridged { bridge, allocation })
            }
        }
    }

    async fn release(&self, job_id: &JobId) {
        let mut networks = self.networks.write().await;
        for state in networks.values_mut() {
            if let Some(allocation) = state.allocations.remove(job_id) {
                state.used_ips.remove(&allocation.ip);
                debug!(job_id = %job_id, ip = %allocation.ip, "Released job network address");
            }
        }
    }

    async fn list(&self) -> Vec<NetworkInfo> {
        let networks = self.networks.read().await;
        let mut result: Vec<NetworkInfo> = networks
            .iter()
            .map(|(name, state)| NetworkInfo {
                name: name.clone(),
                kind: match &state.kind {
                    NetworkKind::Host => "host".to_string(),
                    NetworkKind::None => "none".to_string(),
                    NetworkKind::Isolated => "isolated".to_string(),
                    NetworkKind::Bridge { .. } => "bridge".to_string(),
                },
                cidr: match &state.kind {
                    NetworkKind::Bridge {
                        network,
                        prefix_len,
                        ..
                    } => Some(format!("{network}/{prefix_len}")),
                    _ => None,
                },
                builtin: state.builtin,
                active_allocations: state.allocations.len(),
            })
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }

    async fn create(&self, name: &NetworkName, cidr: &str) -> Result<NetworkInfo, JobletError> {
        let (network, prefix_len) = parse_cidr(cidr)?;
        let mut networks = self.networks.write().await;
        if networks.contains_key(name) {
            return Err(JobletError::already_exists("network", name));
        }
        networks.insert(
            name.clone(),
            NetworkState {
                kind: NetworkKind::Bridge {
                    bridge: format!("jb-{name}"),
                    network,
                    prefix_len,
                },
                builtin: false,
                used_ips: HashSet::new(),
                allocations: HashMap::new(),
            },
        );
        info!(network = %name, cidr, "Network created");
        Ok(NetworkInfo {
            name: name.clone(),
            kind: "bridge".to_string(),
            cidr: Some(format!("{network}/{prefix_len}")),
            builtin: false,
            active_allocations: 0,
        })
    }

    async fn delete(&self, name: &NetworkName) -> Result<(), JobletError> {
        let mut networks = self.networks.write().await;
        let state = networks
            .get(name)
            .ok_or_else(|| JobletError::not_found("network", name))?;
        if state.builtin {
            return Err(JobletError::validation(format!(
                "network {name} is built in and cannot be deleted"
            )));
        }
        if !state.allocations.is_empty() {
            return Err(JobletError::conflict(format!(
                "network {name} has {} active allocation(s)",
                state.allocations.len()
            )));
        }
        networks.remove(name);
        info!(network = %name, "Network deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblet_common::error::ErrorKind;
    use test_r::test;

    fn bridge_definitions() -> Vec<(NetworkName, NetworkKind)> {
        vec![(
            NetworkName::new("bridge").unwrap(),
            NetworkKind::Bridge {
                bridge: "joblet0".to_string(),
                network: Ipv4Addr::new(172, 30, 0, 0),
                prefix_len: 24,
            },
        )]
    }

    #[test]
    async fn host_and_none_skip_allocation() {
        let service = NetworkServiceDefault::new(bridge_definitions());
        let job_id = JobId::new_v4();
        let host = service
            .attach(Some(&NetworkName::new("host").unwrap()), &job_id)
            .await
            .unwrap();
        assert_eq!(host, NetworkAttachment::Host);
        let default = service.attach(None, &job_id).await.unwrap();
        assert_eq!(default, NetworkAttachment::None);
    }

    #[test]
    async fn bridged_jobs_get_unique_addresses() {
        let service = NetworkServiceDefault::new(bridge_definitions());
        let bridge = NetworkName::new("bridge").unwrap();
        let first_job = JobId::new_v4();
        let second_job = JobId::new_v4();

        let first = service.attach(Some(&bridge), &first_job).await.unwrap();
        let second = service.attach(Some(&bridge), &second_job).await.unwrap();
        let (NetworkAttachment::Bridged { allocation: a, .. },
             NetworkAttachment::Bridged { allocation: b, .. }) = (first, second)
        else {
            panic!("expected bridged attachments");
        };
        assert_ne!(a.ip, b.ip);
        assert_eq!(a.gateway, Some(Ipv4Addr::new(172, 30, 0, 1)));
        assert!(a.mac.starts_with("02:"));

        service.release(&first_job).await;
        let third = service.attach(Some(&bridge), &JobId::new_v4()).await.unwrap();
        let NetworkAttachment::Bridged { allocation: c, .. } = third else {
            panic!("expected bridged attachment");
        };
        assert_eq!(c.ip, a.ip, "released addresses are reused");
    }

    #[test]
    async fn pool_exhaustion_is_resource_exhausted() {
        let service = NetworkServiceDefault::new(vec![(
            NetworkName::new("tiny").unwrap(),
            NetworkKind::Bridge {
                bridge: "tiny0".to_string(),
                network: Ipv4Addr::new(10, 9, 8, 0),
                prefix_len: 30,
            },
        )]);
        let name = NetworkName::new("tiny").unwrap();
        // /30 has a single usable non-gateway host address.
        service.attach(Some(&name), &JobId::new_v4()).await.unwrap();
        let error = service
            .attach(Some(&name), &JobId::new_v4())
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::ResourceExhausted);
    }

    #[test]
    async fn user_networks_can_be_created_and_deleted() {
        let service = NetworkServiceDefault::new(bridge_definitions());
        let name = NetworkName::new("team-a").unwrap();
        service.create(&name, "10.42.0.0/24").await.unwrap();
        assert_eq!(
            service.create(&name, "10.42.0.0/24").await.unwrap_err().kind,
            ErrorKind::AlreadyExists
        );

        let job_id = JobId::new_v4();
        service.attach(Some(&name), &job_id).await.unwrap();
        assert_eq!(
            service.delete(&name).await.unwrap_err().kind,
            ErrorKind::Conflict
        );
        service.release(&job_id).await;
        service.delete(&name).await.unwrap();

        assert_eq!(
            service
                .delete(&NetworkName::new("host").unwrap())
                .await
                .unwrap_err()
                .kind,
            ErrorKind::Validation
        );
    }
}
