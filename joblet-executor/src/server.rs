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

use anyhow::{anyhow, Context};
use joblet_common::tracing::init_tracing_with_default_env_filter;
use joblet_common::SafeDisplay;
use joblet_executor::bootstrap::Services;
use joblet_executor::config::{make_config_loader, JobletConfig};
use joblet_executor::metrics;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn main() -> anyhow::Result<()> {
    if let Some(config) = make_config_loader().load_or_dump_config() {
        init_tracing_with_default_env_filter(&config.tracing);
        let _registry = metrics::register_all();

        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Failed to build the tokio runtime")?
            .block_on(async_main(config))
    } else {
        Ok(())
    }
}

async fn async_main(config: JobletConfig) -> anyhow::Result<()> {
    info!("Starting joblet executor");
    info!("Configuration:\n{}", config.to_safe_string());

    let shutdown = CancellationToken::new();
    let services = Services::new(&config, shutdown.clone())
        .await
        .map_err(|err| anyhow!(err).context("Service initialization"))?;

    info!(
        grpc_port = config.grpc_port,
        "Execution core ready; control RPC layer may attach"
    );
    let _services = services;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for the shutdown signal")?;
    info!("Shutting down");
    shutdown.cancel();
    // Let the monitor flush and the persistence queue drain.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    Ok(())
}
