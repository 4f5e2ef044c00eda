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

use crate::SafeDisplay;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV_VAR: &str = "JOBLET_CONFIG_PATH";

const ENV_PREFIX: &str = "JOBLET__";

pub trait ConfigLoaderConfig:
    Default + Serialize + DeserializeOwned + SafeDisplay + Send + Sync + 'static
{
}

impl<T: Default + Serialize + DeserializeOwned + SafeDisplay + Send + Sync + 'static>
    ConfigLoaderConfig for T
{
}

/// Loads a service config by layering, in increasing precedence:
/// compiled-in defaults, the TOML config file, `JOBLET__` prefixed
/// environment variables.
pub struct ConfigLoader<T: ConfigLoaderConfig> {
    pub config_file_name: PathBuf,
    phantom: PhantomData<T>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        let config_file_name = match std::env::var(CONFIG_PATH_ENV_VAR) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => config_file_name.to_path_buf(),
        };
        ConfigLoader {
            config_file_name,
            phantom: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    /// Loads the config, or dumps the resolved TOML and returns `None`
    /// when `--dump-config` is on the command line. Load failures are
    /// reported on stderr and also yield `None`.
    pub fn load_or_dump_config(&self) -> Option<T> {
        if std::env::args().any(|arg| arg == "--dump-config") {
            let config = self.load().unwrap_or_default();
            match toml::to_string_pretty(&config) {
                Ok(rendered) => println!("{rendered}"),
                Err(err) => eprintln!("Failed to render config: {err}"),
            }
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(err) => {
                    eprintln!(
                        "Failed to load config from {:?}: {err}",
                        self.config_file_name
                    );
                    None
                }
            }
        }
    }
}
