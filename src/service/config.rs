use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::network::DEFAULT_PORT;

pub const ENV_PREFIX: &str = "STONEWIRE";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// Upper bound for a single `send` when the caller gives none.
    pub send_timeout_ms: u64,
    /// Accept errors are retried with doubling backoff until it passes this ceiling.
    pub max_accept_backoff_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            send_timeout_ms: 5000,
            max_accept_backoff_secs: 64,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoneWireConfig {
    pub network: NetworkConfig,
}

impl StoneWireConfig {
    /// Load configuration from a file, letting `STONEWIRE__SECTION__KEY` variables override it.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<StoneWireConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let server_config: StoneWireConfig = config.try_deserialize()?;
        server_config.validate()?;
        Ok(server_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.ip.is_empty() {
            return Err(AppError::InvalidValue("network.ip is empty".to_string()));
        }
        if self.network.send_timeout_ms == 0 {
            return Err(AppError::InvalidValue(
                "network.send_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
