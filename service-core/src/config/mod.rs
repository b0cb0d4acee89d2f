use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;

/// Listener settings shared by every binary in the workspace.
///
/// Layered from an optional `configuration.*` file and `APP__` prefixed
/// environment variables, e.g. `APP__PORT=9000`.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, AppError> {
        format!("{}:{}", self.host, self.port).parse().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!(
                "invalid listen address {}:{}: {}",
                self.host,
                self.port,
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_listens_on_all_interfaces() {
        let config = ServerConfig::default();
        let addr = config.socket_addr().unwrap();
        assert_eq!(addr.port(), 8081);
        assert!(addr.ip().is_unspecified());
    }

    #[test]
    fn bad_host_is_a_config_error() {
        let config = ServerConfig {
            host: "not a host".to_string(),
            port: 1,
        };
        assert!(matches!(
            config.socket_addr(),
            Err(AppError::ConfigError(_))
        ));
    }
}
