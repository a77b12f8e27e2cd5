use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::supervisor::Supervisor;

const DEFAULT_PORT: u16 = 27017;

/// Entry point: validates a configuration once and spawns one supervisor
/// per endpoint.
#[derive(Clone)]
pub struct Driver {
    config: Arc<Config>,
}

impl Driver {
    pub fn new(config: Config) -> Result<Driver> {
        config.validate()?;
        Ok(Driver {
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts a supervisor for `endpoint` (`host` or `host:port`; the port
    /// defaults to 27017). Connections are opened on demand.
    pub fn connect(&self, endpoint: &str) -> Result<Supervisor> {
        let endpoint = normalize_endpoint(endpoint)?;
        tracing::debug!(%endpoint, "starting supervisor");
        Ok(Supervisor::spawn(endpoint, self.config.clone()))
    }
}

fn normalize_endpoint(endpoint: &str) -> Result<String> {
    if endpoint.is_empty() {
        return Err(Error::Config("endpoint cannot be empty".to_string()));
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(Error::Config(format!(
                    "endpoint '{endpoint}' is missing a host"
                )));
            }
            if port.parse::<u16>().is_err() {
                return Err(Error::Config(format!(
                    "endpoint '{endpoint}' has an invalid port"
                )));
            }
            Ok(endpoint.to_string())
        }
        None => Ok(format!("{endpoint}:{DEFAULT_PORT}")),
    }
}
