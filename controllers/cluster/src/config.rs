//! Controller configuration.
//!
//! Everything is read from environment variables once at startup and then
//! passed down as plain values. Feature toggles never live in globals.

use crate::error::ControllerError;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const DEFAULT_CLOUD_API_URL: &str = "http://cloud-gateway.kube-system:8080";

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Cloud gateway base URL
    pub cloud_api_url: String,
    /// Bearer token for the cloud gateway
    pub cloud_api_token: String,
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Port published on the control plane endpoint
    pub api_server_port: i32,
    /// Provision the instance state-change queue and rule
    pub enable_instance_state_events: bool,
    /// Bound on the post-create wait for an instance to run
    pub instance_running_timeout: Duration,
    /// Bound on the wait for an instance to terminate
    pub instance_terminate_timeout: Duration,
    /// Port of the probes and metrics server
    pub metrics_port: u16,
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through a variable lookup function
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cloud_api_token = lookup("CLOUD_API_TOKEN")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ControllerError::InvalidConfig("CLOUD_API_TOKEN environment variable is required".to_string())
            })?;

        Ok(Self {
            cloud_api_url: lookup("CLOUD_API_URL").unwrap_or_else(|| DEFAULT_CLOUD_API_URL.to_string()),
            cloud_api_token,
            namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
            api_server_port: parse(&lookup, "API_SERVER_PORT", crds::DEFAULT_API_SERVER_PORT)?,
            enable_instance_state_events: parse_bool(&lookup, "ENABLE_INSTANCE_STATE_EVENTS")?,
            instance_running_timeout: Duration::from_secs(parse(&lookup, "INSTANCE_RUNNING_TIMEOUT_SECS", 60)?),
            instance_terminate_timeout: Duration::from_secs(parse(&lookup, "INSTANCE_TERMINATE_TIMEOUT_SECS", 600)?),
            metrics_port: parse(&lookup, "METRICS_PORT", 8080)?,
        })
    }

    /// Log the effective configuration (the token is never logged)
    pub fn log(&self) {
        info!("Configuration:");
        info!("  Cloud API URL: {}", self.cloud_api_url);
        info!("  Namespace: {}", self.namespace.as_deref().unwrap_or("all namespaces"));
        info!("  API server port: {}", self.api_server_port);
        info!("  Instance state events: {}", self.enable_instance_state_events);
        info!("  Instance running timeout: {:?}", self.instance_running_timeout);
        info!("  Instance terminate timeout: {:?}", self.instance_terminate_timeout);
        info!("  Metrics port: {}", self.metrics_port);
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ControllerError::InvalidConfig(format!("{key} has an invalid value: {raw:?}"))),
        None => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, key: &str) -> Result<bool, ControllerError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" || v.eq_ignore_ascii_case("yes") => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" || v.eq_ignore_ascii_case("no") => Ok(false),
        Some(v) => Err(ControllerError::InvalidConfig(format!("{key} has an invalid value: {v:?}"))),
    }
}
