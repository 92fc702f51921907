use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::poll::PollSettings;
use crate::tags::structures::PlcName;

/// Gateway configuration, read entirely from environment variables
/// (`GATEWAY_MOCK_PLC`, `COMPACTLOGIX_IP`, `POLL_PERIOD`, ...).
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// 1 = back both controllers with deterministic mock drivers.
    #[serde(default)]
    pub gateway_mock_plc: u8,
    /// 1 = pre-seed the mock drivers with a failing reconnect.
    #[serde(default)]
    pub gateway_mock_fail_reconnect: u8,
    #[serde(default)]
    pub compactlogix_ip: String,
    #[serde(default)]
    pub slc500_ip: String,
    /// Poll period in seconds.
    #[serde(default = "default_poll_period")]
    pub poll_period: f64,
    /// Reconnect backoff base in seconds.
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base: f64,
    /// Reconnect backoff cap in seconds.
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max: f64,
    /// Bound on every driver socket operation, in seconds.
    #[serde(default = "default_socket_timeout")]
    pub plc_socket_timeout: f64,
    /// Written atomically on first entry to Ready, if set.
    #[serde(default)]
    pub ready_file: Option<String>,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    /// Alias for `metrics_port`; `METRICS_PORT` wins when both are set.
    #[serde(default)]
    pub prometheus_port: Option<u16>,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_opcua_port")]
    pub opcua_port: u16,
}

fn default_poll_period() -> f64 {
    1.0
}

fn default_reconnect_base() -> f64 {
    1.0
}

fn default_reconnect_max() -> f64 {
    60.0
}

fn default_socket_timeout() -> f64 {
    2.0
}

fn default_http_port() -> u16 {
    8080
}

fn default_opcua_port() -> u16 {
    4840
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?;
        s.try_deserialize()
    }

    pub fn mock_plc(&self) -> bool {
        self.gateway_mock_plc == 1
    }

    pub fn mock_fail_reconnect(&self) -> bool {
        self.gateway_mock_fail_reconnect == 1
    }

    pub fn metrics_port(&self) -> Option<u16> {
        self.metrics_port.or(self.prometheus_port)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.plc_socket_timeout)
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            poll_period: Duration::from_secs_f64(self.poll_period),
            reconnect_base: self.reconnect_base,
            reconnect_max: self.reconnect_max,
        }
    }

    pub fn ready_file_path(&self) -> Option<PathBuf> {
        self.ready_file
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }

    /// The controllers this process will poll: in mock mode both logical
    /// names backed by mocks, otherwise one per configured `*_IP`.
    pub fn plcs(&self) -> Vec<(PlcName, String)> {
        if self.mock_plc() {
            return vec![
                (PlcName::CompactLogix, "mock".to_string()),
                (PlcName::Slc500, "mock".to_string()),
            ];
        }
        let mut plcs = Vec::new();
        if !self.compactlogix_ip.is_empty() {
            plcs.push((PlcName::CompactLogix, self.compactlogix_ip.clone()));
        }
        if !self.slc500_ip.is_empty() {
            plcs.push((PlcName::Slc500, self.slc500_ip.clone()));
        }
        plcs
    }

    /// Fatal configuration contradictions; an Err here aborts startup.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.poll_period > 0.0) {
            return Err(format!("POLL_PERIOD must be positive, got {}", self.poll_period));
        }
        if !(self.reconnect_base > 0.0) {
            return Err(format!(
                "RECONNECT_BASE must be positive, got {}",
                self.reconnect_base
            ));
        }
        if self.reconnect_max < self.reconnect_base {
            return Err(format!(
                "RECONNECT_MAX ({}) must not be below RECONNECT_BASE ({})",
                self.reconnect_max, self.reconnect_base
            ));
        }
        if !(self.plc_socket_timeout > 0.0) {
            return Err(format!(
                "PLC_SOCKET_TIMEOUT must be positive, got {}",
                self.plc_socket_timeout
            ));
        }
        if self.plcs().is_empty() {
            return Err(
                "real PLC mode requires COMPACTLOGIX_IP or SLC500_IP (or set GATEWAY_MOCK_PLC=1)"
                    .to_string(),
            );
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            gateway_mock_plc: 0,
            gateway_mock_fail_reconnect: 0,
            compactlogix_ip: String::new(),
            slc500_ip: String::new(),
            poll_period: default_poll_period(),
            reconnect_base: default_reconnect_base(),
            reconnect_max: default_reconnect_max(),
            plc_socket_timeout: default_socket_timeout(),
            ready_file: None,
            metrics_port: None,
            prometheus_port: None,
            http_port: default_http_port(),
            opcua_port: default_opcua_port(),
        }
    }
}
