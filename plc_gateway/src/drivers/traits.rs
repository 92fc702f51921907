use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::tags::structures::PlcName;

/// Common configuration for all drivers.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Logical controller this driver serves.
    pub plc: PlcName,
    /// Target endpoint, `ip` or `ip:port` (protocol default port applies).
    pub endpoint: String,
    /// Bound on every socket operation, including connect.
    pub socket_timeout: Duration,
}

/// A value as it comes off the wire, before datatype coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("not connected")]
    NotConnected,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unsupported address: {0}")]
    Address(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Outcome of a batched read: per-address results keyed by address. An
/// address absent from the map produced no data this cycle and leaves the
/// tag untouched; an inner `Err` is a per-tag failure (the tag goes Bad);
/// an outer `Err` from `read` means the connection is broken.
pub type ReadBatch = HashMap<String, DriverResult<RawValue>>;

/// The capability set every PLC protocol driver implements. A driver
/// instance is owned exclusively by its poller; no cross-task sharing.
#[async_trait]
pub trait PlcDriver: Send + Sync {
    /// Get the configuration of this driver instance.
    fn config(&self) -> &DriverConfig;

    /// Connect to the controller. Idempotent; bounded by `socket_timeout`.
    async fn connect(&mut self) -> DriverResult<()>;

    /// Drop the connection. Idempotent; always succeeds.
    async fn disconnect(&mut self);

    /// Read a batch of addresses.
    async fn read(&mut self, addresses: &[String]) -> DriverResult<ReadBatch>;

    /// Write a single address.
    async fn write(&mut self, address: &str, value: &RawValue) -> DriverResult<()>;

    /// Check the connection status.
    fn is_connected(&self) -> bool;
}
