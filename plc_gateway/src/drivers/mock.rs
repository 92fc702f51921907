use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::drivers::traits::{
    DriverConfig, DriverError, DriverResult, PlcDriver, RawValue, ReadBatch,
};

/// Deterministic in-memory driver, selected with `GATEWAY_MOCK_PLC=1`.
///
/// Behaves like a register bank: writes store, reads echo what was stored.
/// Addresses nobody wrote yet are simply absent from the read result, so
/// values created through the REST API survive mock polling untouched.
///
/// The shared `fail_reconnect` flag (seeded from
/// `GATEWAY_MOCK_FAIL_RECONNECT`) makes `connect` fail until cleared, which
/// makes the backoff and health pathways deterministically testable.
pub struct MockDriver {
    config: DriverConfig,
    connected: bool,
    fail_reconnect: Arc<AtomicBool>,
    registers: HashMap<String, RawValue>,
}

impl MockDriver {
    pub fn new(config: DriverConfig, fail_reconnect: Arc<AtomicBool>) -> Self {
        MockDriver {
            config,
            connected: false,
            fail_reconnect,
            registers: HashMap::new(),
        }
    }

    /// Pre-load a register, as prepopulation does for the demo tag set.
    pub fn seed(&mut self, address: impl Into<String>, value: RawValue) {
        self.registers.insert(address.into(), value);
    }

    /// Handle to the reconnect-failure flag; clearing it lets the next
    /// connect attempt succeed.
    pub fn fail_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail_reconnect)
    }
}

#[async_trait]
impl PlcDriver for MockDriver {
    fn config(&self) -> &DriverConfig {
        &self.config
    }

    async fn connect(&mut self) -> DriverResult<()> {
        if self.fail_reconnect.load(Ordering::SeqCst) {
            return Err(DriverError::Connect(
                "mock reconnect failure injected".to_string(),
            ));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn read(&mut self, addresses: &[String]) -> DriverResult<ReadBatch> {
        if !self.connected {
            return Err(DriverError::NotConnected);
        }
        let mut batch = ReadBatch::new();
        for address in addresses {
            if let Some(value) = self.registers.get(address) {
                batch.insert(address.clone(), Ok(value.clone()));
            }
        }
        debug!(plc = %self.config.plc, requested = addresses.len(), returned = batch.len(), "mock read");
        Ok(batch)
    }

    async fn write(&mut self, address: &str, value: &RawValue) -> DriverResult<()> {
        if !self.connected {
            return Err(DriverError::NotConnected);
        }
        self.registers.insert(address.to_string(), value.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::structures::PlcName;
    use std::time::Duration;

    fn mock() -> MockDriver {
        let config = DriverConfig {
            plc: PlcName::Mock,
            endpoint: "mock".to_string(),
            socket_timeout: Duration::from_secs(1),
        };
        MockDriver::new(config, Arc::new(AtomicBool::new(false)))
    }

    #[tokio::test]
    async fn echoes_writes() {
        let mut drv = mock();
        drv.connect().await.unwrap();
        drv.write("N7:0", &RawValue::Int(42)).await.unwrap();

        let batch = drv.read(&["N7:0".to_string()]).await.unwrap();
        assert_eq!(batch["N7:0"], Ok(RawValue::Int(42)));
    }

    #[tokio::test]
    async fn unseeded_addresses_are_absent() {
        let mut drv = mock();
        drv.connect().await.unwrap();
        let batch = drv.read(&["Main.Temp".to_string()]).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn fail_flag_blocks_connect_until_cleared() {
        let config = DriverConfig {
            plc: PlcName::Mock,
            endpoint: "mock".to_string(),
            socket_timeout: Duration::from_secs(1),
        };
        let flag = Arc::new(AtomicBool::new(true));
        let mut drv = MockDriver::new(config, Arc::clone(&flag));

        assert!(drv.connect().await.is_err());
        assert!(!drv.is_connected());

        flag.store(false, Ordering::SeqCst);
        drv.connect().await.unwrap();
        assert!(drv.is_connected());
    }
}
