//! Protocol name to device factory mapping
//!
//! Build one registry per port: the Modbus TCP factory shares a single
//! transaction counter between every device it creates.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicU16;
use std::sync::Arc;

use super::{Device, DeviceId, ModbusDevice};
use crate::config::DeviceConfig;
use crate::error::{Result, SerialError};
use crate::modbus::{RtuTraits, TcpTraits};

pub const MODBUS_RTU: &str = "modbus";
pub const MODBUS_TCP: &str = "modbus_tcp";

pub type DeviceFactory =
    Box<dyn Fn(DeviceId, &DeviceConfig) -> Result<Box<dyn Device>> + Send + Sync>;

#[derive(Default)]
pub struct ProtocolRegistry {
    factories: HashMap<String, DeviceFactory>,
}

impl ProtocolRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with Modbus RTU and Modbus TCP
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(MODBUS_RTU, |id, config| {
            let traits = RtuTraits::new(config.force_frame_timeout);
            Ok(Box::new(ModbusDevice::new(id, config.clone(), Box::new(traits))?) as Box<dyn Device>)
        });
        let transaction_id = Arc::new(AtomicU16::new(0));
        registry.register(MODBUS_TCP, move |id, config| {
            let traits = TcpTraits::new(Arc::clone(&transaction_id));
            Ok(Box::new(ModbusDevice::new(id, config.clone(), Box::new(traits))?) as Box<dyn Device>)
        });
        registry
    }

    /// Add or replace a protocol
    pub fn register<F>(&mut self, protocol: impl Into<String>, factory: F)
    where
        F: Fn(DeviceId, &DeviceConfig) -> Result<Box<dyn Device>> + Send + Sync + 'static,
    {
        self.factories.insert(protocol.into(), Box::new(factory));
    }

    pub fn contains(&self, protocol: &str) -> bool {
        self.factories.contains_key(protocol)
    }

    pub fn protocols(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn create(&self, id: DeviceId, config: &DeviceConfig) -> Result<Box<dyn Device>> {
        let factory = self.factories.get(&config.protocol).ok_or_else(|| {
            SerialError::config(format!(
                "unknown protocol '{}' for device '{}'",
                config.protocol, config.name
            ))
        })?;
        factory(id, config)
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &self.protocols())
            .finish()
    }
}
