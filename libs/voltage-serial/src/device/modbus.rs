//! Modbus slave behind the [`Device`] trait

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Device, DeviceId, DeviceState, DisconnectPolicy};
use crate::config::DeviceConfig;
use crate::error::{Result, SerialError};
use crate::modbus::{self, ModbusContext, ModbusTraits, RegisterCache, RequestTiming};
use crate::port::Port;
use crate::range::RegisterRange;
use crate::register::{Register, RegisterConfig};

/// Setup register with its converted value
#[derive(Debug, Clone)]
struct SetupItem {
    name: String,
    config: RegisterConfig,
    raw: u64,
}

pub struct ModbusDevice {
    id: DeviceId,
    config: DeviceConfig,
    state: DeviceState,
    traits: Box<dyn ModbusTraits>,
    cache: RegisterCache,
    setup: Vec<SetupItem>,
}

impl ModbusDevice {
    pub fn new(id: DeviceId, config: DeviceConfig, traits: Box<dyn ModbusTraits>) -> Result<Self> {
        let mut setup = Vec::with_capacity(config.setup.len());
        for item in &config.setup {
            let reg_config = item.to_register_config()?;
            modbus::validate_register(&reg_config)?;
            let raw = reg_config.to_raw(&item.value)?;
            setup.push(SetupItem {
                name: item.name.clone(),
                config: reg_config,
                raw,
            });
        }
        let state = DeviceState::new(config.name.clone(), DisconnectPolicy::from_config(&config));
        Ok(Self {
            id,
            config,
            state,
            traits,
            cache: RegisterCache::new(),
            setup,
        })
    }

    fn timing(&self) -> RequestTiming {
        RequestTiming {
            response_timeout: self.config.response_timeout(),
            frame_timeout: self.config.frame_timeout(),
            request_delay: self.config.request_delay(),
        }
    }

    /// Read-modify-write cache, exposed for inspection
    pub fn cache(&self) -> &RegisterCache {
        &self.cache
    }

    async fn write_setup(&mut self, port: &mut dyn Port) -> Result<()> {
        let timing = self.timing();
        for item in &self.setup {
            let mut ctx = ModbusContext {
                traits: self.traits.as_ref(),
                port: &mut *port,
                slave_id: self.config.slave_id,
                timing,
            };
            match modbus::write_register(&mut ctx, &item.config, item.raw, &mut self.cache).await {
                Ok(()) => debug!("[{}] setup item '{}' written", self.config.name, item.name),
                // the device answered, it just refuses this item
                Err(e) if e.is_permanent() => warn!(
                    "[{}] setup item '{}' rejected: {}",
                    self.config.name, item.name, e
                ),
                Err(e) => {
                    return Err(SerialError::session(format!(
                        "setup item '{}' failed: {}",
                        item.name, e
                    )));
                },
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Device for ModbusDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn state(&self) -> &DeviceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut DeviceState {
        &mut self.state
    }

    fn validate_register(&self, config: &RegisterConfig) -> Result<()> {
        modbus::validate_register(config)
    }

    async fn prepare(&mut self, port: &mut dyn Port) -> Result<()> {
        port.sleep_since_last_interaction(self.config.frame_timeout()).await;
        if self.state.is_connected() || self.setup.is_empty() {
            return Ok(());
        }
        let result = self.write_setup(port).await;
        self.state.set_transfer_result(result.is_ok(), Instant::now());
        result
    }

    async fn read_register_range(&mut self, port: &mut dyn Port, range: &mut RegisterRange) {
        let started = Instant::now();
        let quiet = self.state.is_disconnected();
        let timing = self.timing();
        let mut supports_holes = self.state.supports_holes();
        let ok = {
            let mut ctx = ModbusContext {
                traits: self.traits.as_ref(),
                port,
                slave_id: self.config.slave_id,
                timing,
            };
            modbus::read_register_range(&mut ctx, range, &mut self.cache, &mut supports_holes, quiet)
                .await
        };
        if !supports_holes {
            *self.state.supports_holes_mut() = false;
        }
        let now = Instant::now();
        self.state.record_request_duration(now.saturating_duration_since(started));
        self.state.set_transfer_result(ok, now);
    }

    async fn write_register(&mut self, port: &mut dyn Port, reg: &Register, raw: u64) -> Result<()> {
        let timing = self.timing();
        let result = {
            let mut ctx = ModbusContext {
                traits: self.traits.as_ref(),
                port,
                slave_id: self.config.slave_id,
                timing,
            };
            modbus::write_register(&mut ctx, reg.config(), raw, &mut self.cache).await
        };
        // an exception is still an answer
        let answered = match &result {
            Ok(()) => true,
            Err(e) => e.is_permanent(),
        };
        self.state.set_transfer_result(answered, Instant::now());
        result
    }
}
