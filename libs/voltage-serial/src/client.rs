//! Serial client loop
//!
//! ```text
//!   cycle()
//!     │ port closed? ── open_if_allowed ── refused ──► closed port cycle
//!     ▼                                               (fail writes, rpcs,
//!   wait for poll ◄── ClientHandle (writes, rpcs)      due registers)
//!     │  flush writes, run rpcs
//!     ▼
//!   accumulate one device range (Scheduler + RangeBuilder)
//!     ▼
//!   prepare to access ── end previous session, prepare
//!     ▼
//!   read range ── callbacks ── reschedule ── rate limiter / balancer
//!     ▼
//!   close_if_needed
//! ```
//!
//! The loop is the only user of the port. Other tasks talk to it through a
//! [`ClientHandle`].

pub mod handle;
pub mod rpc;
mod writes;

pub use handle::ClientHandle;
pub use rpc::RawRequest;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClientSettings, DeviceConfig, PortOpenCloseSettings, SerialServiceConfig};
use crate::device::{log_end_session_error, ConnectionState, Device, DeviceId, ProtocolRegistry};
use crate::error::{Result, SerialError};
use crate::port::Port;
use crate::range::RegisterRange;
use crate::register::{Availability, ErrorState, Register, RegisterConfig, RegisterStore};
use crate::scheduler::{
    AccumulationPolicy, Priority, RateLimiter, ScheduledRegister, Scheduler, SelectionPolicy,
};
use crate::session::PortSession;
use handle::Shared;
use writes::{WriteQueue, WriteRetry};

/// Offset of low priority registers without a rate limit
const MIN_LOW_PRIORITY_INTERVAL: Duration = Duration::from_micros(1);

pub type ReadCallback = Box<dyn Fn(&Arc<Register>) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&Arc<Register>, ErrorState) + Send + Sync>;
pub type DeviceStateCallback = Box<dyn Fn(DeviceId, ConnectionState) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_read: Option<ReadCallback>,
    on_error: Option<ErrorCallback>,
    on_device_state: Option<DeviceStateCallback>,
}

impl Callbacks {
    /// Report the register through on_read or on_error depending on its state
    fn report(&self, reg: &Arc<Register>) {
        let errors = reg.errors();
        if errors.has_io_error() {
            if let Some(cb) = &self.on_error {
                cb(reg, errors);
            }
        } else if let Some(cb) = &self.on_read {
            cb(reg);
        }
    }

    fn report_error(&self, reg: &Arc<Register>) {
        if let Some(cb) = &self.on_error {
            cb(reg, reg.errors());
        }
    }
}

fn priority_of(config: &RegisterConfig) -> Priority {
    if config.is_high_priority() {
        Priority::High
    } else {
        Priority::Low
    }
}

/// Polling engine for the devices sharing one port
pub struct SerialClient {
    port: Box<dyn Port>,
    session: PortSession,
    settings: ClientSettings,
    devices: Vec<Box<dyn Device>>,
    store: RegisterStore,
    scheduler: Scheduler<ScheduledRegister>,
    rate_limiter: RateLimiter,
    rate_limit_warned: bool,
    /// Registers the device refused, polled again after a reconnect
    excluded: HashMap<DeviceId, Vec<Arc<Register>>>,
    last_accessed: Option<DeviceId>,
    writes: WriteQueue,
    shared: Arc<Shared>,
    callbacks: Callbacks,
    active: bool,
}

impl SerialClient {
    pub fn new(port: Box<dyn Port>, settings: ClientSettings, open_close: PortOpenCloseSettings) -> Self {
        let scheduler = Scheduler::new(settings.max_low_priority_lag());
        let rate_limiter = RateLimiter::new(settings.read_rate_limit as usize);
        Self {
            port,
            session: PortSession::new(open_close),
            settings,
            devices: Vec::new(),
            store: RegisterStore::new(),
            scheduler,
            rate_limiter,
            rate_limit_warned: false,
            excluded: HashMap::new(),
            last_accessed: None,
            writes: WriteQueue::default(),
            shared: Arc::new(Shared::default()),
            callbacks: Callbacks::default(),
            active: false,
        }
    }

    /// Build a client with every device and register of `config`
    pub fn from_config(config: &SerialServiceConfig, registry: &ProtocolRegistry) -> Result<Self> {
        config.validate()?;
        let mut client = Self::new(
            config.port.create_port(),
            config.client.clone(),
            config.port_open_close.clone(),
        );
        for device_config in &config.devices {
            let id = client.add_device(registry, device_config.clone())?;
            for register in &device_config.registers {
                client.add_register(id, register.to_register_config()?)?;
            }
        }
        Ok(client)
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle::new(Arc::clone(&self.shared))
    }

    pub fn on_read<F>(&mut self, callback: F)
    where
        F: Fn(&Arc<Register>) + Send + Sync + 'static,
    {
        self.callbacks.on_read = Some(Box::new(callback));
    }

    pub fn on_error<F>(&mut self, callback: F)
    where
        F: Fn(&Arc<Register>, ErrorState) + Send + Sync + 'static,
    {
        self.callbacks.on_error = Some(Box::new(callback));
    }

    pub fn on_device_state<F>(&mut self, callback: F)
    where
        F: Fn(DeviceId, ConnectionState) + Send + Sync + 'static,
    {
        self.callbacks.on_device_state = Some(Box::new(callback));
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn port(&self) -> &dyn Port {
        self.port.as_ref()
    }

    pub fn device(&self, id: DeviceId) -> Option<&dyn Device> {
        self.devices.get(id.0).map(|d| &**d)
    }

    pub fn registers(&self) -> impl Iterator<Item = &Arc<Register>> {
        self.store.iter()
    }

    /// Number of writes waiting for the bus
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    pub fn add_device(&mut self, registry: &ProtocolRegistry, config: DeviceConfig) -> Result<DeviceId> {
        if self.active {
            return Err(SerialError::setup("devices can't be added after activation"));
        }
        let duplicate = self.devices.iter().any(|d| {
            d.config().protocol == config.protocol && d.config().slave_id == config.slave_id
        });
        if duplicate {
            return Err(SerialError::setup(format!(
                "duplicate slave id {} for protocol {}",
                config.slave_id, config.protocol
            )));
        }
        let id = DeviceId(self.devices.len());
        let device = registry.create(id, &config)?;
        debug!("device {} '{}' added", id, config.name);
        self.devices.push(device);
        Ok(id)
    }

    pub fn add_register(&mut self, device: DeviceId, config: RegisterConfig) -> Result<Arc<Register>> {
        if self.active {
            return Err(SerialError::setup("registers can't be added after activation"));
        }
        let Some(dev) = self.devices.get(device.0) else {
            return Err(SerialError::setup(format!("unknown device {device}")));
        };
        dev.validate_register(&config)?;
        let (register, created) = self.store.intern(device, config);
        if !created {
            return Err(SerialError::setup(format!("duplicate register {register}")));
        }
        Ok(register)
    }

    /// Freeze the register set and schedule the first read of every register
    pub fn activate(&mut self) -> Result<()> {
        if self.active {
            return Ok(());
        }
        if self.store.is_empty() {
            return Err(SerialError::setup("no registers defined"));
        }
        let now = Instant::now();
        for reg in self.store.iter() {
            self.scheduler
                .add_entry(ScheduledRegister(Arc::clone(reg)), now, Priority::High);
        }
        self.scheduler.reset_load_balancing();
        self.active = true;
        info!(
            "Serial client activated: {} devices, {} registers on {}",
            self.devices.len(),
            self.store.len(),
            self.port.description()
        );
        Ok(())
    }

    /// Repeat [`cycle`](Self::cycle) until `cancel` fires, then close the port
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        self.activate()?;
        while !cancel.is_cancelled() {
            self.cycle().await?;
        }
        self.end_current_session().await;
        self.port.close().await;
        info!("Serial client stopped: {}", self.port.description());
        Ok(())
    }

    /// One iteration of the loop
    pub async fn cycle(&mut self) -> Result<()> {
        if !self.active {
            return Err(SerialError::setup("client is not active"));
        }
        let open = match self
            .session
            .open_if_allowed(self.port.as_mut(), Instant::now())
            .await
        {
            Ok(open) => open,
            Err(e) => {
                debug!("Port still closed: {}", e);
                false
            },
        };
        if open {
            self.open_port_cycle().await;
        } else {
            self.closed_port_cycle().await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Closed port
    // ------------------------------------------------------------------

    async fn closed_port_cycle(&mut self) {
        self.last_accessed = None;
        let now = Instant::now();
        let mut wake = now + self.settings.closed_port_cycle_time();
        if let Some(deadline) = self.scheduler.deadline() {
            wake = wake.min(deadline);
        }
        if wake > now {
            self.shared.wait(wake).await;
        }

        self.writes.merge(self.shared.take_writes());
        for write in self.writes.drain() {
            write.register.set_error(ErrorState::WRITE_ERROR);
            self.callbacks.report_error(&write.register);
        }
        for rpc in self.shared.take_rpcs() {
            let err = SerialError::port(format!("{} is not open", self.port.description()));
            if rpc.reply.send(Err(err)).is_err() {
                debug!("RPC requester is gone");
            }
        }

        let now = Instant::now();
        let mut due = Vec::new();
        while self
            .scheduler
            .accumulate_next(now, SelectionPolicy::All, |entry, _, _| {
                due.push(Arc::clone(entry.register()));
                true
            })
            .is_some()
        {}

        let mut failed_devices = Vec::new();
        for reg in &due {
            reg.set_error(ErrorState::READ_ERROR);
            self.callbacks.report_error(reg);
            self.reschedule(reg, now);
            if !failed_devices.contains(&reg.device()) {
                failed_devices.push(reg.device());
            }
        }
        for id in failed_devices {
            if let Some(device) = self.devices.get_mut(id.0) {
                device.state_mut().set_transfer_result(false, now);
            }
            self.handle_state_change(id, now);
        }
    }

    // ------------------------------------------------------------------
    // Open port
    // ------------------------------------------------------------------

    async fn open_port_cycle(&mut self) {
        self.wait_for_poll_and_flush().await;

        let now = Instant::now();
        let policy = self.selection_policy(now);
        let Some((priority, mut range)) = self.accumulate_range(now, policy) else {
            return;
        };
        let Some(id) = range.device() else {
            return;
        };

        let poll_start = Instant::now();
        match self.prepare_to_access(id).await {
            Ok(()) => {
                let device = &mut self.devices[id.0];
                device.read_register_range(self.port.as_mut(), &mut range).await;
            },
            Err(e) => {
                warn!("[{}] prepare failed: {}", self.devices[id.0].name(), e);
                for reg in range.registers() {
                    reg.set_error(ErrorState::READ_ERROR);
                }
            },
        }

        let finished = Instant::now();
        for reg in range.registers() {
            reg.set_last_poll_time(poll_start);
            self.callbacks.report(reg);
            self.reschedule(reg, poll_start);
            if priority == Priority::Low {
                self.rate_limiter.new_item(finished);
            }
        }
        self.scheduler
            .update_selection_time(finished.saturating_duration_since(poll_start), priority);

        self.handle_state_change(id, finished);
        let disconnected = !self.devices[id.0].state().is_connected();
        self.session
            .close_if_needed(self.port.as_mut(), disconnected, finished)
            .await;
    }

    fn selection_policy(&mut self, now: Instant) -> SelectionPolicy {
        if self.rate_limiter.is_over_limit(now) {
            if !self.rate_limit_warned {
                warn!("Register read rate limit is exceeded");
                self.rate_limit_warned = true;
            }
            SelectionPolicy::OnlyHighPriority
        } else {
            SelectionPolicy::All
        }
    }

    /// Deadline of the next poll, low priority deferred while rate limited
    fn next_poll_deadline(&self, now: Instant) -> Option<Instant> {
        if !self.rate_limiter.is_over_limit(now) {
            return self.scheduler.deadline();
        }
        let high = self.scheduler.high_priority_deadline();
        let low = match (self.scheduler.low_priority_deadline(), self.rate_limiter.window_end()) {
            (Some(low), Some(window_end)) => Some(low.max(window_end)),
            (low, _) => low,
        };
        match (high, low) {
            (Some(high), Some(low)) => Some(high.min(low)),
            (high, low) => high.or(low),
        }
    }

    async fn wait_for_poll_and_flush(&mut self) {
        let cap = Instant::now() + self.settings.max_poll_time();
        loop {
            let now = Instant::now();
            let deadline = self.next_poll_deadline(now).map_or(cap, |d| d.min(cap));
            if deadline <= now {
                self.process_rpcs().await;
                self.flush(Some(self.settings.max_flushes_when_poll_is_due)).await;
                return;
            }
            if self.shared.wait(deadline).await {
                self.process_rpcs().await;
                self.flush(None).await;
            }
        }
    }

    /// Collect registers of one device into a range
    fn accumulate_range(&mut self, now: Instant, policy: SelectionPolicy) -> Option<(Priority, RegisterRange)> {
        let devices = &self.devices;
        let port = self.port.as_ref();
        let max_poll_time = self.settings.max_poll_time();
        let mut range: Option<RegisterRange> = None;
        let mut skipped = Vec::new();

        let priority = self.scheduler.accumulate_next(now, policy, |entry, accumulation, limit| {
            let reg = entry.register();
            if reg.availability() == Availability::Unavailable {
                skipped.push(Arc::clone(reg));
                return true;
            }
            let Some(device) = devices.get(reg.device().0) else {
                return false;
            };
            let range = range.get_or_insert_with(|| device.create_register_range());
            let poll_limit = match accumulation {
                AccumulationPolicy::Force => None,
                AccumulationPolicy::AccordingToPollLimit => {
                    Some(limit.map_or(max_poll_time, |l| l.min(max_poll_time)))
                },
            };
            range.add(reg, port, poll_limit)
        });

        for reg in skipped {
            self.excluded.entry(reg.device()).or_default().push(reg);
        }
        let priority = priority?;
        let range = range.filter(|r| !r.is_empty())?;
        Some((priority, range))
    }

    fn reschedule(&mut self, reg: &Arc<Register>, poll_start: Instant) {
        if reg.availability() == Availability::Unavailable {
            debug!("{} excluded from polling", reg);
            self.excluded
                .entry(reg.device())
                .or_default()
                .push(Arc::clone(reg));
            return;
        }
        let config = reg.config();
        let (deadline, priority) = match config.read_period {
            Some(period) => (poll_start + period, Priority::High),
            None => (
                poll_start + config.read_rate_limit.unwrap_or(MIN_LOW_PRIORITY_INTERVAL),
                Priority::Low,
            ),
        };
        self.scheduler
            .add_entry(ScheduledRegister(Arc::clone(reg)), deadline, priority);
    }

    /// Forward a device state change; a disconnect invalidates its registers
    fn handle_state_change(&mut self, id: DeviceId, now: Instant) {
        let Some(device) = self.devices.get_mut(id.0) else {
            return;
        };
        let Some(state) = device.state_mut().take_state_change() else {
            return;
        };
        if state == ConnectionState::Disconnected {
            for reg in self.store.for_device(id) {
                reg.set_availability(Availability::Unknown);
            }
            for reg in self.excluded.remove(&id).unwrap_or_default() {
                let priority = priority_of(reg.config());
                self.scheduler
                    .add_entry(ScheduledRegister(reg), now, priority);
            }
        }
        if let Some(cb) = &self.callbacks.on_device_state {
            cb(id, state);
        }
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    async fn end_current_session(&mut self) {
        let Some(last) = self.last_accessed.take() else {
            return;
        };
        let device = &mut self.devices[last.0];
        if let Err(e) = device.end_session(self.port.as_mut()).await {
            log_end_session_error(&**device, &e);
        }
    }

    async fn prepare_to_access(&mut self, id: DeviceId) -> Result<()> {
        let changed = self.last_accessed != Some(id);
        if changed {
            self.end_current_session().await;
            self.last_accessed = Some(id);
        }
        let device = &mut self.devices[id.0];
        if changed || !device.state().is_connected() {
            device.prepare(self.port.as_mut()).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Writes and raw requests
    // ------------------------------------------------------------------

    /// Write queued values, at most `limit` attempts when given
    async fn flush(&mut self, limit: Option<usize>) {
        self.writes.merge(self.shared.take_writes());
        let mut retry = Vec::new();
        let mut attempts = 0;
        while limit.is_none_or(|max| attempts < max) {
            let Some(mut write) = self.writes.pop_front() else {
                break;
            };
            attempts += 1;
            let id = write.register.device();
            let result = match self.prepare_to_access(id).await {
                Ok(()) => {
                    let device = &mut self.devices[id.0];
                    device
                        .write_register(self.port.as_mut(), &write.register, write.raw)
                        .await
                },
                Err(e) => Err(e),
            };
            let now = Instant::now();
            match result {
                Ok(()) => {
                    write.register.set_written_value(write.raw);
                    self.callbacks.report(&write.register);
                },
                Err(e) => {
                    let max_fail_time = self.devices[id.0].config().max_write_fail_time();
                    match write.on_failure(&e, now, max_fail_time) {
                        WriteRetry::Retry => {
                            debug!("write to {} failed, will retry: {}", write.register, e);
                            retry.push(write);
                        },
                        WriteRetry::GiveUp => {
                            warn!("write to {} failed: {}", write.register, e);
                            write.register.set_error(ErrorState::WRITE_ERROR);
                            self.callbacks.report_error(&write.register);
                        },
                    }
                },
            }
            self.handle_state_change(id, now);
        }
        self.writes.requeue(retry);
    }

    async fn process_rpcs(&mut self) {
        let rpcs = self.shared.take_rpcs();
        if rpcs.is_empty() {
            return;
        }
        self.end_current_session().await;
        for rpc in rpcs {
            let result = rpc::execute(self.port.as_mut(), &rpc.request).await;
            if let Err(e) = &result {
                debug!("RPC failed: {}", e);
            }
            if rpc.reply.send(result).is_err() {
                debug!("RPC requester is gone");
            }
        }
    }
}
