//! VoltageEMS Shared-Bus Polling Engine
//!
//! Polls registers of many devices sharing one serial line or TCP gateway,
//! Modbus RTU and Modbus TCP framing included.
//!
//! ```text
//!  ┌──────────────┐  set_text_value / transceive  ┌──────────────────────┐
//!  │ ClientHandle │ ────────────────────────────► │     SerialClient     │
//!  └──────────────┘                               │  Scheduler (hi / lo) │
//!                                                 │  RateLimiter         │
//!        on_read / on_error / on_device_state ◄── │  PortSession         │
//!                                                 └──────────┬───────────┘
//!                                                            │ RegisterRange
//!                                                 ┌──────────▼───────────┐
//!                                                 │  Device (Modbus)     │
//!                                                 │  codec + cache       │
//!                                                 └──────────┬───────────┘
//!                                                            │ frames
//!                                                 ┌──────────▼───────────┐
//!                                                 │ Port: serial/tcp/mock│
//!                                                 └──────────────────────┘
//! ```
//!
//! # Key Components
//!
//! - **Register model**: register configs, value conversion, availability and error flags
//! - **Modbus codec**: PDU building, RTU/TCP framing, range reads with degradation
//! - **Range builder**: merges registers into the fewest requests a device accepts
//! - **Scheduler**: two-tier deadline queue with load balancing and a read rate limit
//! - **Port session**: open/close policy of the shared port
//! - **Serial client**: the polling loop tying everything together

pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod modbus;
pub mod port;
pub mod range;
pub mod register;
pub mod scheduler;
pub mod session;

// Re-exports
pub use client::{ClientHandle, RawRequest, SerialClient};
pub use config::{
    load_config_from_file, ClientSettings, DeviceConfig, LogConfig, PortConfig,
    PortOpenCloseSettings, RegisterSettings, SerialServiceConfig, SetupItemConfig,
};
pub use device::{ConnectionState, Device, DeviceId, DeviceState, ModbusDevice, ProtocolRegistry};
pub use error::{Result, SerialError};
pub use logging::init_logging;
pub use port::{MockPort, Port, SerialPort, SerialPortSettings, TcpPort, TcpPortSettings};
pub use range::{RangeBuilder, RangeLimits, RangeStatus, RegisterRange};
pub use register::{
    Availability, ErrorState, Register, RegisterAddress, RegisterConfig, RegisterFormat,
    RegisterStore, RegisterType, WordOrder,
};
pub use scheduler::{AccumulationPolicy, Priority, Scheduler, SelectionPolicy};
pub use session::PortSession;
