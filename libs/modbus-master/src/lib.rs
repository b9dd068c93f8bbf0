//! Modbus TCP Master
//!
//! This library provides a Modbus TCP client ("master") for reading and writing
//! holding registers on field devices. The implementation supports:
//! - FC03 (Read Holding Registers) and FC16 (Write Multiple Registers)
//! - One reused TCP connection per device endpoint, established lazily
//! - Transaction-id multiplexing with per-request timeouts
//! - 5 ms write pacing per connection (devices answer "busy" to bursts)
//! - Bounded retry that never retries a connect timeout
//!
//! # Architecture
//!
//! ```text
//! modbus-master
//!     ├── ModbusMaster (validation, retry, sync/async API, shutdown)
//!     │     └── ConnectionPool (endpoint -> shared connection attempt)
//!     │           └── ConnectionEngine (one tokio task per connection)
//!     │                 └── ModbusTcpCodec (MBAP framing)
//!     ├── RegisterBuf (register payload codec)
//!     ├── MasterConfig (figment-loaded settings)
//!     └── facade (optional process-wide instance)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use modbus_master::{ModbusMaster, RegisterBuf};
//!
//! # fn main() -> modbus_master::Result<()> {
//! let master = ModbusMaster::builder().build()?;
//!
//! let mut regs = master.read("192.168.1.10", 100, 4)?;
//! let power = regs.read_i32()?;
//! let flags = regs.read_bits_lsb_first()?;
//! println!("power={power} flags={flags}");
//!
//! master.write_with_retries("192.168.1.10:502", 200, &RegisterBuf::from_i32s(&[power])?, 2)?;
//! master.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod facade;
pub mod frame;
pub mod master;
pub mod pool;
pub mod register_buf;

pub use config::MasterConfig;
pub use engine::{CloseReason, ConnectionEngine, ConnectionHandle, EngineConfig, Response};
pub use error::{exception_description, ModbusError, Result};
pub use frame::{ModbusTcpCodec, RequestBody, RequestFrame};
pub use master::{MasterBuilder, ModbusMaster};
pub use pool::{ConnectionPool, Connector, Endpoint, NetworkChannel, TcpConnector};
pub use register_buf::RegisterBuf;
