//! Process-wide master
//!
//! For applications that want one shared master without threading a handle
//! through every call site. The core types never consult this; it is only a
//! convenience over an explicitly installed [`ModbusMaster`].
//!
//! ```no_run
//! use modbus_master::{facade, ModbusMaster};
//!
//! # fn main() -> modbus_master::Result<()> {
//! let _guard = facade::install(ModbusMaster::new()?);
//! let regs = facade::read("192.168.1.10", 0, 10)?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{const_rwlock, RwLock};
use tracing::debug;

use crate::error::{ModbusError, Result};
use crate::master::ModbusMaster;
use crate::register_buf::RegisterBuf;

struct Installed {
    generation: u64,
    master: Arc<ModbusMaster>,
}

static INSTANCE: RwLock<Option<Installed>> = const_rwlock(None);
static GENERATION: AtomicU64 = AtomicU64::new(0);

/// Keeps the installed master alive; dropping it shuts the master down
#[must_use = "dropping the guard shuts the master down"]
#[derive(Debug)]
pub struct GlobalGuard {
    generation: u64,
}

impl Drop for GlobalGuard {
    fn drop(&mut self) {
        // A later install already replaced this master
        let taken = {
            let mut slot = INSTANCE.write();
            match slot.as_ref() {
                Some(installed) if installed.generation == self.generation => slot.take(),
                _ => None,
            }
        };
        if let Some(installed) = taken {
            installed.master.shutdown();
        }
    }
}

/// Install `master` as the process-wide instance
///
/// A previously installed master is shut down.
pub fn install(master: ModbusMaster) -> GlobalGuard {
    let generation = GENERATION.fetch_add(1, Ordering::Relaxed) + 1;
    let previous = INSTANCE.write().replace(Installed {
        generation,
        master: Arc::new(master),
    });
    if let Some(previous) = previous {
        debug!("Replacing global modbus master");
        previous.master.shutdown();
    }
    GlobalGuard { generation }
}

/// The installed master
pub fn master() -> Result<Arc<ModbusMaster>> {
    INSTANCE
        .read()
        .as_ref()
        .map(|installed| Arc::clone(&installed.master))
        .ok_or_else(|| ModbusError::config("install a master before use"))
}

pub fn is_installed() -> bool {
    INSTANCE.read().is_some()
}

pub fn read(endpoint: &str, address: u16, count: u16) -> Result<RegisterBuf> {
    master()?.read(endpoint, address, count)
}

pub fn read_with_retries(endpoint: &str, address: u16, count: u16, retries: u32) -> Result<RegisterBuf> {
    master()?.read_with_retries(endpoint, address, count, retries)
}

pub fn write(endpoint: &str, address: u16, buffer: &RegisterBuf) -> Result<()> {
    master()?.write(endpoint, address, buffer)
}

pub fn write_with_retries(
    endpoint: &str,
    address: u16,
    buffer: &RegisterBuf,
    retries: u32,
) -> Result<()> {
    master()?.write_with_retries(endpoint, address, buffer, retries)
}

/// Write one 32-bit value as two registers, low word first
pub fn write_i32(endpoint: &str, address: u16, value: i32) -> Result<()> {
    write(endpoint, address, &RegisterBuf::from_i32s(&[value])?)
}

/// Write one signed register
pub fn write_i16(endpoint: &str, address: u16, value: i16) -> Result<()> {
    write(endpoint, address, &RegisterBuf::from_i16s(&[value])?)
}

pub async fn read_async(endpoint: &str, address: u16, count: u16) -> Result<RegisterBuf> {
    master()?.read_async(endpoint, address, count).await
}

pub async fn read_async_with_retries(
    endpoint: &str,
    address: u16,
    count: u16,
    retries: u32,
) -> Result<RegisterBuf> {
    master()?
        .read_async_with_retries(endpoint, address, count, retries)
        .await
}

pub async fn write_async(endpoint: &str, address: u16, buffer: &RegisterBuf) -> Result<()> {
    master()?.write_async(endpoint, address, buffer).await
}

pub async fn write_async_with_retries(
    endpoint: &str,
    address: u16,
    buffer: &RegisterBuf,
    retries: u32,
) -> Result<()> {
    master()?
        .write_async_with_retries(endpoint, address, buffer, retries)
        .await
}

/// Shut down and uninstall the current master, if any
pub fn close() {
    let taken = INSTANCE.write().take();
    if let Some(installed) = taken {
        installed.master.shutdown();
    }
}
