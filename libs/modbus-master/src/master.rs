//! Modbus master orchestrator
//!
//! `ModbusMaster` validates caller input, resolves the pooled connection for
//! an endpoint, hands the request to its engine and applies the retry budget.
//! Every operation has an async form and a blocking form; blocking forms run
//! on the master's runtime and refuse to run inside another runtime.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info};

use crate::config::MasterConfig;
use crate::constants::{MAX_REGISTERS, MAX_RETRIES};
use crate::engine::Response;
use crate::error::{ModbusError, Result};
use crate::frame::RequestBody;
use crate::pool::{ConnectionPool, Connector, Endpoint, TcpConnector};
use crate::register_buf::RegisterBuf;

/// Builder for [`ModbusMaster`]
pub struct MasterBuilder {
    config: MasterConfig,
    connector: Option<Arc<dyn Connector>>,
    handle: Option<Handle>,
}

impl MasterBuilder {
    pub fn config(mut self, config: MasterConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the TCP connector
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Run on an existing multi-thread runtime instead of an owned one
    ///
    /// A shared runtime is never shut down by the master.
    pub fn runtime_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn build(self) -> Result<ModbusMaster> {
        let config = self.config.normalized();

        let (runtime, handle) = match self.handle {
            Some(handle) => (None, handle),
            None => {
                let mut builder = tokio::runtime::Builder::new_multi_thread();
                builder.enable_all().thread_name("modbus-io");
                if let Some(workers) = config.worker_threads {
                    builder.worker_threads(workers);
                }
                let runtime = builder
                    .build()
                    .map_err(|e| ModbusError::config(format!("Failed to start runtime: {e}")))?;
                let handle = runtime.handle().clone();
                (Some(runtime), handle)
            },
        };

        let connector = self.connector.unwrap_or_else(|| Arc::new(TcpConnector));
        let pool = ConnectionPool::new(
            connector,
            config.connect_timeout(),
            config.engine_config(),
            handle.clone(),
        );

        debug!(
            "Modbus master ready: request={:?} idle={:?} connect={:?}",
            config.request_timeout(),
            config.idle_timeout(),
            config.connect_timeout()
        );

        Ok(ModbusMaster {
            pool,
            runtime: Mutex::new(runtime),
            handle,
            closed: AtomicBool::new(false),
            config,
        })
    }
}

/// Modbus TCP master
///
/// Safe to share across threads; wrap it in an `Arc` to do so.
pub struct ModbusMaster {
    pool: ConnectionPool,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    closed: AtomicBool,
    config: MasterConfig,
}

impl ModbusMaster {
    pub fn builder() -> MasterBuilder {
        MasterBuilder {
            config: MasterConfig::default(),
            connector: None,
            handle: None,
        }
    }

    /// Master with default settings and its own runtime
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn with_config(config: MasterConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    // ========================================================================
    // Async API
    // ========================================================================

    /// Read `count` holding registers starting at `address`
    pub async fn read_async(&self, endpoint: &str, address: u16, count: u16) -> Result<RegisterBuf> {
        self.read_async_with_retries(endpoint, address, count, 0).await
    }

    pub async fn read_async_with_retries(
        &self,
        endpoint: &str,
        address: u16,
        count: u16,
        retries: u32,
    ) -> Result<RegisterBuf> {
        self.ensure_open()?;
        if count == 0 || usize::from(count) > MAX_REGISTERS {
            return Err(ModbusError::invalid_argument(format!(
                "register count {count} outside 1..={MAX_REGISTERS}"
            )));
        }
        let endpoint = Endpoint::parse(endpoint)?;

        match self
            .execute(&endpoint, address, RequestBody::Read { count }, retries)
            .await?
        {
            Response::Registers(regs) => Ok(regs),
            Response::Written => Err(ModbusError::protocol(format!(
                "{endpoint}: write acknowledgement for a read"
            ))),
        }
    }

    /// Write every register of `buffer` starting at `address`
    ///
    /// The payload always starts at the buffer's first byte. The buffer is not
    /// consumed; its read cursor stays where it was.
    pub async fn write_async(&self, endpoint: &str, address: u16, buffer: &RegisterBuf) -> Result<()> {
        self.write_async_with_retries(endpoint, address, buffer, 0).await
    }

    pub async fn write_async_with_retries(
        &self,
        endpoint: &str,
        address: u16,
        buffer: &RegisterBuf,
        retries: u32,
    ) -> Result<()> {
        self.ensure_open()?;
        let payload = buffer.transport_payload()?;
        let endpoint = Endpoint::parse(endpoint)?;

        match self
            .execute(&endpoint, address, RequestBody::Write { payload }, retries)
            .await?
        {
            Response::Written => Ok(()),
            Response::Registers(_) => Err(ModbusError::protocol(format!(
                "{endpoint}: register data for a write"
            ))),
        }
    }

    /// Run one operation under the retry budget
    ///
    /// Each retry re-resolves the connection, so a torn-down connection is
    /// replaced before the next attempt.
    async fn execute(
        &self,
        endpoint: &Endpoint,
        address: u16,
        body: RequestBody,
        retries: u32,
    ) -> Result<Response> {
        let retries = retries.min(MAX_RETRIES);
        let mut attempt = 0;

        loop {
            match self.attempt(endpoint, address, body.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect_timeout() || !e.is_retryable() => return Err(e),
                Err(e) if attempt >= retries => {
                    if retries > 0 {
                        debug!("Retries exhausted: {} - {}", endpoint, e);
                    }
                    return Err(e);
                },
                Err(e) => {
                    attempt += 1;
                    debug!("Retry {}/{}: {} - {}", attempt, retries, endpoint, e);
                },
            }
        }
    }

    async fn attempt(&self, endpoint: &Endpoint, address: u16, body: RequestBody) -> Result<Response> {
        self.ensure_open()?;
        let connection = self.pool.get_or_connect(endpoint).await?;
        let reply = connection.submit(address, body)?;
        reply
            .await
            .map_err(|_| ModbusError::transport(format!("{endpoint}: connection closed")))?
    }

    // ========================================================================
    // Blocking API
    // ========================================================================

    pub fn read(&self, endpoint: &str, address: u16, count: u16) -> Result<RegisterBuf> {
        self.read_with_retries(endpoint, address, count, 0)
    }

    pub fn read_with_retries(
        &self,
        endpoint: &str,
        address: u16,
        count: u16,
        retries: u32,
    ) -> Result<RegisterBuf> {
        self.block_on(self.read_async_with_retries(endpoint, address, count, retries))
    }

    pub fn write(&self, endpoint: &str, address: u16, buffer: &RegisterBuf) -> Result<()> {
        self.write_with_retries(endpoint, address, buffer, 0)
    }

    pub fn write_with_retries(
        &self,
        endpoint: &str,
        address: u16,
        buffer: &RegisterBuf,
        retries: u32,
    ) -> Result<()> {
        self.block_on(self.write_async_with_retries(endpoint, address, buffer, retries))
    }

    fn block_on<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        if Handle::try_current().is_ok() {
            return Err(ModbusError::BlockingInRuntime);
        }
        self.ensure_open()?;
        self.handle.block_on(operation)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ModbusError::Shutdown);
        }
        Ok(())
    }

    /// Endpoints with a live or in-progress connection
    pub fn connection_count(&self) -> usize {
        self.pool.len()
    }

    /// Runtime the master's connections run on
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close all connections and stop the owned runtime
    ///
    /// Idempotent. Later operations fail with [`ModbusError::Shutdown`].
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Modbus master shutdown: {} connections", self.pool.len());
        self.pool.close_all();

        if let Some(runtime) = self.runtime.lock().take() {
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(Duration::from_secs(1));
            }
        }
    }
}

impl Drop for ModbusMaster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
