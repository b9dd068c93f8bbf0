//! Connection pool
//!
//! Keeps at most one live connection per device endpoint. The first caller for
//! an endpoint starts a connect attempt; everyone arriving while it runs awaits
//! the same shared future, so two concurrent first calls open one socket.
//! Slots remove themselves when the connection fails or closes.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::constants::DEFAULT_PORT;
use crate::engine::{ConnectionEngine, ConnectionHandle, EngineConfig};
use crate::error::{ModbusError, Result};

// ============================================================================
// Endpoint
// ============================================================================

/// Device address, `host` or `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]:port` or a bare IPv6 address
    ///
    /// The port defaults to 502.
    pub fn parse(endpoint: &str) -> Result<Self> {
        let s = endpoint.trim();
        if s.is_empty() {
            return Err(ModbusError::invalid_argument("endpoint is empty"));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| ModbusError::invalid_argument(format!("unclosed '[' in {s}")))?;
            if host.is_empty() {
                return Err(ModbusError::invalid_argument(format!("empty host in {s}")));
            }
            let port = match after {
                "" => DEFAULT_PORT,
                _ => {
                    let port = after.strip_prefix(':').ok_or_else(|| {
                        ModbusError::invalid_argument(format!("expected ':' after ']' in {s}"))
                    })?;
                    parse_port(port, s)?
                },
            };
            return Ok(Self::new(host, port));
        }

        match s.split_once(':') {
            None => Ok(Self::new(s, DEFAULT_PORT)),
            // More than one colon: bare IPv6 address
            Some((_, rest)) if rest.contains(':') => Ok(Self::new(s, DEFAULT_PORT)),
            Some(("", _)) => Err(ModbusError::invalid_argument(format!("empty host in {s}"))),
            Some((host, port)) => Ok(Self::new(host, parse_port(port, s)?)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Pool key, identical to the display form
    pub fn key(&self) -> String {
        self.to_string()
    }
}

fn parse_port(port: &str, endpoint: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|_| ModbusError::invalid_argument(format!("invalid port in endpoint {endpoint}")))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// ============================================================================
// Transport Seam
// ============================================================================

/// Byte stream a connection engine can run on
pub trait NetworkChannel: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> NetworkChannel for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Opens byte streams to devices
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> std::io::Result<Box<dyn NetworkChannel>>;
}

/// Plain TCP with `TCP_NODELAY`
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> std::io::Result<Box<dyn NetworkChannel>> {
        debug!("TCP connecting: {}", endpoint);
        let stream = TcpStream::connect((endpoint.host(), endpoint.port())).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY: {}", e);
        }
        Ok(Box::new(stream))
    }
}

// ============================================================================
// Pool
// ============================================================================

type SharedConnection = Shared<BoxFuture<'static, Result<ConnectionHandle>>>;

struct Slot {
    id: u64,
    connection: SharedConnection,
}

impl Slot {
    /// Finished as failed, or its engine has stopped
    fn is_stale(&self) -> bool {
        match self.connection.peek() {
            Some(Ok(handle)) => handle.is_closed(),
            Some(Err(_)) => true,
            None => false,
        }
    }
}

type Slots = Arc<DashMap<String, Slot>>;

/// Endpoint-keyed map of shared connection attempts
pub struct ConnectionPool {
    slots: Slots,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    engine_config: EngineConfig,
    runtime: Handle,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        connect_timeout: Duration,
        engine_config: EngineConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            connector,
            connect_timeout,
            engine_config,
            runtime,
            next_id: AtomicU64::new(0),
        }
    }

    /// Get the endpoint's connection, connecting on first use
    pub async fn get_or_connect(&self, endpoint: &Endpoint) -> Result<ConnectionHandle> {
        self.connection_for(endpoint).await
    }

    fn connection_for(&self, endpoint: &Endpoint) -> SharedConnection {
        match self.slots.entry(endpoint.key()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_stale() {
                    debug!("Replacing stale connection: {}", endpoint);
                    let slot = self.new_slot(endpoint);
                    let connection = slot.connection.clone();
                    entry.insert(slot);
                    connection
                } else {
                    entry.get().connection.clone()
                }
            },
            Entry::Vacant(entry) => {
                let slot = self.new_slot(endpoint);
                let connection = slot.connection.clone();
                entry.insert(slot);
                connection
            },
        }
    }

    fn new_slot(&self, endpoint: &Endpoint) -> Slot {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = self.runtime.spawn(establish(
            Arc::clone(&self.connector),
            endpoint.clone(),
            self.connect_timeout,
            self.engine_config,
            Arc::clone(&self.slots),
            id,
        ));
        let connection = async move {
            task.await
                .unwrap_or_else(|e| Err(ModbusError::transport(format!("connect task failed: {e}"))))
        }
        .boxed()
        .shared();
        Slot { id, connection }
    }

    /// Close every connection and forget all slots
    pub fn close_all(&self) {
        for slot in self.slots.iter() {
            if let Some(Ok(handle)) = slot.connection.peek() {
                handle.close();
            }
        }
        self.slots.clear();
    }

    /// Number of endpoints with a live or in-progress connection
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn remove_slot(slots: &Slots, key: &str, id: u64) {
    slots.remove_if(key, |_, slot| slot.id == id);
}

/// Connect, then run the engine in its own task
async fn establish(
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
    connect_timeout: Duration,
    engine_config: EngineConfig,
    slots: Slots,
    id: u64,
) -> Result<ConnectionHandle> {
    let key = endpoint.key();

    let stream = match timeout(connect_timeout, connector.connect(&endpoint)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("TCP err: {} - {}", key, e);
            remove_slot(&slots, &key, id);
            return Err(ModbusError::transport(format!("{key}: {e}")));
        },
        Err(_) => {
            warn!("TCP timeout: {}", key);
            remove_slot(&slots, &key, id);
            return Err(ModbusError::ConnectTimeout(key));
        },
    };

    // close_all ran while connecting
    let still_wanted = slots.get(&key).is_some_and(|slot| slot.id == id);
    if !still_wanted {
        debug!("Dropping connection opened after close: {}", key);
        return Err(ModbusError::Shutdown);
    }

    info!("TCP connected: {}", key);
    let (handle, engine) = ConnectionEngine::new(key.clone(), stream, engine_config);
    tokio::spawn(async move {
        engine.run().await;
        remove_slot(&slots, &key, id);
    });
    Ok(handle)
}
