//! Per-connection request engine
//!
//! One `ConnectionEngine` task owns one device connection. Callers reach it
//! through a cloneable [`ConnectionHandle`]; every request gets a oneshot
//! result slot that completes exactly once, with the response, a device
//! exception, a request timeout, or a transport failure when the connection
//! goes away.
//!
//! ```text
//! submit ─► queue (5 ms pacing) ─► assign tid ─► arm timeout ─► send
//!                                                                 │
//! result ◄─ match tid ◄─ decode body ◄─ split MBAP frame ◄────────┘
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::codec::Framed;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, trace, warn};

use crate::constants::{TRANSACTION_ID_MODULUS, WRITE_INTERVAL};
use crate::error::{ModbusError, Result};
use crate::frame::{decode_response, parse_header, ModbusTcpCodec, RequestBody, RequestFrame, ResponseBody};
use crate::register_buf::RegisterBuf;

/// Engine timing settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
    pub write_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            write_interval: WRITE_INTERVAL,
        }
    }
}

/// Successful outcome of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Registers(RegisterBuf),
    Written,
}

/// Why an engine stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// No traffic for the idle timeout
    Idle,
    /// Close command, or every handle dropped
    Closed,
    /// Peer closed the stream
    Eof,
    Error(ModbusError),
}

type ReplySlot = oneshot::Sender<Result<Response>>;

#[derive(Debug)]
struct Request {
    address: u16,
    body: RequestBody,
    reply: ReplySlot,
}

#[derive(Debug)]
enum Command {
    Submit(Request),
    Close,
}

struct PendingRequest {
    expects_registers: bool,
    reply: ReplySlot,
    timeout_key: delay_queue::Key,
}

struct Scheduled {
    send_at: Instant,
    request: Request,
}

/// Cloneable sender side of a connection engine
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    endpoint: Arc<str>,
    tx: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Queue a request, returning its result slot
    pub fn submit(
        &self,
        address: u16,
        body: RequestBody,
    ) -> Result<oneshot::Receiver<Result<Response>>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Submit(Request {
                address,
                body,
                reply,
            }))
            .map_err(|_| closed_error(&self.endpoint))?;
        Ok(rx)
    }

    /// Ask the engine to stop; pending requests fail
    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }

    /// Check if the engine has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn closed_error(endpoint: &str) -> ModbusError {
    ModbusError::transport(format!("{endpoint}: connection closed"))
}

/// Request/response state machine for one connection
pub struct ConnectionEngine<T> {
    endpoint: Arc<str>,
    framed: Framed<T, ModbusTcpCodec>,
    commands: mpsc::UnboundedReceiver<Command>,
    pending: HashMap<u16, PendingRequest>,
    timeouts: DelayQueue<u16>,
    queue: VecDeque<Scheduled>,
    counter: u32,
    last_write: Option<Instant>,
    config: EngineConfig,
}

impl<T> ConnectionEngine<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        endpoint: impl Into<Arc<str>>,
        stream: T,
        config: EngineConfig,
    ) -> (ConnectionHandle, Self) {
        let endpoint = endpoint.into();
        let (tx, commands) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            endpoint: endpoint.clone(),
            tx,
        };
        let engine = Self {
            endpoint,
            framed: Framed::new(stream, ModbusTcpCodec::new()),
            commands,
            pending: HashMap::new(),
            timeouts: DelayQueue::new(),
            queue: VecDeque::new(),
            counter: 0,
            last_write: None,
            config,
        };
        (handle, engine)
    }

    /// Drive the connection until it closes
    pub async fn run(mut self) -> CloseReason {
        let idle = sleep(self.config.idle_timeout);
        tokio::pin!(idle);

        let reason = loop {
            let next_send = self.queue.front().map(|s| s.send_at);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Submit(request)) => {
                        self.schedule(request);
                        match self.flush_due().await {
                            Ok(0) => {}
                            Ok(_) => idle.as_mut().reset(Instant::now() + self.config.idle_timeout),
                            Err(e) => break CloseReason::Error(e),
                        }
                    }
                    Some(Command::Close) | None => break CloseReason::Closed,
                },
                () = sleep_until(next_send.unwrap_or_else(Instant::now)), if next_send.is_some() => {
                    match self.flush_due().await {
                        Ok(0) => {}
                        Ok(_) => idle.as_mut().reset(Instant::now() + self.config.idle_timeout),
                        Err(e) => break CloseReason::Error(e),
                    }
                }
                frame = self.framed.next() => match frame {
                    Some(Ok(frame)) => {
                        idle.as_mut().reset(Instant::now() + self.config.idle_timeout);
                        if let Err(e) = self.handle_frame(&frame) {
                            break CloseReason::Error(e);
                        }
                    }
                    Some(Err(e)) => break CloseReason::Error(e),
                    None => break CloseReason::Eof,
                },
                Some(expired) = self.timeouts.next(), if !self.timeouts.is_empty() => {
                    self.expire(expired.into_inner());
                }
                () = &mut idle => break CloseReason::Idle,
            }
        };

        match &reason {
            CloseReason::Error(e) => warn!("TCP closed: {} ({})", self.endpoint, e),
            other => info!("TCP closed: {} ({:?})", self.endpoint, other),
        }
        self.fail_all();
        reason
    }

    /// Apply write pacing and queue the request
    fn schedule(&mut self, request: Request) {
        let now = Instant::now();
        let send_at = match self.last_write {
            Some(last) if now.duration_since(last) < self.config.write_interval => {
                last + self.config.write_interval
            }
            _ => now,
        };
        self.last_write = Some(send_at);
        self.queue.push_back(Scheduled { send_at, request });
    }

    /// Transmit every queued request whose send time has come
    async fn flush_due(&mut self) -> Result<usize> {
        let mut sent = 0;
        while self
            .queue
            .front()
            .is_some_and(|s| s.send_at <= Instant::now())
        {
            if let Some(scheduled) = self.queue.pop_front() {
                self.transmit(scheduled.request).await?;
                sent += 1;
            }
        }
        Ok(sent)
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.counter = (self.counter + 1) % TRANSACTION_ID_MODULUS;
        self.counter as u16
    }

    async fn transmit(&mut self, request: Request) -> Result<()> {
        let tid = self.next_transaction_id();

        if let Some(stale) = self.pending.remove(&tid) {
            warn!("{}: tid {} reused while pending, failing old request", self.endpoint, tid);
            self.timeouts.try_remove(&stale.timeout_key);
            let _ = stale
                .reply
                .send(Err(ModbusError::RequestTimeout(self.endpoint.to_string())));
        }

        let timeout_key = self.timeouts.insert(tid, self.config.request_timeout);
        self.pending.insert(
            tid,
            PendingRequest {
                expects_registers: matches!(request.body, RequestBody::Read { .. }),
                reply: request.reply,
                timeout_key,
            },
        );

        debug!(
            "Send: {} tid={} fc=0x{:02X} addr={}",
            self.endpoint,
            tid,
            request.body.function_code(),
            request.address
        );
        self.framed
            .send(RequestFrame {
                transaction_id: tid,
                address: request.address,
                body: request.body,
            })
            .await
    }

    /// Match one inbound frame; an error here tears the connection down
    fn handle_frame(&mut self, frame: &[u8]) -> Result<()> {
        let (tid, fc) = parse_header(frame)?;

        let Some(pending) = self.pending.remove(&tid) else {
            trace!(
                "{}: response missed request, maybe timed out before, tid={}",
                self.endpoint,
                tid
            );
            return Ok(());
        };
        self.timeouts.try_remove(&pending.timeout_key);
        debug!("Recv: {} tid={} fc=0x{:02X} len={}", self.endpoint, tid, fc, frame.len());

        let result = match decode_response(fc, frame) {
            Ok(ResponseBody::Registers(regs)) if pending.expects_registers => {
                Ok(Response::Registers(regs))
            }
            Ok(ResponseBody::WriteAck) if !pending.expects_registers => Ok(Response::Written),
            Ok(ResponseBody::Exception(code)) => Err(ModbusError::device(&*self.endpoint, code)),
            Ok(_) => Err(ModbusError::protocol(format!(
                "{}: fc 0x{fc:02X} does not answer the request",
                self.endpoint
            ))),
            Err(e) => Err(e),
        };
        let _ = pending.reply.send(result);
        Ok(())
    }

    fn expire(&mut self, tid: u16) {
        if let Some(pending) = self.pending.remove(&tid) {
            warn!("TCP timeout: {} tid={}", self.endpoint, tid);
            let _ = pending
                .reply
                .send(Err(ModbusError::RequestTimeout(self.endpoint.to_string())));
        }
    }

    fn fail_all(&mut self) {
        // Handles must read as closed before any caller sees its failure
        self.commands.close();

        self.timeouts.clear();
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(closed_error(&self.endpoint)));
        }
        for scheduled in self.queue.drain(..) {
            let _ = scheduled.request.reply.send(Err(closed_error(&self.endpoint)));
        }

        while let Ok(command) = self.commands.try_recv() {
            if let Command::Submit(request) = command {
                let _ = request.reply.send(Err(closed_error(&self.endpoint)));
            }
        }
    }
}
