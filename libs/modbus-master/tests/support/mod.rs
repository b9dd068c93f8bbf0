//! In-process Modbus TCP device for integration tests
//!
//! Serves FC03 and FC16 over a bank of holding registers on 127.0.0.1.
//! Out-of-range addresses get exception 2 (Illegal Data Address).

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const REGISTER_COUNT: usize = 1000;

#[derive(Default)]
struct DeviceState {
    registers: Mutex<Vec<u16>>,
    connections: AtomicUsize,
    requests: AtomicUsize,
    hang_ups: AtomicUsize,
}

pub struct MockDevice {
    addr: SocketAddr,
    state: Arc<DeviceState>,
    accept_task: JoinHandle<()>,
}

impl MockDevice {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(DeviceState {
            registers: Mutex::new(vec![0; REGISTER_COUNT]),
            ..Default::default()
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(Arc::clone(&accept_state), stream));
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn register(&self, address: usize) -> u16 {
        self.state.registers.lock()[address]
    }

    pub fn set_registers(&self, address: usize, values: &[u16]) {
        self.state.registers.lock()[address..address + values.len()].copy_from_slice(values);
    }

    /// Close the connection on the next request instead of answering
    pub fn hang_up_next(&self) {
        self.state.hang_ups.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Address of a port nothing listens on
pub async fn closed_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

async fn serve(state: Arc<DeviceState>, mut stream: TcpStream) {
    loop {
        let mut header = [0u8; 6];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let len = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut pdu = vec![0u8; len];
        if stream.read_exact(&mut pdu).await.is_err() {
            return;
        }
        state.requests.fetch_add(1, Ordering::SeqCst);

        let hang_up = state
            .hang_ups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hang_up {
            return;
        }

        let body = answer(&state, &pdu);
        let mut response = header[..4].to_vec();
        response.extend_from_slice(&(1 + body.len() as u16).to_be_bytes());
        response.push(pdu[0]);
        response.extend_from_slice(&body);
        if stream.write_all(&response).await.is_err() {
            return;
        }
    }
}

fn answer(state: &DeviceState, pdu: &[u8]) -> Vec<u8> {
    let fc = pdu[1];
    let address = u16::from_be_bytes([pdu[2], pdu[3]]) as usize;
    let count = u16::from_be_bytes([pdu[4], pdu[5]]) as usize;
    if address + count > REGISTER_COUNT {
        return vec![fc | 0x80, 0x02];
    }

    let mut registers = state.registers.lock();
    match fc {
        0x03 => {
            let mut body = vec![0x03, (count * 2) as u8];
            for value in &registers[address..address + count] {
                body.extend_from_slice(&value.to_be_bytes());
            }
            body
        },
        0x10 => {
            let data = &pdu[7..7 + count * 2];
            for (i, word) in data.chunks_exact(2).enumerate() {
                registers[address + i] = u16::from_be_bytes([word[0], word[1]]);
            }
            let mut body = vec![0x10];
            body.extend_from_slice(&pdu[2..6]);
            body
        },
        _ => vec![fc | 0x80, 0x01],
    }
}
