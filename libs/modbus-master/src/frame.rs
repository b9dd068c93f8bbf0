//! Modbus TCP framing
//!
//! `ModbusTcpCodec` splits the inbound byte stream into whole MBAP frames and
//! serializes outbound requests. Response bodies are decoded separately by
//! [`decode_response`] once the transaction id has been matched.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::constants::{
    FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS, LENGTH_FIELD_OFFSET, MAX_FRAME_LEN,
    MBAP_PREFIX_LEN, MIN_RESPONSE_LEN, PROTOCOL_ID, READ_REQUEST_LENGTH, UNIT_ID,
    WRITE_REQUEST_BASE_LENGTH,
};
use crate::error::{ModbusError, Result};
use crate::register_buf::RegisterBuf;

/// Operation carried by one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// FC03 for `count` registers
    Read { count: u16 },
    /// FC16 with an even, non-empty register payload
    Write { payload: Bytes },
}

impl RequestBody {
    pub fn function_code(&self) -> u8 {
        match self {
            RequestBody::Read { .. } => FC_READ_HOLDING_REGISTERS,
            RequestBody::Write { .. } => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }
}

/// Outbound request with its transaction id assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub transaction_id: u16,
    pub address: u16,
    pub body: RequestBody,
}

/// Decoded body of a matched response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Registers(RegisterBuf),
    WriteAck,
    Exception(u8),
}

/// MBAP length-prefixed codec
#[derive(Debug, Default, Clone, Copy)]
pub struct ModbusTcpCodec;

impl ModbusTcpCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for ModbusTcpCodec {
    type Item = BytesMut;
    type Error = ModbusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if src.len() < MBAP_PREFIX_LEN {
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[LENGTH_FIELD_OFFSET], src[LENGTH_FIELD_OFFSET + 1]]);
        let total = MBAP_PREFIX_LEN + length as usize;
        if total > MAX_FRAME_LEN {
            return Err(ModbusError::transport(format!(
                "Frame too long: {total} bytes (max {MAX_FRAME_LEN})"
            )));
        }

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(total)))
    }
}

impl Encoder<RequestFrame> for ModbusTcpCodec {
    type Error = ModbusError;

    fn encode(&mut self, item: RequestFrame, dst: &mut BytesMut) -> Result<()> {
        let fc = item.body.function_code();
        match &item.body {
            RequestBody::Read { count } => {
                dst.reserve(MBAP_PREFIX_LEN + READ_REQUEST_LENGTH as usize);
                put_header(dst, item.transaction_id, READ_REQUEST_LENGTH, fc, item.address);
                dst.put_u16(*count);
            }
            RequestBody::Write { payload } => {
                let byte_count = u8::try_from(payload.len()).map_err(|_| {
                    ModbusError::invalid_argument(format!(
                        "Write payload too long: {} bytes",
                        payload.len()
                    ))
                })?;
                let length = WRITE_REQUEST_BASE_LENGTH + u16::from(byte_count);
                dst.reserve(MBAP_PREFIX_LEN + length as usize);
                put_header(dst, item.transaction_id, length, fc, item.address);
                dst.put_u16(u16::from(byte_count) / 2);
                dst.put_u8(byte_count);
                dst.put_slice(payload);
            }
        }
        Ok(())
    }
}

fn put_header(dst: &mut BytesMut, transaction_id: u16, length: u16, fc: u8, address: u16) {
    dst.put_u16(transaction_id);
    dst.put_u16(PROTOCOL_ID);
    dst.put_u16(length);
    dst.put_u8(UNIT_ID);
    dst.put_u8(fc);
    dst.put_u16(address);
}

/// Read the transaction id and function code of a response frame
///
/// A frame too short for both cannot be matched to anything, so it is a
/// transport error.
pub fn parse_header(frame: &[u8]) -> Result<(u16, u8)> {
    if frame.len() < MIN_RESPONSE_LEN {
        return Err(ModbusError::transport(format!(
            "Response too short: {} bytes",
            frame.len()
        )));
    }
    let tid = u16::from_be_bytes([frame[0], frame[1]]);
    Ok((tid, frame[MIN_RESPONSE_LEN - 1]))
}

/// Decode the body that follows the function code
pub fn decode_response(fc: u8, frame: &[u8]) -> Result<ResponseBody> {
    let mut body = frame.get(MIN_RESPONSE_LEN..).unwrap_or_default();
    match fc {
        FC_READ_HOLDING_REGISTERS => {
            if body.is_empty() {
                return Err(ModbusError::protocol("Read response without byte count"));
            }
            // Byte count is skipped; the frame length already bounds the data
            body.advance(1);
            RegisterBuf::from_bytes(body)
                .map(ResponseBody::Registers)
                .map_err(|e| ModbusError::protocol(format!("Bad register data: {e}")))
        }
        FC_WRITE_MULTIPLE_REGISTERS => Ok(ResponseBody::WriteAck),
        _ => match body.first() {
            Some(&code) => {
                debug!("Exception response: fc=0x{:02X}, code=0x{:02X}", fc, code);
                Ok(ResponseBody::Exception(code))
            }
            None => Err(ModbusError::protocol(format!(
                "Exception response 0x{fc:02X} without exception code"
            ))),
        },
    }
}
