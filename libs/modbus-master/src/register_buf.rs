//! Register payload buffer
//!
//! A growable byte buffer for spans of 16-bit holding registers, with
//! independent read and write cursors. Writes append at the end, reads consume
//! from a cursor that starts at 0, so a buffer can be filled and then decoded
//! in the same order.
//!
//! # 32-bit word order
//!
//! A 32-bit value occupies two registers, low word first, each word
//! big-endian. For `0x12345678` the wire bytes are `[0x56, 0x78, 0x12, 0x34]`
//! (CDAB). Existing devices rely on this layout, so it must stay bit-exact.

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{MAX_INT32_VALUES, MAX_PAYLOAD_BYTES, MAX_REGISTERS};
use crate::error::{ModbusError, Result};

/// Register payload with separate read/write cursors
///
/// Invariant: the written length is always even.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterBuf {
    data: BytesMut,
    reader: usize,
}

impl RegisterBuf {
    /// Create an empty buffer sized for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            reader: 0,
        }
    }

    /// Build a buffer from 32-bit values, two registers each
    pub fn from_i32s(values: &[i32]) -> Result<Self> {
        if values.len() > MAX_INT32_VALUES {
            return Err(ModbusError::invalid_argument(format!(
                "{} int32 values exceed limited {MAX_REGISTERS} registers",
                values.len()
            )));
        }
        let mut buf = Self::with_capacity(values.len() * 4);
        buf.add_i32s(values);
        Ok(buf)
    }

    /// Build a buffer from signed register values
    pub fn from_i16s(values: &[i16]) -> Result<Self> {
        check_register_count(values.len())?;
        let mut buf = Self::with_capacity(values.len() * 2);
        buf.add_i16s(values);
        Ok(buf)
    }

    /// Build a buffer from unsigned register values
    pub fn from_u16s(values: &[u16]) -> Result<Self> {
        check_register_count(values.len())?;
        let mut buf = Self::with_capacity(values.len() * 2);
        buf.add_u16s(values);
        Ok(buf)
    }

    /// Wrap raw register bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_even(bytes.len())?;
        let mut buf = Self::with_capacity(bytes.len());
        buf.data.put_slice(bytes);
        Ok(buf)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    fn ensure_readable(&self, needed: usize) -> Result<()> {
        let available = self.readable_bytes();
        if needed > available {
            return Err(ModbusError::Underflow { needed, available });
        }
        Ok(())
    }

    /// Byte length of `count` items of `width` bytes
    fn span(&self, count: usize, width: usize) -> Result<usize> {
        count.checked_mul(width).ok_or(ModbusError::Underflow {
            needed: usize::MAX,
            available: self.readable_bytes(),
        })
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        self.ensure_readable(n)?;
        let start = self.reader;
        self.reader += n;
        Ok(&self.data[start..start + n])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read one 32-bit value (two registers, low word first)
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(decode_i32(self.take_array()?))
    }

    /// Read `count` 32-bit values
    pub fn read_i32s(&mut self, count: usize) -> Result<Vec<i32>> {
        self.ensure_readable(self.span(count, 4)?)?;
        (0..count).map(|_| self.read_i32()).collect()
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_i16s(&mut self, count: usize) -> Result<Vec<i16>> {
        self.ensure_readable(self.span(count, 2)?)?;
        (0..count).map(|_| self.read_i16()).collect()
    }

    pub fn read_u16s(&mut self, count: usize) -> Result<Vec<u16>> {
        self.ensure_readable(self.span(count, 2)?)?;
        (0..count).map(|_| self.read_u16()).collect()
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        Ok(self.take(count)?.to_vec())
    }

    /// Read one register as 16 bit characters, bit 0 first
    ///
    /// Register value 5 reads as `"1010000000000000"`. Used for coil-style
    /// bitfields packed into holding registers.
    pub fn read_bits_lsb_first(&mut self) -> Result<String> {
        let value = self.read_u16()?;
        Ok((0..16)
            .map(|bit| if value & (1 << bit) != 0 { '1' } else { '0' })
            .collect())
    }

    /// Advance the read cursor by `count` registers
    pub fn skip_registers(&mut self, count: usize) -> Result<&mut Self> {
        let n = self.span(count, 2)?;
        self.take(n)?;
        Ok(self)
    }

    /// Reset the read cursor to the first byte
    pub fn rewind(&mut self) -> &mut Self {
        self.reader = 0;
        self
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub fn add_i32(&mut self, value: i32) -> &mut Self {
        self.data.put_slice(&encode_i32(value));
        self
    }

    pub fn add_i32s(&mut self, values: &[i32]) -> &mut Self {
        for &value in values {
            self.add_i32(value);
        }
        self
    }

    pub fn add_i16(&mut self, value: i16) -> &mut Self {
        self.data.put_i16(value);
        self
    }

    pub fn add_i16s(&mut self, values: &[i16]) -> &mut Self {
        for &value in values {
            self.data.put_i16(value);
        }
        self
    }

    pub fn add_u16(&mut self, value: u16) -> &mut Self {
        self.data.put_u16(value);
        self
    }

    pub fn add_u16s(&mut self, values: &[u16]) -> &mut Self {
        for &value in values {
            self.data.put_u16(value);
        }
        self
    }

    /// Append raw register bytes; odd lengths are rejected
    pub fn add_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self> {
        check_even(bytes.len())?;
        self.data.put_slice(bytes);
        Ok(self)
    }

    /// Append the readable bytes of another buffer
    pub fn append(&mut self, other: &RegisterBuf) -> Result<&mut Self> {
        self.add_bytes(other.as_slice())
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Bytes between the read cursor and the write cursor
    pub fn readable_bytes(&self) -> usize {
        self.data.len() - self.reader
    }

    /// Total bytes written
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whole registers left to read
    pub fn register_count(&self) -> usize {
        self.readable_bytes() / 2
    }

    /// Readable bytes, without moving the cursor
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.reader..]
    }

    /// Fail if the readable bytes exceed one request's payload limit
    pub fn validate_for_transport(&self) -> Result<()> {
        if self.readable_bytes() > MAX_PAYLOAD_BYTES {
            return Err(ModbusError::invalid_argument(format!(
                "{} bytes exceed limited {MAX_REGISTERS} registers",
                self.readable_bytes()
            )));
        }
        Ok(())
    }

    /// Every written byte as a write-request payload
    ///
    /// The payload starts at byte 0 whatever the read cursor says, and the
    /// cursor does not move, so a buffer that was partly decoded still writes
    /// all of its registers.
    pub(crate) fn transport_payload(&self) -> Result<Bytes> {
        if self.data.is_empty() {
            return Err(ModbusError::invalid_argument(
                "write payload holds no registers",
            ));
        }
        if self.data.len() > MAX_PAYLOAD_BYTES {
            return Err(ModbusError::invalid_argument(format!(
                "{} bytes exceed limited {MAX_REGISTERS} registers",
                self.data.len()
            )));
        }
        Ok(Bytes::copy_from_slice(&self.data))
    }

    /// Release the backing memory
    ///
    /// Dropping the buffer has the same effect; this exists for call sites
    /// that want the release to be explicit.
    pub fn release(self) {
        drop(self);
    }
}

fn check_register_count(count: usize) -> Result<()> {
    if count > MAX_REGISTERS {
        return Err(ModbusError::invalid_argument(format!(
            "{count} registers exceed limited {MAX_REGISTERS} registers"
        )));
    }
    Ok(())
}

fn check_even(len: usize) -> Result<()> {
    if len % 2 != 0 {
        return Err(ModbusError::invalid_argument(format!(
            "bytes length is odd: {len}"
        )));
    }
    Ok(())
}

/// CDAB: low word first, each word big-endian
fn encode_i32(value: i32) -> [u8; 4] {
    let v = value as u32;
    [(v >> 8) as u8, v as u8, (v >> 24) as u8, (v >> 16) as u8]
}

fn decode_i32(b: [u8; 4]) -> i32 {
    let low = u16::from_be_bytes([b[0], b[1]]) as u32;
    let high = u16::from_be_bytes([b[2], b[3]]) as u32;
    ((high << 16) | low) as i32
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    // ========================================================================
    // Word Order
    // ========================================================================

    #[test]
    fn test_i32_wire_layout_is_cdab() {
        let buf = RegisterBuf::from_i32s(&[0x12345678]).unwrap();
        assert_eq!(buf.as_slice(), &[0x56, 0x78, 0x12, 0x34]);

        let buf = RegisterBuf::from_i32s(&[-2]).unwrap();
        assert_eq!(buf.as_slice(), &[0xFF, 0xFE, 0xFF, 0xFF]);
    }

    #[test]
    fn test_i32_round_trip() {
        let mut values = vec![0, 1, -1, i32::MIN, i32::MAX, 0x0000_FFFF, 0x7FFF_0000];
        // Spread the rest across the full range with a fixed LCG
        let mut seed: u32 = 0x9E37_79B9;
        for _ in 0..54 {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            values.push(seed as i32);
        }
        assert_eq!(values.len(), 61);

        let mut buf = RegisterBuf::from_i32s(&values).unwrap();
        assert_eq!(buf.readable_bytes(), values.len() * 4);
        assert_eq!(buf.read_i32s(values.len()).unwrap(), values);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_i16_round_trip_preserves_bits() {
        let values: Vec<i16> = vec![0, 1, -1, i16::MIN, i16::MAX, 0x1234, -0x1234];
        let mut buf = RegisterBuf::from_i16s(&values).unwrap();
        assert_eq!(&buf.as_slice()[..4], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(buf.read_i16s(values.len()).unwrap(), values);

        let unsigned: Vec<u16> = (0..125u16).map(|i| i.wrapping_mul(523)).collect();
        let mut buf = RegisterBuf::from_u16s(&unsigned).unwrap();
        assert_eq!(buf.read_u16s(unsigned.len()).unwrap(), unsigned);
    }

    #[test]
    fn test_mixed_reads_follow_write_order() {
        let mut buf = RegisterBuf::with_capacity(16);
        buf.add_u16(0xABCD).add_i32(-42).add_i16(-3);
        buf.add_bytes(&[0x01, 0x02]).unwrap();

        assert_eq!(buf.register_count(), 6);
        assert_eq!(buf.read_u16().unwrap(), 0xABCD);
        assert_eq!(buf.read_i32().unwrap(), -42);
        assert_eq!(buf.read_i16().unwrap(), -3);
        assert_eq!(buf.read_byte().unwrap(), 0x01);
        assert_eq!(buf.read_bytes(1).unwrap(), vec![0x02]);
    }

    // ========================================================================
    // Limits
    // ========================================================================

    #[test]
    fn test_from_i32s_limit() {
        assert!(RegisterBuf::from_i32s(&[7; 62]).is_ok());
        let err = RegisterBuf::from_i32s(&[7; 63]).unwrap_err();
        assert!(matches!(err, ModbusError::InvalidArgument(_)));
    }

    #[test]
    fn test_from_shorts_limit() {
        assert!(RegisterBuf::from_i16s(&[7; 125]).is_ok());
        assert!(RegisterBuf::from_i16s(&[7; 126]).is_err());
        assert!(RegisterBuf::from_u16s(&[7; 125]).is_ok());
        assert!(RegisterBuf::from_u16s(&[7; 126]).is_err());
    }

    #[test]
    fn test_odd_lengths_rejected() {
        for len in [1usize, 3, 5, 251] {
            let bytes = vec![0u8; len];
            assert!(RegisterBuf::from_bytes(&bytes).is_err(), "len {len}");
            assert!(RegisterBuf::default().add_bytes(&bytes).is_err(), "len {len}");
        }
        for len in [0usize, 2, 4, 250, 252] {
            let bytes = vec![0u8; len];
            assert!(RegisterBuf::from_bytes(&bytes).is_ok(), "len {len}");
            assert!(RegisterBuf::default().add_bytes(&bytes).is_ok(), "len {len}");
        }
    }

    #[test]
    fn test_validate_for_transport_boundary() {
        let ok = RegisterBuf::from_bytes(&[0u8; 250]).unwrap();
        assert!(ok.validate_for_transport().is_ok());

        let too_big = RegisterBuf::from_bytes(&[0u8; 252]).unwrap();
        assert!(too_big.validate_for_transport().is_err());

        // Only readable bytes count
        let mut partly_read = too_big.clone();
        partly_read.skip_registers(1).unwrap();
        assert!(partly_read.validate_for_transport().is_ok());
    }

    #[test]
    fn test_transport_payload_starts_at_first_byte() {
        let mut buf = RegisterBuf::from_i32s(&[1, 2]).unwrap();
        assert_eq!(buf.read_i32().unwrap(), 1);
        let payload = buf.transport_payload().unwrap();
        assert_eq!(&payload[..], &[0, 1, 0, 0, 0, 2, 0, 0]);
        // Cursor is untouched
        assert_eq!(buf.readable_bytes(), 4);

        // Fully read buffers still carry their registers
        buf.skip_registers(2).unwrap();
        assert_eq!(buf.transport_payload().unwrap().len(), 8);

        assert!(RegisterBuf::default().transport_payload().is_err());
    }

    #[test]
    fn test_transport_payload_limit_counts_every_byte() {
        let mut oversized = RegisterBuf::with_capacity(252);
        oversized.add_u16s(&[0; 126]);
        assert!(oversized.transport_payload().is_err());
        // Reading past the extra register does not make it fit
        oversized.skip_registers(1).unwrap();
        assert!(oversized.validate_for_transport().is_ok());
        assert!(oversized.transport_payload().is_err());

        let full = RegisterBuf::from_bytes(&[0u8; 250]).unwrap();
        assert_eq!(full.transport_payload().unwrap().len(), 250);
    }

    // ========================================================================
    // Cursor Behaviour
    // ========================================================================

    #[test]
    fn test_bits_lsb_first() {
        let mut buf = RegisterBuf::from_u16s(&[5, 0x8000, 0, 0xFFFF]).unwrap();
        assert_eq!(buf.read_bits_lsb_first().unwrap(), "1010000000000000");
        assert_eq!(buf.read_bits_lsb_first().unwrap(), "0000000000000001");
        assert_eq!(buf.read_bits_lsb_first().unwrap(), "0000000000000000");
        assert_eq!(buf.read_bits_lsb_first().unwrap(), "1111111111111111");
    }

    #[test]
    fn test_underflow_leaves_cursor_in_place() {
        let mut buf = RegisterBuf::from_u16s(&[0x0102]).unwrap();
        let err = buf.read_i32().unwrap_err();
        assert_eq!(err, ModbusError::Underflow { needed: 4, available: 2 });
        assert_eq!(buf.readable_bytes(), 2);
        assert_eq!(buf.read_u16().unwrap(), 0x0102);
        assert!(buf.read_byte().is_err());
        assert!(buf.read_u16s(1).is_err());
    }

    #[test]
    fn test_huge_counts_underflow() {
        let mut buf = RegisterBuf::from_u16s(&[1, 2]).unwrap();
        assert!(matches!(
            buf.read_i32s(usize::MAX / 2),
            Err(ModbusError::Underflow { .. })
        ));
        assert!(matches!(
            buf.read_i16s(usize::MAX),
            Err(ModbusError::Underflow { .. })
        ));
        assert!(matches!(
            buf.read_u16s(usize::MAX),
            Err(ModbusError::Underflow { .. })
        ));
        assert!(matches!(
            buf.skip_registers(usize::MAX),
            Err(ModbusError::Underflow { .. })
        ));
        assert_eq!(buf.readable_bytes(), 4);
        assert_eq!(buf.read_u16s(2).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_skip_and_rewind() {
        let mut buf = RegisterBuf::from_u16s(&[10, 20, 30]).unwrap();
        buf.skip_registers(2).unwrap();
        assert_eq!(buf.read_u16().unwrap(), 30);
        assert!(buf.skip_registers(1).is_err());

        buf.rewind();
        assert_eq!(buf.read_u16().unwrap(), 10);
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_append_copies_readable_bytes() {
        let mut source = RegisterBuf::from_u16s(&[1, 2, 3]).unwrap();
        source.skip_registers(1).unwrap();

        let mut target = RegisterBuf::from_u16s(&[9]).unwrap();
        target.append(&source).unwrap();
        assert_eq!(target.read_u16s(3).unwrap(), vec![9, 2, 3]);
        // Source is not consumed
        assert_eq!(source.readable_bytes(), 4);

        source.read_byte().unwrap();
        assert!(target.append(&source).is_err());
    }

    #[test]
    fn test_release() {
        let buf = RegisterBuf::from_u16s(&[1, 2]).unwrap();
        buf.release();
    }
}
