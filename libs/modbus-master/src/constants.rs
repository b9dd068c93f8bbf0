//! Modbus TCP protocol constants
//!
//! Limits here follow what the register codec and the connection engine put
//! on the wire, not the full Modbus application protocol table.

use std::time::Duration;

// ============================================================================
// Addressing
// ============================================================================

/// Default Modbus TCP port, used when an endpoint omits `:port`
pub const DEFAULT_PORT: u16 = 502;

/// Unit identifier written into every request
pub const UNIT_ID: u8 = 0x01;

/// Protocol identifier in the MBAP header (always 0 for Modbus)
pub const PROTOCOL_ID: u16 = 0x0000;

// ============================================================================
// Function Codes
// ============================================================================

/// FC03 - Read Holding Registers
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// FC16 - Write Multiple Registers
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Bytes before the MBAP length field value starts counting:
/// Transaction ID(2) + Protocol ID(2) + Length(2)
pub const MBAP_PREFIX_LEN: usize = 6;

/// Offset of the MBAP length field
pub const LENGTH_FIELD_OFFSET: usize = 4;

/// Smallest response that still carries a transaction id and a function code:
/// MBAP prefix(6) + Unit ID(1) + FC(1)
pub const MIN_RESPONSE_LEN: usize = MBAP_PREFIX_LEN + 2;

/// Hard limit for one inbound frame (header + 250-byte payload + slack)
pub const MAX_FRAME_LEN: usize = 264;

/// Read request remaining-length value: Unit(1) + FC(1) + Addr(2) + Count(2)
pub const READ_REQUEST_LENGTH: u16 = 6;

/// Write request remaining-length value without the register data:
/// Unit(1) + FC(1) + Addr(2) + Count(2) + ByteCount(1)
pub const WRITE_REQUEST_BASE_LENGTH: u16 = 7;

// ============================================================================
// Register Limits
// ============================================================================

/// Maximum registers carried by one request or response
pub const MAX_REGISTERS: usize = 125;

/// Maximum 32-bit values in one payload (two registers each, rounded down)
pub const MAX_INT32_VALUES: usize = MAX_REGISTERS / 2;

/// Maximum register payload bytes on the wire (125 registers)
pub const MAX_PAYLOAD_BYTES: usize = MAX_REGISTERS * 2;

// ============================================================================
// Engine Timing
// ============================================================================

/// Minimum spacing between two outbound frames on one connection.
///
/// Some devices answer back-to-back requests with "Slave Device Busy";
/// 5 ms keeps the busy rate under 0.5% over 1000 consecutive reads.
pub const WRITE_INTERVAL: Duration = Duration::from_millis(5);

/// Transaction ids are taken modulo this value
pub const TRANSACTION_ID_MODULUS: u32 = 65535;

/// Upper bound for caller-supplied retry counts
pub const MAX_RETRIES: u32 = 5;
