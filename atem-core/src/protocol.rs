//! Wire-format constants for the ATEM UDP control protocol.

/// Default UDP port the switcher (and this proxy) listens on.
pub const PORT: u16 = 9910;

/// A connection with no traffic for this long is considered dropped by the client driver.
pub const TIMEOUT_MS: u64 = 5000;

/// Largest datagram this implementation will read or write.
pub const PACKET_LEN_MAX: usize = 2047;
/// MTU-safe datagram size official peers limit themselves to.
pub const PACKET_LEN_MAX_SOFT: usize = 1422;

pub const LEN_HEADER: usize = 12;
pub const LEN_SYN: usize = 20;
pub const LEN_ACK: usize = 12;
pub const LEN_CMDHEADER: usize = 8;

/// Byte offsets within the fixed 12-byte header.
pub mod offset {
	pub const FLAGS: usize = 0;
	pub const LEN_HIGH: usize = 0;
	pub const LEN_LOW: usize = 1;
	pub const SESSIONID_HIGH: usize = 2;
	pub const SESSIONID_LOW: usize = 3;
	pub const ACKID_HIGH: usize = 4;
	pub const ACKID_LOW: usize = 5;
	pub const LOCALID_HIGH: usize = 6;
	pub const LOCALID_LOW: usize = 7;
	pub const UNKNOWNID_HIGH: usize = 8;
	pub const UNKNOWNID_LOW: usize = 9;
	pub const REMOTEID_HIGH: usize = 10;
	pub const REMOTEID_LOW: usize = 11;
	pub const OPCODE: usize = 12;
	pub const NEWSESSIONID_HIGH: usize = 14;
	pub const NEWSESSIONID_LOW: usize = 15;
	/// Offset of the first command record's name field within the packet's payload.
	pub const CMDNAME: usize = 4;
}

/// Header flag bits, packed into the high 3 bits of byte 0.
pub mod flag {
	pub const ACKREQ: u8 = 0x08;
	pub const SYN: u8 = 0x10;
	pub const RETX: u8 = 0x20;
	pub const RETXREQ: u8 = 0x40;
	pub const ACK: u8 = 0x80;
}

/// Opcodes carried in byte 12 of SYN packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
	Open = 1,
	Accept = 2,
	Reject = 3,
	Closing = 4,
	Closed = 5,
}

impl Opcode {
	pub fn from_u8(v: u8) -> Option<Self> {
		Some(match v {
			1 => Self::Open,
			2 => Self::Accept,
			3 => Self::Reject,
			4 => Self::Closing,
			5 => Self::Closed,
			_ => return None,
		})
	}
}

/// Remote-ids wrap modulo this value; the high bit is always zero on the wire.
pub const LIMIT_REMOTEID: u16 = 0x7fff;
/// Half of the remote-id ring, used to distinguish "ahead" from "behind" with wraparound.
pub const RING_HALF: u16 = 0x4000;
/// Remote-id ring size (`LIMIT_REMOTEID + 1`).
pub const RING_SIZE: u32 = 0x8000;

/// Default number of retransmits for an ordinary data packet before it escalates to closing.
pub const RESENDS: u8 = 10;
/// Retransmits budget for a CLOSING SYN sent to a straggler.
pub const RESENDS_CLOSING: u8 = 1;
/// Default delay between retransmits, in milliseconds.
pub const RESEND_TIME_MS: u64 = 200;
/// Default interval between keepalive pings, in milliseconds.
pub const PING_INTERVAL_MS: u64 = 500;

/// The reserved "unknown id" field occasionally validated by the reference implementation
/// against these constants; this implementation reads and writes it as opaque bytes and
/// never enforces either value (see design notes).
pub const UNKNOWN_ID_A: u16 = 0x003A;
pub const UNKNOWN_ID_B: u16 = 0x00CD;

/// Packs a 4-character ASCII command name into its big-endian `u32` representation.
pub const fn cmd_name(name: [u8; 4]) -> u32 {
	u32::from_be_bytes(name)
}

pub const CMD_VER: u32 = cmd_name(*b"_ver");
pub const CMD_TALLY: u32 = cmd_name(*b"TlIn");
pub const CMD_CAMERA_CONTROL: u32 = cmd_name(*b"CCdP");

/// Tally state bits, one byte per (1-based) camera index in a `TlIn` record.
pub mod tally {
	pub const PGM: u8 = 0x01;
	pub const PVW: u8 = 0x02;
}
