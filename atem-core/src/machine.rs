//! The connection state machine shared by both ends of an ATEM session.
//!
//! [`Connection`] tracks exactly the state the reference implementation keeps per session: a
//! 15-bit local/remote id pair, the session id, and which canned outgoing buffer (OPEN/ACCEPT,
//! ACK, CLOSING, or RETXREQ) is currently armed. The reference tells a first ACCEPT from a
//! retransmitted one by comparing a pointer to its one singleton write buffer; this port tags the
//! armed buffer by value instead, since Rust gives no cheap analog to that pointer identity.

use crate::codec::{self, Header};
use crate::protocol::{flag, offset, Opcode, LEN_ACK, LEN_HEADER, LEN_SYN, LIMIT_REMOTEID, RING_HALF};

/// Which canned reply (if any) is currently armed for retransmission on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArmedWrite {
	#[default]
	None,
	Open,
	Accept,
	Ack,
	Closing,
	RetxReq,
}

/// Outcome of feeding one incoming packet to [`Connection::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
	/// The packet was malformed or addressed to the wrong session; ignore it.
	Error,
	/// A reply is armed and should be sent, but only this once — it must not be tracked as an
	/// in-flight retransmission (mirrors the reference's distinction between a first ACCEPT and
	/// a retransmitted one).
	WriteOnly,
	/// The session was just accepted; a reply is armed.
	Accepted,
	/// The peer rejected the connection attempt.
	Rejected,
	/// The peer is closing; a CLOSING reply is armed.
	Closing,
	/// The peer confirmed closure; the connection is finished.
	Closed,
	/// The packet carried application data (and possibly also armed a reply).
	Data,
	/// Nothing to send, nothing new to surface.
	None,
}

/// Per-session protocol state, independent of transport (used identically by the client driver
/// and the proxy's per-session table entries).
#[derive(Debug, Clone)]
pub struct Connection {
	pub session_id: u16,
	pub local_id: u16,
	pub remote_id: u16,
	pub unknown_id: u16,
	armed: ArmedWrite,
	write_buf: Vec<u8>,
	resends_left: u8,
}

impl Connection {
	/// Builds a connection in the "about to send OPEN" state, as a client does before hearing
	/// back from the switcher.
	pub fn open(session_id: u16) -> Self {
		let mut conn = Self {
			session_id,
			local_id: 0,
			remote_id: 0,
			unknown_id: 0,
			armed: ArmedWrite::None,
			write_buf: Vec::new(),
			resends_left: crate::protocol::RESENDS,
		};

		let mut buf = vec![0u8; LEN_SYN];
		codec::write_header(&mut buf, flag::SYN, LEN_SYN as u16, session_id, 0, 0, 0);
		codec::set_opcode(&mut buf, Opcode::Open);
		conn.write_buf = buf;
		conn.armed = ArmedWrite::Open;
		conn
	}

	/// Builds a connection in the "about to send ACCEPT" state, as the proxy/switcher does in
	/// response to an OPEN.
	pub fn accept(session_id: u16, client_session_id: u16, unknown_id: u16) -> Self {
		let mut conn = Self {
			session_id,
			local_id: 0,
			remote_id: 0,
			unknown_id,
			armed: ArmedWrite::None,
			write_buf: Vec::new(),
			resends_left: crate::protocol::RESENDS,
		};

		let mut buf = vec![0u8; LEN_SYN];
		codec::write_header(&mut buf, flag::SYN, LEN_SYN as u16, session_id, 0, 0, 0);
		buf[offset::UNKNOWNID_HIGH] = (unknown_id >> 8) as u8;
		buf[offset::UNKNOWNID_LOW] = unknown_id as u8;
		codec::set_opcode(&mut buf, Opcode::Accept);
		codec::set_new_session_id(&mut buf, client_session_id);
		conn.write_buf = buf;
		conn.armed = ArmedWrite::Accept;
		conn
	}

	/// The bytes currently armed for transmission (the last OPEN/ACCEPT/ACK/CLOSING/RETXREQ
	/// built by this connection), if any.
	pub fn armed_write(&self) -> Option<&[u8]> {
		(self.armed != ArmedWrite::None).then_some(self.write_buf.as_slice())
	}

	pub fn armed(&self) -> ArmedWrite {
		self.armed
	}

	fn arm_ack(&mut self) {
		let mut buf = vec![0u8; LEN_ACK];
		codec::write_header(&mut buf, flag::ACK, LEN_ACK as u16, self.session_id, self.remote_id, self.local_id, 0);
		self.write_buf = buf;
		self.armed = ArmedWrite::Ack;
	}

	fn arm_closing(&mut self) {
		let mut buf = vec![0u8; LEN_SYN];
		codec::write_header(&mut buf, flag::SYN, LEN_SYN as u16, self.session_id, 0, 0, 0);
		codec::set_opcode(&mut buf, Opcode::Closing);
		self.write_buf = buf;
		self.armed = ArmedWrite::Closing;
		self.resends_left = crate::protocol::RESENDS_CLOSING;
	}

	/// Arms a RETXREQ asking the peer to resend starting at `next` (carried in the header's
	/// local-id field, matching the reference's `buf_retxreq` layout).
	fn arm_retxreq(&mut self, next: u16) {
		let mut buf = vec![0u8; LEN_HEADER];
		codec::write_header(&mut buf, flag::RETXREQ, LEN_HEADER as u16, self.session_id, 0, next, 0);
		self.write_buf = buf;
		self.armed = ArmedWrite::RetxReq;
	}

	/// Feeds one received datagram (the full packet, header included) to the state machine.
	///
	/// `buf` is the whole datagram as received off the wire; `payload` is the bytes following
	/// the 12-byte header (empty for ACK/SYN packets, which carry no command records).
	pub fn parse(&mut self, buf: &[u8], payload: &[u8]) -> Status {
		let header = codec::decode_header(buf);

		if header.session_id != self.session_id {
			return Status::Error;
		}

		if header.flags & flag::SYN != 0 {
			return self.parse_syn(&header, codec::opcode(buf));
		}

		if header.flags & flag::RETXREQ != 0 {
			// Peer is asking us to resend from `header.remote_id` onward; the retransmit queue
			// (owned by the caller) is responsible for replaying those packets. We only surface
			// that a request arrived.
			return Status::None;
		}

		if header.flags & flag::ACK != 0 && payload.is_empty() {
			// Bare ACK: nothing further to do, the caller's retransmit queue drains up to
			// `header.ack_id`.
			return Status::None;
		}

		if header.flags & flag::ACKREQ != 0 {
			let remote_id_next = (self.remote_id + 1) & LIMIT_REMOTEID;
			let remote_id_recved = header.remote_id & LIMIT_REMOTEID;

			if remote_id_recved == remote_id_next {
				self.remote_id = remote_id_recved;
				self.arm_ack();
				return Status::Data;
			}

			if (remote_id_recved.wrapping_sub(remote_id_next) & LIMIT_REMOTEID) < RING_HALF {
				// Ahead with a gap: ask the peer to resend starting at the id we're missing.
				self.arm_retxreq(remote_id_next);
			} else {
				// Behind: a stale duplicate. Re-acknowledge the last id we actually accepted.
				self.arm_ack();
			}

			return Status::WriteOnly;
		}

		Status::None
	}

	fn parse_syn(&mut self, header: &Header, opcode: Option<Opcode>) -> Status {
		match opcode {
			Some(Opcode::Open) => {
				// Only meaningful to a server-side connection that hasn't accepted yet.
				Status::None
			}
			Some(Opcode::Accept) => {
				if self.armed == ArmedWrite::Accept {
					// Retransmitted ACCEPT we already answered; re-arm our ACK-only reply
					// without re-entering the Accepted state (would otherwise double-fire
					// session setup on every duplicate).
					return Status::WriteOnly;
				}

				self.local_id = header.local_id;
				self.remote_id = 0;
				self.arm_ack();
				Status::Accepted
			}
			Some(Opcode::Reject) => Status::Rejected,
			Some(Opcode::Closing) => {
				self.arm_closing();
				Status::Closing
			}
			Some(Opcode::Closed) => Status::Closed,
			None => Status::Error,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn accept_syn(session_id: u16, local_id: u16) -> Vec<u8> {
		let mut buf = vec![0u8; LEN_SYN];
		codec::write_header(&mut buf, flag::SYN, LEN_SYN as u16, session_id, 0, local_id, 0);
		codec::set_opcode(&mut buf, Opcode::Accept);
		buf
	}

	#[test]
	fn accept_arms_ack_and_sets_ids() {
		let mut conn = Connection::open(0x1337);
		let buf = accept_syn(0x1337, 0x0042);

		let status = conn.parse(&buf, &[]);
		assert_eq!(status, Status::Accepted);
		assert_eq!(conn.local_id, 0x0042);
		assert_eq!(conn.armed(), ArmedWrite::Ack);
	}

	#[test]
	fn duplicate_accept_is_write_only() {
		let mut conn = Connection::open(0x1337);
		let buf = accept_syn(0x1337, 0x0042);

		conn.parse(&buf, &[]);
		let status = conn.parse(&buf, &[]);
		assert_eq!(status, Status::WriteOnly);
	}

	#[test]
	fn ackreq_with_next_remote_id_yields_data() {
		let mut conn = Connection::open(0x1337);
		conn.local_id = 1;
		let buf = codec::encode_header(flag::ACKREQ, LEN_HEADER as u16, 0x1337, 0, 1, 1);

		let status = conn.parse(&buf, &[1, 2, 3]);
		assert_eq!(status, Status::Data);
		assert_eq!(conn.remote_id, 1);
		assert_eq!(conn.armed(), ArmedWrite::Ack);
	}

	#[test]
	fn ackreq_out_of_order_requests_retransmit() {
		let mut conn = Connection::open(0x1337);
		conn.remote_id = 5;
		let buf = codec::encode_header(flag::ACKREQ, LEN_HEADER as u16, 0x1337, 0, 1, 9);

		let status = conn.parse(&buf, &[1]);
		assert_eq!(status, Status::WriteOnly);
		assert_eq!(conn.armed(), ArmedWrite::RetxReq);
		assert_eq!(conn.remote_id, 5, "a gapped id must not advance remote_id");
	}

	#[test]
	fn ackreq_stale_duplicate_reacknowledges_last_good_id() {
		let mut conn = Connection::open(0x1337);
		conn.remote_id = 5;
		let buf = codec::encode_header(flag::ACKREQ, LEN_HEADER as u16, 0x1337, 0, 1, 3);

		let status = conn.parse(&buf, &[1]);
		assert_eq!(status, Status::WriteOnly);
		assert_eq!(conn.armed(), ArmedWrite::Ack);
		assert_eq!(conn.remote_id, 5);
	}

	#[test]
	fn wrong_session_id_is_ignored() {
		let mut conn = Connection::open(0x1337);
		let buf = codec::encode_header(flag::ACK, LEN_ACK as u16, 0x9999, 0, 0, 0);
		assert_eq!(conn.parse(&buf, &[]), Status::Error);
	}
}
