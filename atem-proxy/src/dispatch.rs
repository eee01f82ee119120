//! Routes one inbound datagram to the session table, grounded on the reference implementation's
//! `atem_server_recv`: branch on whether the caller already has a server-assigned session id,
//! then on the packet's flags.

use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use atem_core::codec;
use atem_core::protocol::{flag, Opcode, LEN_HEADER, LEN_SYN, PACKET_LEN_MAX};
use log::{debug, warn};

use crate::session::SessionTable;

/// Handles one datagram of `len` bytes in `buf`, received from `peer`.
pub fn handle_datagram(table: &mut SessionTable, socket: &UdpSocket, buf: &[u8], len: usize, peer: SocketAddr, now: Instant) -> std::io::Result<()> {
	if len < LEN_HEADER || len > PACKET_LEN_MAX {
		debug!("dropped datagram of size {len} from {peer}");
		return Ok(());
	}

	let buf = &buf[..len];
	let header = codec::decode_header(buf);

	if header.session_id & 0x8000 == 0 {
		return handle_opening(table, socket, buf, peer, now);
	}

	if !table.peer_matches(header.session_id, peer) {
		debug!("dropped packet for session {:#06x} from unexpected peer {peer}", header.session_id);
		return Ok(());
	}

	if header.flags & flag::ACK != 0 {
		table.acknowledge(header.session_id, header.ack_id);
		return Ok(());
	}

	if header.flags & flag::SYN != 0 {
		return match codec::opcode(buf) {
			Some(Opcode::Closing) => table.closing(header.session_id, socket),
			Some(Opcode::Closed) => {
				table.closed(header.session_id);
				Ok(())
			}
			other => {
				debug!("unsupported SYN opcode {other:?} for session {:#06x}", header.session_id);
				Ok(())
			}
		};
	}

	warn!("unrecognized flags {:#04x} for session {:#06x}", header.flags, header.session_id);
	Ok(())
}

fn handle_opening(table: &mut SessionTable, socket: &UdpSocket, buf: &[u8], peer: SocketAddr, now: Instant) -> std::io::Result<()> {
	let header = codec::decode_header(buf);

	if header.flags & flag::SYN != 0 && buf.len() == LEN_SYN && codec::opcode(buf) == Some(Opcode::Open) {
		return table.create(header.session_id, peer, socket, now);
	}

	if header.flags & flag::ACK != 0 {
		table.connect(header.session_id, peer);
		return Ok(());
	}

	debug!("ignored non-opening packet {:#04x} for request id {:#06x}", header.flags, header.session_id);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use atem_core::protocol::LEN_ACK;

	#[test]
	fn undersized_datagram_is_dropped() {
		let mut table = SessionTable::new(5);
		let socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
		let peer: SocketAddr = "127.0.0.1:9911".parse().unwrap();
		let buf = [0u8; 4];

		handle_datagram(&mut table, &socket, &buf, buf.len(), peer, Instant::now()).unwrap();
		assert_eq!(table.len(), 0);
	}

	#[test]
	fn open_syn_creates_a_session() {
		let mut table = SessionTable::new(5);
		let socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
		let peer: SocketAddr = "127.0.0.1:9911".parse().unwrap();

		let mut buf = vec![0u8; LEN_SYN];
		codec::write_header(&mut buf, flag::SYN, LEN_SYN as u16, 0x1234, 0, 0, 0);
		codec::set_opcode(&mut buf, Opcode::Open);

		handle_datagram(&mut table, &socket, &buf, buf.len(), peer, Instant::now()).unwrap();
		assert_eq!(table.len(), 1);
	}

	#[test]
	fn unknown_server_session_is_ignored() {
		let mut table = SessionTable::new(5);
		let socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
		let peer: SocketAddr = "127.0.0.1:9911".parse().unwrap();

		let mut buf = vec![0u8; LEN_ACK];
		codec::write_header(&mut buf, flag::ACK, LEN_ACK as u16, 0x8001, 0, 0, 0);

		handle_datagram(&mut table, &socket, &buf, buf.len(), peer, Instant::now()).unwrap();
		assert_eq!(table.len(), 0);
	}
}
