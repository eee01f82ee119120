//! The proxy's session table: every client the proxy is currently talking to, keyed by a
//! 65536-entry direct lookup array, partitioned in-place into a "connected" segment and an
//! "opening or closing" segment.
//!
//! Grounded on the reference implementation's `atem_session.c`. The dense-array-plus-lookup-table
//! design, the swap-to-partition trick for moving a session between segments, and the ×1.6
//! growth / ÷1.6² shrink hysteresis on the backing array are all kept; the reference's intrusive
//! packet linked list is replaced by [`crate::packet::PacketQueue`].

use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;
use std::time::Instant;

use atem_core::codec;
use atem_core::protocol::{flag, offset, Opcode, LEN_SYN};
use log::debug;

use crate::packet::{Packet, PacketQueue, PacketSession};

const GROWTH: f32 = 1.6;
const LOOKUP_SIZE: usize = 1 << 16;

/// One client the proxy is currently talking to.
pub struct Session {
	/// Server-assigned id (MSB set), stable for the session's whole lifetime.
	pub session_id: u16,
	/// The id currently written into outgoing packets: the client's request id while opening,
	/// `session_id` once connected.
	wire_id: u16,
	/// The client-assigned id this session opened with, while it's still in the opening segment.
	request_id: Option<u16>,
	pub peer_addr: SocketAddr,
	pub remote_id: u16,
}

impl Session {
	fn send(&self, socket: &UdpSocket, buf: &[u8]) -> std::io::Result<()> {
		let mut out = buf.to_vec();
		out[offset::SESSIONID_HIGH] = (self.wire_id >> 8) as u8;
		out[offset::SESSIONID_LOW] = self.wire_id as u8;
		socket.send_to(&out, self.peer_addr)?;
		Ok(())
	}

	/// Resends an already-enqueued packet: stamps this recipient's `remote_id` into the header
	/// (each session in a fan-out packet acknowledges under its own id) and sets the RETX flag so
	/// the peer can tell this apart from the original send (`atem_packet_send`/
	/// `atem_packet_retransmit`).
	fn send_retransmit(&self, socket: &UdpSocket, buf: &[u8], remote_id: u16) -> std::io::Result<()> {
		let mut out = buf.to_vec();
		out[offset::FLAGS] |= flag::RETX;
		out[offset::SESSIONID_HIGH] = (self.wire_id >> 8) as u8;
		out[offset::SESSIONID_LOW] = self.wire_id as u8;
		out[offset::REMOTEID_HIGH] = (remote_id >> 8) as u8;
		out[offset::REMOTEID_LOW] = remote_id as u8;
		socket.send_to(&out, self.peer_addr)?;
		Ok(())
	}
}

/// The proxy's whole session table plus its shared retransmit queue.
pub struct SessionTable {
	sessions: Vec<Session>,
	/// Sessions `[0, connected)` are fully connected and receive broadcasts; `[connected, len())`
	/// are mid opening- or closing-handshake.
	connected: usize,
	lookup: Vec<i32>,
	limit: usize,
	session_id_last: u16,
	pub closing: bool,
	pub packets: PacketQueue,
}

impl SessionTable {
	pub fn new(limit: usize) -> Self {
		Self {
			sessions: Vec::new(),
			connected: 0,
			lookup: vec![0; LOOKUP_SIZE],
			limit,
			session_id_last: 0,
			closing: false,
			packets: PacketQueue::new(),
		}
	}

	pub fn connected_count(&self) -> usize {
		self.connected
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	fn lookup_get(&self, id: u16) -> Option<usize> {
		let slot = self.lookup[id as usize];
		(slot != 0).then(|| (slot - 1) as usize)
	}

	fn lookup_set(&mut self, id: u16, index: usize) {
		self.lookup[id as usize] = index as i32 + 1;
	}

	fn lookup_clear(&mut self, id: u16) {
		self.lookup[id as usize] = 0;
	}

	fn is_connected(&self, index: usize) -> bool {
		index < self.connected
	}

	/// Swaps the session at `index` with the first session after the connected segment,
	/// preserving the lookup table's invariant.
	fn swap(&mut self, index: usize) {
		self.sessions.swap(index, self.connected);
		let moved_a = self.sessions[index].session_id;
		let moved_b = self.sessions[self.connected].session_id;
		self.lookup_set(moved_a, index);
		self.lookup_set(moved_b, self.connected);
	}

	fn grow_if_needed(&mut self) {
		if self.sessions.len() == self.sessions.capacity() {
			let grown = ((self.sessions.capacity().max(1) as f32) * GROWTH).ceil() as usize;
			let target = grown.min(self.limit).max(self.sessions.len() + 1);
			self.sessions.reserve_exact(target.saturating_sub(self.sessions.len()));
		}
	}

	fn shrink_if_needed(&mut self) {
		let cap = self.sessions.capacity();
		let shrink_limit = (cap as f32 / (GROWTH * GROWTH)) as usize;
		if self.sessions.len() < shrink_limit && shrink_limit > 1 {
			self.sessions.shrink_to((cap as f32 / GROWTH) as usize);
		}
	}

	/// Removes the session at `index` from the table, swapping the last session into its place.
	fn release(&mut self, index: usize) {
		let last = self.sessions.len() - 1;
		if index != last {
			self.sessions.swap(index, last);
			let moved = &self.sessions[index];
			self.lookup_set(moved.session_id, index);
			if let Some(request_id) = moved.request_id {
				self.lookup_set(request_id, index);
			}
		}
		self.sessions.pop();
		self.shrink_if_needed();
	}

	fn terminate(&mut self, index: usize) {
		let session_id = self.sessions[index].session_id;
		self.lookup_clear(session_id);
		self.release(index);
	}

	/// Handles an OPEN SYN: creates a new session, or retransmits the ACCEPT for an
	/// already-in-progress one.
	pub fn create(&mut self, request_id: u16, peer_addr: SocketAddr, socket: &UdpSocket, now: Instant) -> std::io::Result<()> {
		if let Some(index) = self.lookup_get(request_id) {
			let session = &self.sessions[index];
			if session.peer_addr != peer_addr {
				debug!("rejected OPEN retransmit from wrong peer for request id {request_id:#06x}");
				return Ok(());
			}

			let mut buf = vec![0u8; LEN_SYN];
			codec::write_header(&mut buf, flag::SYN | flag::RETX, LEN_SYN as u16, 0, 0, 0, 0);
			codec::set_opcode(&mut buf, Opcode::Accept);
			codec::set_new_session_id(&mut buf, session.session_id & !0x8000);
			session.send(socket, &buf)?;
			return Ok(());
		}

		if self.sessions.len() >= self.limit || self.closing {
			let mut buf = vec![0u8; LEN_SYN];
			codec::write_header(&mut buf, flag::SYN, LEN_SYN as u16, request_id, 0, 0, 0);
			codec::set_opcode(&mut buf, Opcode::Reject);
			socket.send_to(&buf, peer_addr)?;
			return Ok(());
		}

		self.grow_if_needed();
		self.session_id_last = (self.session_id_last + 1) & 0x7fff;
		let session_id = self.session_id_last | 0x8000;

		let index = self.sessions.len();
		self.sessions.push(Session { session_id, wire_id: request_id, request_id: Some(request_id), peer_addr, remote_id: 0 });
		self.lookup_set(request_id, index);
		self.lookup_set(session_id, index);

		debug!("creating session {session_id:#06x} ({request_id:#06x}) from {peer_addr}");

		let mut buf = vec![0u8; LEN_SYN];
		codec::write_header(&mut buf, flag::SYN, LEN_SYN as u16, 0, 0, 0, 0);
		codec::set_opcode(&mut buf, Opcode::Accept);
		codec::set_new_session_id(&mut buf, self.session_id_last);
		self.sessions[index].send(socket, &buf)?;

		let packet_session = PacketSession { session_id, remote_id: 0 };
		self.packets.enqueue(Rc::from(buf.into_boxed_slice()), vec![packet_session], false, now);

		Ok(())
	}

	/// Handles an ACK completing the opening handshake.
	pub fn connect(&mut self, request_id: u16, peer_addr: SocketAddr) {
		let Some(index) = self.lookup_get(request_id) else {
			debug!("no session for opening handshake completion {request_id:#06x}");
			return;
		};

		if self.sessions[index].peer_addr != peer_addr {
			debug!("completion request from another peer rejected");
			return;
		}

		if !self.is_connected(index) {
			let connected_slot = self.connected;
			if index != connected_slot {
				self.swap(index);
			}
		}

		self.connected += 1;
		self.lookup_clear(request_id);

		let session = &mut self.sessions[self.connected - 1];
		session.wire_id = session.session_id;
		session.request_id = None;

		self.packets.acknowledge(session.session_id, 0);
		debug!("session connected {:#06x}", session.session_id);
	}

	/// Begins closing the session at `session_id` (proxy-initiated, e.g. on shutdown).
	pub fn drop_session(&mut self, session_id: u16) {
		let Some(index) = self.lookup_get(session_id) else { return };

		if self.is_connected(index) {
			self.connected -= 1;
			if index != self.connected {
				self.swap(index);
			}
		} else if let Some(request_id) = self.sessions[index].request_id {
			self.lookup_clear(request_id);
			self.sessions[index].request_id = None;
		}
	}

	/// Handles a CLOSING SYN from the peer: acknowledges with CLOSED and tears the session down
	/// immediately (the peer, not the proxy, drove this handshake, so there's nothing left to
	/// retransmit-track).
	pub fn closing(&mut self, session_id: u16, socket: &UdpSocket) -> std::io::Result<()> {
		let Some(index) = self.lookup_get(session_id) else { return Ok(()) };

		let mut buf = vec![0u8; LEN_SYN];
		codec::write_header(&mut buf, flag::SYN, LEN_SYN as u16, 0, 0, 0, 0);
		codec::set_opcode(&mut buf, Opcode::Closed);
		self.sessions[index].send(socket, &buf)?;

		self.packets.flush(session_id);

		if !self.is_connected(index) {
			if let Some(request_id) = self.sessions[index].request_id.take() {
				self.lookup_clear(request_id);
			}
			self.terminate(index);
			return Ok(());
		}

		self.connected -= 1;
		if index != self.connected {
			self.sessions.swap(index, self.connected);
			let moved = self.sessions[index].session_id;
			self.lookup_set(moved, index);
		}
		self.terminate(self.connected);

		Ok(())
	}

	/// Handles a CLOSED SYN confirming a proxy-initiated closing handshake (see
	/// [`Self::escalate_to_closing`]).
	pub fn closed(&mut self, session_id: u16) {
		let Some(index) = self.lookup_get(session_id) else { return };
		self.packets.flush(session_id);
		self.terminate(index);
	}

	/// Drops `session_id` out of the connected segment and sends it a CLOSING SYN, tracked for
	/// retransmission until it replies CLOSED or its own retransmits run out. Invoked when a
	/// packet to this session has exhausted its ordinary retransmit budget (see
	/// [`Self::dispatch_retransmits`]), mirroring the escalation half of the reference
	/// implementation's `atem_packet_retransmit`.
	pub fn escalate_to_closing(&mut self, session_id: u16, socket: &UdpSocket, now: Instant) -> std::io::Result<()> {
		let Some(index) = self.lookup_get(session_id) else { return Ok(()) };

		self.packets.flush(session_id);

		if self.is_connected(index) {
			self.connected -= 1;
			if index != self.connected {
				self.swap(index);
			}
		}

		let mut buf = vec![0u8; LEN_SYN];
		codec::write_header(&mut buf, flag::SYN, LEN_SYN as u16, 0, 0, 0, 0);
		codec::set_opcode(&mut buf, Opcode::Closing);
		let index = self.lookup_get(session_id).expect("session still present after drop");
		self.sessions[index].send(socket, &buf)?;

		let packet_session = PacketSession { session_id, remote_id: 0 };
		self.packets.enqueue(Rc::from(buf.into_boxed_slice()), vec![packet_session], true, now);

		Ok(())
	}

	pub fn acknowledge(&mut self, session_id: u16, ack_id: u16) {
		self.packets.acknowledge(session_id, ack_id);
	}

	/// `true` if `session_id` is known and its recorded peer matches `peer_addr`. Server-assigned
	/// packets that fail this check are dropped silently by the dispatcher, mirroring
	/// `atem_session_peer_validate`.
	pub fn peer_matches(&self, session_id: u16, peer_addr: SocketAddr) -> bool {
		self.lookup_get(session_id).is_some_and(|index| self.sessions[index].peer_addr == peer_addr)
	}

	/// Broadcasts `buf` (header already written, session id and remote id fields overwritten per
	/// session) to every connected session, enqueuing the result for retransmission.
	pub fn broadcast(&mut self, buf: &[u8], socket: &UdpSocket, now: Instant) -> std::io::Result<()> {
		if self.connected == 0 {
			return Ok(());
		}

		let shared: Rc<[u8]> = Rc::from(buf.to_vec().into_boxed_slice());
		let mut packet_sessions = Vec::with_capacity(self.connected);

		for session in &mut self.sessions[..self.connected] {
			session.remote_id = (session.remote_id + 1) & 0x7fff;

			let mut out = shared.to_vec();
			out[offset::REMOTEID_HIGH] = (session.remote_id >> 8) as u8;
			out[offset::REMOTEID_LOW] = session.remote_id as u8;
			session.send(socket, &out)?;

			packet_sessions.push(PacketSession { session_id: session.session_id, remote_id: session.remote_id });
		}

		self.packets.enqueue(shared, packet_sessions, false, now);
		Ok(())
	}

	/// Retransmits or escalates every packet whose retransmit delay has elapsed.
	pub fn dispatch_retransmits(&mut self, socket: &UdpSocket, now: Instant, delay: std::time::Duration) -> std::io::Result<()> {
		let mut to_terminate = Vec::new();
		let mut to_close = Vec::new();
		let mut io_err = None;

		let SessionTable { sessions, lookup, packets, .. } = self;

		packets.dispatch_due(
			now,
			delay,
			|packet: &Packet| {
				for ps in &packet.sessions {
					let slot = lookup[ps.session_id as usize];
					if slot == 0 {
						continue;
					}
					let session = &sessions[(slot - 1) as usize];
					if let Err(e) = session.send_retransmit(socket, &packet.buf, ps.remote_id) {
						io_err = Some(e);
					}
				}
			},
			|packet: &Packet| {
				for ps in &packet.sessions {
					if packet.is_closing() {
						to_terminate.push(ps.session_id);
					} else {
						to_close.push(ps.session_id);
					}
				}
			},
		);

		for session_id in to_terminate {
			if let Some(index) = self.lookup_get(session_id) {
				self.terminate(index);
			}
		}

		for session_id in to_close {
			self.escalate_to_closing(session_id, socket, now)?;
		}

		match io_err {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	fn socket_pair() -> (UdpSocket, UdpSocket) {
		let server = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
		let client = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
		client.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
		(server, client)
	}

	#[test]
	fn create_assigns_session_and_sends_accept() {
		let (server, client) = socket_pair();
		let client_addr = client.local_addr().unwrap();
		let mut table = SessionTable::new(5);

		table.create(0x1234, client_addr, &server, Instant::now()).unwrap();
		assert_eq!(table.len(), 1);
		assert_eq!(table.connected_count(), 0);

		let mut reply = [0u8; LEN_SYN];
		let (len, from) = client.recv_from(&mut reply).unwrap();
		assert_eq!(from, server.local_addr().unwrap());
		assert_eq!(len, LEN_SYN);
		assert_eq!(codec::opcode(&reply), Some(Opcode::Accept));
	}

	#[test]
	fn duplicate_open_retransmits_cached_accept() {
		let (server, client) = socket_pair();
		let client_addr = client.local_addr().unwrap();
		let mut table = SessionTable::new(5);

		table.create(0x1234, client_addr, &server, Instant::now()).unwrap();
		let mut first = [0u8; LEN_SYN];
		client.recv_from(&mut first).unwrap();
		assert_eq!(first[offset::FLAGS] & flag::RETX, 0, "the first ACCEPT must not carry RETX");

		table.create(0x1234, client_addr, &server, Instant::now()).unwrap();
		let mut second = [0u8; LEN_SYN];
		client.recv_from(&mut second).unwrap();
		assert_eq!(second[offset::FLAGS] & flag::RETX, flag::RETX, "the retransmitted ACCEPT must carry RETX");

		assert_eq!(codec::opcode(&first), codec::opcode(&second));
		assert_eq!(first[offset::NEWSESSIONID_HIGH..], second[offset::NEWSESSIONID_HIGH..]);
		assert_eq!(table.len(), 1);
	}

	#[test]
	fn full_table_rejects_new_sessions() {
		let (server, client) = socket_pair();
		let client_addr = client.local_addr().unwrap();
		let mut table = SessionTable::new(1);

		table.create(0x1111, client_addr, &server, Instant::now()).unwrap();
		let mut accept = [0u8; LEN_SYN];
		client.recv_from(&mut accept).unwrap();

		table.create(0x2222, client_addr, &server, Instant::now()).unwrap();
		let mut reject = [0u8; LEN_SYN];
		client.recv_from(&mut reject).unwrap();

		assert_eq!(codec::opcode(&reject), Some(Opcode::Reject));
		assert_eq!(table.len(), 1);
	}

	#[test]
	fn connect_moves_session_into_connected_segment() {
		let (server, client) = socket_pair();
		let client_addr = client.local_addr().unwrap();
		let mut table = SessionTable::new(5);

		table.create(0x1234, client_addr, &server, Instant::now()).unwrap();
		let mut accept = [0u8; LEN_SYN];
		client.recv_from(&mut accept).unwrap();
		let new_id = codec::new_session_id(&accept);

		table.connect(0x1234, client_addr);
		assert_eq!(table.connected_count(), 1);
		assert!(table.packets.is_empty());
		assert!(table.peer_matches(new_id | 0x8000, client_addr));
	}

	#[test]
	fn peer_mismatch_is_rejected() {
		let (server, client) = socket_pair();
		let client_addr = client.local_addr().unwrap();
		let other_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
		let mut table = SessionTable::new(5);

		table.create(0x1234, client_addr, &server, Instant::now()).unwrap();
		let mut accept = [0u8; LEN_SYN];
		client.recv_from(&mut accept).unwrap();

		table.connect(0x1234, other_addr);
		assert_eq!(table.connected_count(), 0);
	}

	#[test]
	fn closing_tears_down_without_retransmit_tracking() {
		let (server, client) = socket_pair();
		let client_addr = client.local_addr().unwrap();
		let mut table = SessionTable::new(5);

		table.create(0x1234, client_addr, &server, Instant::now()).unwrap();
		let mut accept = [0u8; LEN_SYN];
		client.recv_from(&mut accept).unwrap();
		let new_id = codec::new_session_id(&accept) | 0x8000;
		table.connect(0x1234, client_addr);

		table.closing(new_id, &server).unwrap();
		let mut closed = [0u8; LEN_SYN];
		client.recv_from(&mut closed).unwrap();

		assert_eq!(codec::opcode(&closed), Some(Opcode::Closed));
		assert_eq!(table.len(), 0);
		assert!(table.packets.is_empty());
	}

	#[test]
	fn escalate_to_closing_evicts_and_tracks_for_retransmit() {
		let (server, client) = socket_pair();
		let client_addr = client.local_addr().unwrap();
		let mut table = SessionTable::new(5);

		table.create(0x1234, client_addr, &server, Instant::now()).unwrap();
		let mut accept = [0u8; LEN_SYN];
		client.recv_from(&mut accept).unwrap();
		let new_id = codec::new_session_id(&accept) | 0x8000;
		table.connect(0x1234, client_addr);

		table.escalate_to_closing(new_id, &server, Instant::now()).unwrap();
		let mut closing = [0u8; LEN_SYN];
		client.recv_from(&mut closing).unwrap();

		assert_eq!(codec::opcode(&closing), Some(Opcode::Closing));
		assert_eq!(table.connected_count(), 0);
		assert!(!table.packets.is_empty());

		table.closed(new_id);
		assert!(table.packets.is_empty());
		assert_eq!(table.len(), 0);
	}

	#[test]
	fn broadcast_reaches_only_connected_sessions() {
		let (server, client) = socket_pair();
		let client_addr = client.local_addr().unwrap();
		let mut table = SessionTable::new(5);

		table.create(0x1234, client_addr, &server, Instant::now()).unwrap();
		let mut accept = [0u8; LEN_SYN];
		client.recv_from(&mut accept).unwrap();
		table.connect(0x1234, client_addr);

		let mut ping = vec![0u8; atem_core::protocol::LEN_ACK];
		codec::write_header(&mut ping, flag::ACKREQ, atem_core::protocol::LEN_ACK as u16, 0, 0, 0, 0);
		table.broadcast(&ping, &server, Instant::now()).unwrap();

		let mut received = [0u8; 32];
		let len = client.recv(&mut received).unwrap();
		let header = codec::decode_header(&received[..len]);
		assert_eq!(header.remote_id, 1);
	}
}
