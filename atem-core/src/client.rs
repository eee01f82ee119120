//! The client session driver: a blocking, single-socket wrapper around [`crate::machine::Connection`]
//! that a camera-control device (or this crate's own test/demo tooling) drives in a tight poll
//! loop, grounded on the reference implementation's `atem_init`/`atem_send`/`atem_recv`/
//! `atem_poll`/`atem_next` functions.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::codec::{self, Command};
use crate::machine::{Connection, Status};
use crate::protocol::{self, LEN_HEADER};

/// Error surfaced by [`Client::poll`].
#[derive(Debug)]
pub enum PollError {
	Io(io::Error),
	/// The peer never answered; retransmits are exhausted.
	TimedOut,
}

impl From<io::Error> for PollError {
	fn from(e: io::Error) -> Self {
		Self::Io(e)
	}
}

/// A client-side ATEM session: one UDP socket, one [`Connection`].
pub struct Client {
	socket: UdpSocket,
	conn: Connection,
	last_sent_at: Instant,
	resends_left: u8,
	recv_buf: Vec<u8>,
	payload_len: usize,
}

impl Client {
	/// Opens a session to `addr`, sending the initial OPEN immediately.
	///
	/// `session_id` is the client-assigned 15-bit session id (MSB clear); callers typically
	/// derive it from a monotonic counter or random source of their own choosing, since this
	/// crate doesn't carry a dependency purely to generate one value.
	pub fn connect(addr: SocketAddr, session_id: u16) -> io::Result<Self> {
		assert_eq!(session_id & 0x8000, 0, "client session id must have a clear MSB");

		let socket = UdpSocket::bind(("0.0.0.0", 0))?;
		socket.connect(addr)?;
		socket.set_read_timeout(Some(Duration::from_millis(protocol::RESEND_TIME_MS)))?;

		let conn = Connection::open(session_id);
		let mut client = Self {
			socket,
			conn,
			last_sent_at: Instant::now(),
			resends_left: protocol::RESENDS,
			recv_buf: vec![0u8; protocol::PACKET_LEN_MAX],
			payload_len: 0,
		};

		client.send_armed()?;
		Ok(client)
	}

	fn send_armed(&mut self) -> io::Result<()> {
		if let Some(buf) = self.conn.armed_write() {
			self.socket.send(buf)?;
			self.last_sent_at = Instant::now();
		}
		Ok(())
	}

	/// Blocks until a packet arrives or the resend timer fires, updating connection state and
	/// returning what happened. Mirrors `atem_poll`'s resend-on-timeout, give-up-after-N-resends
	/// behavior.
	pub fn poll(&mut self) -> Result<Status, PollError> {
		match self.socket.recv(&mut self.recv_buf) {
			Ok(len) if len >= LEN_HEADER => {
				self.resends_left = protocol::RESENDS;
				let payload_len = len - LEN_HEADER;
				let packet = self.recv_buf[..len].to_vec();

				let status = self.conn.parse(&packet, &packet[LEN_HEADER..]);
				self.payload_len = payload_len;

				match status {
					Status::WriteOnly | Status::Accepted | Status::Closing | Status::Data => {
						self.send_armed()?;
					}
					_ => {}
				}

				Ok(status)
			}
			Ok(_) => {
				debug!("dropped undersized datagram");
				Ok(Status::None)
			}
			Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
				if self.last_sent_at.elapsed() < Duration::from_millis(protocol::RESEND_TIME_MS) {
					return Ok(Status::None);
				}

				if self.resends_left == 0 {
					warn!("session {:#06x} timed out waiting for a reply", self.conn.session_id);
					return Err(PollError::TimedOut);
				}

				self.resends_left -= 1;
				self.send_armed()?;
				Ok(Status::None)
			}
			Err(e) => Err(e.into()),
		}
	}

	/// Iterates the command records carried by the most recently received data packet.
	pub fn next(&self) -> impl Iterator<Item = Command<'_>> {
		codec::iterate_commands(&self.recv_buf[..self.payload_len])
	}

	pub fn session_id(&self) -> u16 {
		self.conn.session_id
	}

	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.socket.local_addr()
	}
}
