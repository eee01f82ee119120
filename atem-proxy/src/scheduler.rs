//! Drives the proxy's two timers: periodic keepalive pings to every connected session, and
//! retransmission of anything still waiting on an acknowledgement.
//!
//! Grounded on the reference implementation's `timeout.c`, whose single `timeout_get()` function
//! both computes the delay until the next event *and* fires whatever is already due, so the
//! caller's blocking `poll()` always wakes up with fresh state rather than needing a second pass.
//! This module keeps that shape: [`Scheduler::time_to_next_event`] is the only entry point, and
//! calling it is itself what makes due pings and retransmits happen.

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use atem_core::codec;
use atem_core::protocol::{flag, LEN_ACK};
use log::trace;

use crate::session::SessionTable;

/// Owns the ping cadence; the retransmit cadence lives per-packet in [`crate::packet::PacketQueue`].
pub struct Scheduler {
	ping_interval: Duration,
	resend_delay: Duration,
	next_ping: Instant,
}

impl Scheduler {
	pub fn new(ping_interval: Duration, resend_delay: Duration, now: Instant) -> Self {
		Self { ping_interval, resend_delay, next_ping: now + ping_interval }
	}

	/// Fires any ping or retransmit that's already due, then returns how long until the next one
	/// (`None` means no timer is armed — the caller may block indefinitely).
	pub fn time_to_next_event(&mut self, table: &mut SessionTable, socket: &UdpSocket, now: Instant) -> std::io::Result<Option<Duration>> {
		if table.connected_count() > 0 && now >= self.next_ping {
			self.broadcast_ping(table, socket, now)?;
			self.next_ping = now + self.ping_interval;
		}

		table.dispatch_retransmits(socket, now, self.resend_delay)?;

		let ping_remaining = (table.connected_count() > 0).then(|| self.next_ping.saturating_duration_since(now));
		let retransmit_remaining = table.packets.next_timeout(now, self.resend_delay);

		let next = match (ping_remaining, retransmit_remaining) {
			(Some(a), Some(b)) => Some(a.min(b)),
			(a, None) => a,
			(None, b) => b,
		};

		trace!("next event in {next:?}");
		Ok(next)
	}

	fn broadcast_ping(&self, table: &mut SessionTable, socket: &UdpSocket, now: Instant) -> std::io::Result<()> {
		let mut buf = vec![0u8; LEN_ACK];
		codec::write_header(&mut buf, flag::ACKREQ, LEN_ACK as u16, 0, 0, 0, 0);
		table.broadcast(&buf, socket, now)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn no_sessions_means_no_ping_timer() {
		let now = Instant::now();
		let mut scheduler = Scheduler::new(Duration::from_millis(500), Duration::from_millis(200), now);
		let mut table = SessionTable::new(5);
		let socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();

		let next = scheduler.time_to_next_event(&mut table, &socket, now).unwrap();
		assert_eq!(next, None);
	}
}
