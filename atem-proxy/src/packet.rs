//! The in-flight packet queue: every datagram sent to one or more sessions that might need a
//! retransmit sits here until every session it was sent to has acknowledged it.
//!
//! Grounded on the reference implementation's `atem_packet.c`, which keeps packets in an
//! intrusive doubly-linked list ordered by send time, with a packet holding a flexible array of
//! `(session, remote_id)` pairs and a permutation-based swap-to-shrink disassociation scheme. This
//! port keeps the same two ideas — a single time-ordered queue, and each packet fanning out to N
//! sessions — but represents them as a `VecDeque` of reference-counted packets and a plain `Vec`
//! of associated sessions, since Rust's ownership model makes the intrusive-list trick both
//! unnecessary and unsafe to reproduce.

use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use atem_core::protocol::{LIMIT_REMOTEID, RESENDS, RESENDS_CLOSING, RING_HALF};

/// One session this packet is still waiting on an acknowledgement from.
#[derive(Debug, Clone, Copy)]
pub struct PacketSession {
	pub session_id: u16,
	pub remote_id: u16,
}

/// A datagram in flight to one or more sessions, pending acknowledgement or retransmit.
pub struct Packet {
	pub buf: Rc<[u8]>,
	pub sessions: Vec<PacketSession>,
	pub closing: bool,
	resends_remaining: u8,
	sent_at: Instant,
}

impl Packet {
	pub fn is_closing(&self) -> bool {
		self.closing
	}

	/// `true` if no session is still waiting on this packet.
	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}

	fn remove_session(&mut self, session_id: u16) {
		self.sessions.retain(|s| s.session_id != session_id);
	}
}

/// `true` if `candidate` is at or behind `reference` on the 15-bit wrapping ring, i.e. `candidate`
/// has already been acknowledged by a packet carrying `reference`.
fn id_is_behind_or_equal(reference: u16, candidate: u16) -> bool {
	let delta = reference.wrapping_sub(candidate) & LIMIT_REMOTEID;
	delta < RING_HALF
}

/// The server's single time-ordered retransmit queue.
#[derive(Default)]
pub struct PacketQueue {
	queue: VecDeque<Rc<std::cell::RefCell<Packet>>>,
}

impl PacketQueue {
	pub fn new() -> Self {
		Self::default()
	}

	/// Enqueues a freshly sent packet with the given per-session remote ids.
	pub fn enqueue(&mut self, buf: Rc<[u8]>, sessions: Vec<PacketSession>, closing: bool, now: Instant) -> Rc<std::cell::RefCell<Packet>> {
		let resends_remaining = if closing { RESENDS_CLOSING } else { RESENDS };
		let packet = Rc::new(std::cell::RefCell::new(Packet { buf, sessions, closing, resends_remaining, sent_at: now }));
		self.queue.push_back(packet.clone());
		packet
	}

	/// The earliest timeout among all queued packets, if any are queued.
	pub fn next_timeout(&self, now: Instant, delay: Duration) -> Option<Duration> {
		let head = self.queue.front()?;
		let deadline = head.borrow().sent_at + delay;
		Some(deadline.saturating_duration_since(now))
	}

	/// Drains every packet whose retransmit delay has elapsed, invoking `on_retransmit` with the
	/// packet's buffer and its still-pending sessions, or `on_exhausted` once its resends run out.
	///
	/// Returns sessions whose packets ran out of retransmits entirely (the caller is responsible
	/// for dropping/closing them).
	pub fn dispatch_due(&mut self, now: Instant, delay: Duration, mut on_retransmit: impl FnMut(&Packet), mut on_exhausted: impl FnMut(&Packet)) {
		while let Some(packet_rc) = self.queue.front().cloned() {
			let due = {
				let packet = packet_rc.borrow();
				now.duration_since(packet.sent_at) >= delay
			};

			if !due {
				break;
			}

			let exhausted = {
				let mut packet = packet_rc.borrow_mut();
				if packet.resends_remaining == 0 {
					true
				} else {
					packet.resends_remaining -= 1;
					packet.sent_at = now;
					false
				}
			};

			self.queue.pop_front();

			if exhausted {
				on_exhausted(&packet_rc.borrow());
			} else {
				on_retransmit(&packet_rc.borrow());
				self.queue.push_back(packet_rc);
			}
		}
	}

	/// Disassociates `session_id` from every packet it has acknowledged up to `ack_id`, in send
	/// order, stopping at the first packet that hasn't been acknowledged yet.
	pub fn acknowledge(&mut self, session_id: u16, ack_id: u16) {
		for packet_rc in self.queue.iter() {
			let mut packet = packet_rc.borrow_mut();
			let Some(session) = packet.sessions.iter().find(|s| s.session_id == session_id) else { continue };

			if !id_is_behind_or_equal(ack_id, session.remote_id) {
				break;
			}

			packet.remove_session(session_id);
		}

		self.queue.retain(|p| !p.borrow().is_empty());
	}

	/// Removes `session_id` from every packet in the queue, regardless of acknowledgement state.
	pub fn flush(&mut self, session_id: u16) {
		for packet_rc in self.queue.iter() {
			packet_rc.borrow_mut().remove_session(session_id);
		}
		self.queue.retain(|p| !p.borrow().is_empty());
	}

	pub fn is_empty(&self) -> bool {
		self.queue.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn buf() -> Rc<[u8]> {
		Rc::from(vec![0u8; 12].into_boxed_slice())
	}

	#[test]
	fn acknowledge_drains_in_send_order() {
		let mut queue = PacketQueue::new();
		let now = Instant::now();

		queue.enqueue(buf(), vec![PacketSession { session_id: 0x8001, remote_id: 1 }], false, now);
		queue.enqueue(buf(), vec![PacketSession { session_id: 0x8001, remote_id: 2 }], false, now);
		queue.enqueue(buf(), vec![PacketSession { session_id: 0x8001, remote_id: 3 }], false, now);

		queue.acknowledge(0x8001, 2);
		assert_eq!(queue.queue.len(), 1);

		queue.acknowledge(0x8001, 3);
		assert!(queue.is_empty());
	}

	#[test]
	fn flush_removes_regardless_of_ack_state() {
		let mut queue = PacketQueue::new();
		let now = Instant::now();
		queue.enqueue(buf(), vec![PacketSession { session_id: 0x8001, remote_id: 1 }], false, now);

		queue.flush(0x8001);
		assert!(queue.is_empty());
	}

	#[test]
	fn dispatch_due_retransmits_until_resends_exhausted() {
		let mut queue = PacketQueue::new();
		let now = Instant::now();
		queue.enqueue(buf(), vec![PacketSession { session_id: 0x8001, remote_id: 1 }], false, now);

		let delay = Duration::from_millis(10);
		let mut retransmits = 0;
		let mut exhausted = 0;

		for step in 1..=(RESENDS as u64 + 2) {
			let later = now + delay * step as u32;
			queue.dispatch_due(later, delay, |_| retransmits += 1, |_| exhausted += 1);
		}

		assert_eq!(retransmits, RESENDS as usize);
		assert_eq!(exhausted, 1);
		assert!(queue.is_empty());
	}

	#[test]
	fn id_behind_or_equal_handles_wraparound() {
		assert!(id_is_behind_or_equal(5, 5));
		assert!(id_is_behind_or_equal(5, 3));
		assert!(!id_is_behind_or_equal(5, 6));
		assert!(id_is_behind_or_equal(1, LIMIT_REMOTEID));
	}
}
