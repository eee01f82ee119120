//! Typed accessors for the three command records the firmware acts on.
//!
//! Every other command name is surfaced by [`crate::codec::iterate_commands`] as an opaque
//! `(name, body)` pair and otherwise ignored — this module exists only to save callers from
//! re-deriving the same three big-endian field layouts by hand.

use crate::protocol::tally;

/// The `_ver` command body: `{major: u16, minor: u16}`, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
	pub major: u16,
	pub minor: u16,
}

/// Parses a `_ver` command body. Returns `None` if the body is shorter than 4 bytes.
pub fn protocol_version(body: &[u8]) -> Option<ProtocolVersion> {
	if body.len() < 4 {
		return None;
	}

	Some(ProtocolVersion {
		major: u16::from_be_bytes([body[0], body[1]]),
		minor: u16::from_be_bytes([body[2], body[3]]),
	})
}

/// Tally state for one camera, decoded from a `TlIn` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tally {
	pub pgm: bool,
	pub pvw: bool,
}

impl Tally {
	fn from_byte(b: u8) -> Self {
		Self { pgm: b & tally::PGM != 0, pvw: b & tally::PVW != 0 }
	}
}

/// Parses a `TlIn` command body: `{count: u16 big-endian, states: [count]u8}`.
///
/// Returns the tally states in 1-based camera order (`tally_states(body)[0]` is camera 1).
/// Returns an empty vec if the body is truncated relative to its declared count.
pub fn tally_states(body: &[u8]) -> Vec<Tally> {
	if body.len() < 2 {
		return Vec::new();
	}

	let count = u16::from_be_bytes([body[0], body[1]]) as usize;
	let states = &body[2..];

	if states.len() < count {
		return Vec::new();
	}

	states[..count].iter().copied().map(Tally::from_byte).collect()
}

/// Looks up the tally state for a specific 1-based camera index within a `TlIn` body.
pub fn tally_state_for(body: &[u8], camera: u8) -> Option<Tally> {
	tally_states(body).into_iter().nth(camera.checked_sub(1)? as usize)
}

/// Translates a `CCdP` camera-control record's body into the Blackmagic SDI Camera Control
/// Protocol framing.
///
/// Layout of `body` (all ATEM fields are big-endian):
/// `{dest: u8, cat: u8, param: u8, type: u8, op: u8, _: u8, count8: u8, _: u8, count16: u8, _:
/// u8, count32: u8, _: [5]u8, data: [count8 + 2*count16 + 4*count32]u8}`, with `data` starting
/// at byte offset 16.
///
/// Returns `None` if `body` is too short to hold its declared element counts.
pub fn translate_camera_control(body: &[u8]) -> Option<Vec<u8>> {
	const DATA_OFFSET: usize = 16;
	const SDI_HEADER_LEN: usize = 4;
	const CMD_HEADER_LEN: usize = 4;

	if body.len() < DATA_OFFSET {
		return None;
	}

	let dest = body[0];
	let cmd_header = &body[1..5];

	let count8 = body[6] as usize;
	let count16 = body[8] as usize;
	let count32 = body[10] as usize;

	let width = (count8 > 0) as usize + 2 * (count16 > 0) as usize + 4 * (count32 > 0) as usize;
	let len = count8 + 2 * count16 + 4 * count32;

	let data = body.get(DATA_OFFSET..DATA_OFFSET + len)?;

	let padded_len = (len + 3) & !3;

	let mut out = Vec::with_capacity(SDI_HEADER_LEN + CMD_HEADER_LEN + padded_len);

	out.push(dest);
	out.push((CMD_HEADER_LEN + padded_len) as u8);
	out.push(0x00);
	out.push(0x00);

	out.extend_from_slice(cmd_header);

	if width > 0 {
		for element in data.chunks(width) {
			out.extend(element.iter().rev());
		}
	}

	out.resize(SDI_HEADER_LEN + CMD_HEADER_LEN + padded_len, 0);

	Some(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn camera_control_translation_scenario_6() {
		#[rustfmt::skip]
		let body = [
			3, // dest
			1, 2, 2, 0, // cat, param, type, op
			0, // reserved
			0, // count8
			0, // reserved
			1, // count16
			0, // reserved
			0, // count32
			0, 0, 0, 0, 0, // reserved, pad to offset 16
			0x01, 0xF4, // data: 500 big-endian
		];

		let sdi = translate_camera_control(&body).unwrap();
		assert_eq!(sdi, [3, 8, 0x00, 0x00, 0x01, 0x02, 0x02, 0x00, 0xF4, 0x01, 0x00, 0x00]);
	}

	#[test]
	fn protocol_version_parses_major_minor() {
		let body = [0x00, 0x08, 0x00, 0x04];
		assert_eq!(protocol_version(&body), Some(ProtocolVersion { major: 8, minor: 4 }));
	}

	#[test]
	fn tally_states_decodes_pgm_pvw_bits() {
		let body = [0x00, 0x02, tally::PGM, tally::PVW];
		let states = tally_states(&body);
		assert_eq!(states, [Tally { pgm: true, pvw: false }, Tally { pgm: false, pvw: true }]);
		assert_eq!(tally_state_for(&body, 1), Some(Tally { pgm: true, pvw: false }));
	}
}
