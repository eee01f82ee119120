use std::time::{Instant, SystemTime};

/// A monotonic clock, anchored to wall-clock time at the moment it was created.
///
/// The scheduler only ever compares `Instant`s against each other (durations,
/// never calendar time), but the wall-clock anchor lets callers stamp values
/// that leave the process, such as log timestamps derived from `unix()`.
#[derive(Clone)]
pub struct Clock {
	start: Instant,
	start_sys: SystemTime,
}

impl Clock {
	pub fn new() -> Self {
		Self { start: Instant::now(), start_sys: SystemTime::now() }
	}

	/// The current monotonic instant.
	pub fn now(&self) -> Instant {
		Instant::now()
	}

	/// The current wall-clock time, derived from the monotonic clock so it never
	/// goes backwards even if the system clock is adjusted mid-run.
	pub fn system(&self) -> SystemTime {
		self.start_sys + self.start.elapsed()
	}

	/// The current UNIX time in seconds.
	pub fn unix(&self) -> u32 {
		self.system()
			.duration_since(SystemTime::UNIX_EPOCH)
			.expect("the current time should be after the UNIX epoch")
			.as_secs()
			.try_into()
			.expect("32-bit UNIX time should not overflow")
	}
}

impl Default for Clock {
	fn default() -> Self {
		Self::new()
	}
}
