use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use utils::error::Result;

/// Installs a Ctrl+C handler that flips the returned flag instead of terminating the process.
///
/// The caller's event loop should check the flag at each iteration (e.g. once per
/// `time_to_next_event` wakeup) and shut down gracefully rather than relying on the
/// default signal disposition, so in-flight sessions can be closed cleanly.
pub fn exit_flag() -> Result<Arc<AtomicBool>> {
	let flag = Arc::new(AtomicBool::new(false));

	let handler_flag = flag.clone();
	ctrlc::set_handler(move || handler_flag.store(true, Ordering::Relaxed)).map_err(|err| log::error!("Error occurred while setting Ctrl+C handler: {err}"))?;

	Ok(flag)
}
