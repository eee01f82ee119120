use std::net::UdpSocket;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use atem_core::protocol::PACKET_LEN_MAX;
use clap::Parser;
use log::{info, warn, LevelFilter};

use atem_proxy::dispatch;
use atem_proxy::scheduler::Scheduler;
use atem_proxy::session::SessionTable;

/// Stands in front of a Blackmagic switcher, terminating the camera-control UDP session protocol
/// on behalf of many peers and fanning out broadcast traffic to every connected one.
#[derive(Parser)]
#[command(name = "atem-proxy", version, about)]
struct Args {
	/// Maximum number of concurrently open sessions.
	#[arg(short = 'l', long = "limit", default_value_t = 5)]
	limit: usize,

	/// Delay between retransmits of an unacknowledged packet, in milliseconds.
	#[arg(short = 'r', long = "resend-delay", default_value_t = 200)]
	resend_delay_ms: u64,

	/// Interval between keepalive pings to connected sessions, in milliseconds.
	#[arg(short = 'p', long = "ping-interval", default_value_t = 500)]
	ping_interval_ms: u64,

	/// Increase log verbosity; repeatable.
	#[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
	verbose: u8,
}

fn main() -> ExitCode {
	let args = Args::parse();

	let level = match args.verbose {
		0 => LevelFilter::Info,
		1 => LevelFilter::Debug,
		_ => LevelFilter::Trace,
	};
	runtime::logger::init(level);

	match run(args) {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			warn!("fatal error: {err}");
			ExitCode::FAILURE
		}
	}
}

fn run(args: Args) -> std::io::Result<()> {
	let socket = UdpSocket::bind(("0.0.0.0", atem_core::protocol::PORT))?;
	info!("listening on {}", socket.local_addr()?);

	let exit_flag = runtime::exit_flag().map_err(|()| std::io::Error::new(std::io::ErrorKind::Other, "failed to install Ctrl+C handler"))?;

	let mut table = SessionTable::new(args.limit);
	let mut scheduler = Scheduler::new(Duration::from_millis(args.ping_interval_ms), Duration::from_millis(args.resend_delay_ms), Instant::now());

	let mut buf = vec![0u8; PACKET_LEN_MAX];

	while !exit_flag.load(Ordering::Relaxed) {
		let now = Instant::now();
		let wait = scheduler.time_to_next_event(&mut table, &socket, now)?;
		socket.set_read_timeout(Some(wait.unwrap_or(Duration::from_secs(1)).max(Duration::from_millis(1))))?;

		match socket.recv_from(&mut buf) {
			Ok((len, peer)) => dispatch::handle_datagram(&mut table, &socket, &buf, len, peer, Instant::now())?,
			Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => continue,
			Err(e) => return Err(e),
		}
	}

	info!("shutting down, {} session(s) still open", table.len());
	Ok(())
}
