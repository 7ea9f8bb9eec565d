pub mod bootstrap;
pub mod buffer;
pub mod dns;
pub mod protocol;
pub mod reactor;
pub mod session;

use std::process::ExitCode;

use log::{error, info};

use reactor::Reactor;

pub fn run(mut args: impl Iterator<Item = String>) -> ExitCode {
	runtime::logger::init();

	let port = match parse_port(args.nth(1)) {
		Ok(port) => port,
		Err(message) => {
			error!("{message}");
			return ExitCode::FAILURE;
		}
	};

	let bound = match bootstrap::bind(port) {
		Ok(bound) => bound,
		Err(err) => {
			error!("failed to bind: {err}");
			return ExitCode::FAILURE;
		}
	};

	info!(
		"listening on {} (resolving via {})",
		bound.listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
		bound.resolver_addr
	);

	let mut reactor = match Reactor::new(bound.listener, bound.udp, bound.resolver_addr) {
		Ok(reactor) => reactor,
		Err(err) => {
			error!("failed to start reactor: {err}");
			return ExitCode::FAILURE;
		}
	};

	let shutdown = runtime::shutdown::install();

	match reactor.run(&shutdown) {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			error!("reactor loop aborted: {err}");
			ExitCode::FAILURE
		}
	}
}

fn parse_port(arg: Option<String>) -> Result<u16, String> {
	let arg = arg.ok_or_else(|| "usage: socks5-proxy <port>".to_string())?;
	arg.parse::<u16>().map_err(|_| format!("invalid port: {arg}"))
}
