//! Bringing up the listening socket, the DNS-query UDP socket, and
//! discovering the upstream resolver before the reactor starts.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};

use log::warn;

const RESOLV_CONF: &str = "/etc/resolv.conf";
const FALLBACK_RESOLVER: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
const DNS_PORT: u16 = 53;

pub struct Bound {
	pub listener: TcpListener,
	pub udp: UdpSocket,
	pub resolver_addr: SocketAddr,
}

pub fn bind(port: u16) -> std::io::Result<Bound> {
	let listener = TcpListener::bind(("0.0.0.0", port))?;
	listener.set_nonblocking(true)?;

	let udp = UdpSocket::bind(("0.0.0.0", 0))?;
	udp.set_nonblocking(true)?;

	let resolver_addr = SocketAddr::new(discover_resolver(), DNS_PORT);

	Ok(Bound { listener, udp, resolver_addr })
}

/// Reads the first `nameserver <ip>` line out of `/etc/resolv.conf`. Falls
/// back to the loopback resolver, with a warning, rather than failing
/// bootstrap over a missing or unparsable config file.
fn discover_resolver() -> IpAddr {
	let contents = match fs::read_to_string(RESOLV_CONF) {
		Ok(contents) => contents,
		Err(err) => {
			warn!("could not read {RESOLV_CONF} ({err}), falling back to {FALLBACK_RESOLVER}");
			return FALLBACK_RESOLVER;
		}
	};

	for line in contents.lines() {
		let line = line.trim();

		let Some(rest) = line.strip_prefix("nameserver") else {
			continue;
		};

		let Some(addr) = rest.split_whitespace().next() else {
			continue;
		};

		match addr.parse() {
			Ok(ip) => return ip,
			Err(_) => continue,
		}
	}

	warn!("no usable nameserver line in {RESOLV_CONF}, falling back to {FALLBACK_RESOLVER}");
	FALLBACK_RESOLVER
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bind_picks_an_ephemeral_udp_port_and_a_requested_tcp_port() {
		let bound = bind(0).expect("bind should succeed on an ephemeral TCP port");
		assert!(bound.listener.local_addr().unwrap().port() > 0);
		assert!(bound.udp.local_addr().unwrap().port() > 0);
	}
}
