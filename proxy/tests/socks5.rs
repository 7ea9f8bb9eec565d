//! End-to-end tests driving the proxy over real loopback sockets: a thread
//! runs the reactor, another acts as the upstream "remote" peer, and the
//! test body plays the client.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use socks5_proxy::{bootstrap, reactor::Reactor};

struct RunningProxy {
	addr: std::net::SocketAddr,
	shutdown: std::sync::Arc<std::sync::atomic::AtomicBool>,
	handle: Option<thread::JoinHandle<()>>,
}

impl RunningProxy {
	fn start() -> Self {
		let bound = bootstrap::bind(0).expect("bind");
		let addr = bound.listener.local_addr().unwrap();

		let shutdown = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
		let shutdown_for_thread = shutdown.clone();

		let handle = thread::spawn(move || {
			let mut reactor = Reactor::new(bound.listener, bound.udp, bound.resolver_addr).expect("reactor");
			reactor.run(&shutdown_for_thread).expect("reactor loop");
		});

		// Give the reactor thread a moment to enter its poll() loop.
		thread::sleep(Duration::from_millis(50));

		Self { addr, shutdown, handle: Some(handle) }
	}
}

impl Drop for RunningProxy {
	fn drop(&mut self) {
		self.shutdown.store(true, Ordering::Relaxed);
		if let Some(handle) = self.handle.take() {
			let _ = handle.join();
		}
	}
}

fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
	let mut buf = vec![0u8; n];
	stream.read_exact(&mut buf).expect("read_exact");
	buf
}

#[test]
fn connect_over_ipv4_relays_both_directions() {
	let echo = TcpListener::bind("127.0.0.1:0").expect("echo listener");
	let echo_addr = echo.local_addr().unwrap();

	let echo_thread = thread::spawn(move || {
		if let Ok((mut conn, _)) = echo.accept() {
			let mut buf = [0u8; 1024];
			loop {
				match conn.read(&mut buf) {
					Ok(0) | Err(_) => break,
					Ok(n) => {
						if conn.write_all(&buf[..n]).is_err() {
							break;
						}
					}
				}
			}
		}
	});

	let proxy = RunningProxy::start();
	let mut client = TcpStream::connect(proxy.addr).expect("connect to proxy");

	// GREETING: VER=5, NMETHODS=1, METHODS=[NO_AUTH]
	client.write_all(&[0x05, 0x01, 0x00]).unwrap();
	assert_eq!(read_exact(&mut client, 2), vec![0x05, 0x00]);

	// REQUEST: CONNECT to the echo server by IPv4 address.
	let ip_octets = match echo_addr.ip() {
		std::net::IpAddr::V4(v4) => v4.octets(),
		_ => panic!("expected an IPv4 echo address"),
	};

	let mut request = vec![0x05, 0x01, 0x00, 0x01];
	request.extend_from_slice(&ip_octets);
	request.extend_from_slice(&echo_addr.port().to_be_bytes());
	client.write_all(&request).unwrap();

	let reply = read_exact(&mut client, 10);
	assert_eq!(reply[0], 0x05);
	assert_eq!(reply[1], 0x00, "expected success REP code");
	assert_eq!(reply[3], 0x01, "expected ATYP IPv4 in the reply");

	client.write_all(b"hello, proxy").unwrap();
	let echoed = read_exact(&mut client, b"hello, proxy".len());
	assert_eq!(&echoed, b"hello, proxy");

	drop(client);
	let _ = echo_thread.join();
}

#[test]
fn greeting_with_no_acceptable_method_closes_the_connection() {
	let proxy = RunningProxy::start();
	let mut client = TcpStream::connect(proxy.addr).expect("connect to proxy");

	// Offer only a method (0x02, username/password) the proxy doesn't support.
	client.write_all(&[0x05, 0x01, 0x02]).unwrap();

	let reply = read_exact(&mut client, 2);
	assert_eq!(reply, vec![0x05, 0xFF]);

	let mut buf = [0u8; 1];
	assert_eq!(client.read(&mut buf).unwrap(), 0, "connection should be closed after the reply");
}

#[test]
fn request_with_unsupported_atyp_is_rejected() {
	let proxy = RunningProxy::start();
	let mut client = TcpStream::connect(proxy.addr).expect("connect to proxy");

	client.write_all(&[0x05, 0x01, 0x00]).unwrap();
	assert_eq!(read_exact(&mut client, 2), vec![0x05, 0x00]);

	// ATYP 0x04 (IPv6) is not supported by this proxy.
	client.write_all(&[0x05, 0x01, 0x00, 0x04, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0x50]).unwrap();

	let reply = read_exact(&mut client, 10);
	assert_eq!(reply[1], 0x08, "expected address-type-not-supported REP code");
}
