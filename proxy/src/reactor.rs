//! The single poll loop: accepts clients, drives the SOCKS5 handshake,
//! dispatches DNS resolution, and relays bytes once a session is connected.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::rc::Rc;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace, warn};
use runtime::error::Ext;
use runtime::{Event, Interest, Selector, Token};

use crate::buffer::Buffer;
use crate::dns;
use crate::protocol;
use crate::session::{Session, SessionId, State};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Side {
	Client,
	Remote,
}

/// The three ways a spooled write attempt can resolve.
enum Flush {
	Complete,
	Partial,
	Failed,
}

pub struct Reactor {
	selector: Selector,

	listener: TcpListener,
	listener_token: Token,

	udp: UdpSocket,
	udp_token: Token,
	resolver_addr: SocketAddr,

	tracker: dns::Tracker,

	sessions: HashMap<SessionId, Rc<RefCell<Session>>>,
	tokens: HashMap<Token, (SessionId, Side)>,

	next_session_id: usize,
	next_token: usize,
}

impl Reactor {
	pub fn new(listener: TcpListener, udp: UdpSocket, resolver_addr: SocketAddr) -> io::Result<Self> {
		let mut selector = Selector::new();

		let listener_token = Token(0);
		let udp_token = Token(1);

		selector.register(&listener, listener_token, Interest::READABLE);
		selector.register(&udp, udp_token, Interest::READABLE);

		Ok(Self {
			selector,
			listener,
			listener_token,
			udp,
			udp_token,
			resolver_addr,
			tracker: dns::Tracker::default(),
			sessions: HashMap::new(),
			tokens: HashMap::new(),
			next_session_id: 0,
			next_token: 2,
		})
	}

	pub fn run(&mut self, shutdown: &Arc<AtomicBool>) -> io::Result<()> {
		loop {
			if shutdown.load(Ordering::Relaxed) {
				info!("shutdown requested, exiting reactor loop with {} open session(s)", self.sessions.len());
				return Ok(());
			}

			self.sweep_dns_timeouts();

			let events = self.selector.poll(Some(Duration::from_secs(1)))?;

			for event in events {
				self.dispatch(event)?;
			}
		}
	}

	fn alloc_session_id(&mut self) -> SessionId {
		let id = SessionId(self.next_session_id);
		self.next_session_id += 1;
		id
	}

	fn alloc_token(&mut self) -> Token {
		let token = Token(self.next_token);
		self.next_token += 1;
		token
	}

	fn dispatch(&mut self, event: Event) -> io::Result<()> {
		if event.token == self.listener_token {
			if event.readable {
				self.handle_accept()?;
			}
			return Ok(());
		}

		if event.token == self.udp_token {
			if event.readable {
				self.handle_udp_readable();
			}
			return Ok(());
		}

		let Some(&(id, side)) = self.tokens.get(&event.token) else {
			return Ok(());
		};

		// Readable is dispatched before writable, and validity is rechecked
		// in between: the readable phase may have already closed the session.
		if event.readable && self.sessions.contains_key(&id) {
			self.handle_readable(id, side);
		}

		if event.writable && self.sessions.contains_key(&id) {
			self.handle_writable(id, side);
		}

		Ok(())
	}

	/// Accepts a single pending connection. Per-connection accept failures
	/// (a peer that reset before the accept completed, a signal interrupting
	/// the call) are logged and ignored - the listener stays healthy and the
	/// next readable event tries again. Resource exhaustion on the listener
	/// itself (`EMFILE`/`ENFILE`/out-of-memory) is propagated instead: it
	/// won't clear on its own, and retrying it forever every iteration the
	/// backlog stays non-empty would spin the reactor instead of giving the
	/// process a chance to exit and free its descriptors.
	fn handle_accept(&mut self) -> io::Result<()> {
		// One accept per readable event, matching the listener staying level
		// triggered: a fuller backlog simply re-fires poll() next iteration.
		match self.listener.accept() {
			Ok((stream, peer_addr)) => {
				if let Err(err) = stream.set_nonblocking(true) {
					warn!("failed to set accepted socket non-blocking: {err}");
					return Ok(());
				}

				let id = self.alloc_session_id();
				let token = self.alloc_token();

				self.selector.register(&stream, token, Interest::READABLE);

				let session = Session::new(id, stream, token, peer_addr);
				self.sessions.insert(id, Rc::new(RefCell::new(session)));
				self.tokens.insert(token, (id, Side::Client));

				debug!("accepted connection from {peer_addr}");
				Ok(())
			}
			Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(()),
			Err(err) if is_resource_exhaustion(&err) => {
				warn!("accept() hit resource exhaustion, giving up: {err}");
				Err(err)
			}
			Err(err) => {
				warn!("accept() failed: {err}");
				Ok(())
			}
		}
	}

	fn handle_udp_readable(&mut self) {
		let mut datagram = [0u8; 512];

		match self.udp.recv_from(&mut datagram) {
			Ok((n, _from)) => {
				let Some((id, answer)) = dns::parse_response(&datagram[..n]) else {
					trace!("dropping malformed DNS datagram");
					return;
				};

				let Some(session_id) = self.tracker.take(id) else {
					trace!("dropping DNS response for unknown or already-resolved query {id:#06x}");
					return;
				};

				let Some(session_rc) = self.sessions.get(&session_id).cloned() else {
					return;
				};

				let should_close = {
					let mut session = session_rc.borrow_mut();
					match answer {
						dns::Answer::Found(addr) => self.begin_connect(&mut session, IpAddr::V4(addr)),
						dns::Answer::Empty => self.reply_and_close(&mut session, protocol::REP_HOST_UNREACHABLE),
					}
				};

				if should_close {
					self.close_session(session_id);
				}
			}
			Err(err) if err.kind() == ErrorKind::WouldBlock => {}
			Err(err) => warn!("UDP recv_from() failed: {err}"),
		}
	}

	fn sweep_dns_timeouts(&mut self) {
		for session_id in self.tracker.sweep_timed_out() {
			let Some(session_rc) = self.sessions.get(&session_id).cloned() else {
				continue;
			};

			let should_close = {
				let mut session = session_rc.borrow_mut();
				debug!("DNS resolution for {} timed out", session.target_host);
				self.reply_and_close(&mut session, protocol::REP_HOST_UNREACHABLE)
			};

			if should_close {
				self.close_session(session_id);
			}
		}
	}

	fn handle_readable(&mut self, id: SessionId, side: Side) {
		let Some(session_rc) = self.sessions.get(&id).cloned() else {
			return;
		};

		let should_close = {
			let mut session = session_rc.borrow_mut();
			match side {
				Side::Client => self.client_readable(&mut session),
				Side::Remote => self.remote_readable(&mut session),
			}
		};

		if should_close {
			self.close_session(id);
		}
	}

	fn handle_writable(&mut self, id: SessionId, side: Side) {
		let Some(session_rc) = self.sessions.get(&id).cloned() else {
			return;
		};

		let should_close = {
			let mut session = session_rc.borrow_mut();
			match side {
				Side::Client => self.client_writable(&mut session),
				Side::Remote => self.remote_writable(&mut session),
			}
		};

		if should_close {
			self.close_session(id);
		}
	}

	fn client_readable(&mut self, session: &mut Session) -> bool {
		if session.pending_close {
			// Already decided to close once the spooled reply drains; no
			// frame parsing makes sense for whatever the client sends now.
			return false;
		}

		match session.state {
			State::Greeting | State::Request => self.feed_handshake(session),
			State::Relaying => self.relay_client_read(session),
			State::Resolving | State::Connecting => self.drain_while_pending(session),
		}
	}

	/// While a DNS resolution or remote connect is in flight, the client
	/// socket can still report readable - either because it pipelined bytes
	/// ahead of the reply, or because it aborted the connection. Actually
	/// reading here, rather than ignoring the event, is what keeps poll()
	/// from reporting the same readiness on every loop iteration: the bytes
	/// get drained, or EOF closes the session outright.
	fn drain_while_pending(&mut self, session: &mut Session) -> bool {
		let mut scratch = [0u8; 4096];

		match session.client.read(&mut scratch) {
			Ok(0) => {
				debug!("client {} aborted during {:?}", session.peer_addr, session.state);
				true
			}
			Ok(_) => false,
			Err(err) if err.kind() == ErrorKind::WouldBlock => false,
			Err(err) => {
				warn!("read error from {} while {:?}: {err}", session.peer_addr, session.state);
				true
			}
		}
	}

	fn remote_readable(&mut self, session: &mut Session) -> bool {
		match session.state {
			State::Relaying => self.relay_remote_read(session),
			_ => false,
		}
	}

	fn client_writable(&mut self, session: &mut Session) -> bool {
		match session.state {
			State::Relaying => self.relay_client_write(session),
			_ => self.drain_spool(session),
		}
	}

	fn remote_writable(&mut self, session: &mut Session) -> bool {
		match session.state {
			State::Connecting => self.finish_connect(session),
			State::Relaying => self.relay_remote_write(session),
			_ => false,
		}
	}

	fn feed_handshake(&mut self, session: &mut Session) -> bool {
		if session.msg.is_full() {
			warn!("handshake frame from {} exceeded {} bytes", session.peer_addr, session.msg.capacity());
			return true;
		}

		match session.client.read(session.msg.fill_slice()) {
			Ok(0) => {
				debug!("client {} closed during handshake", session.peer_addr);
				true
			}
			Ok(n) => {
				session.msg.advance(n);
				match session.state {
					State::Greeting => self.advance_greeting(session),
					State::Request => self.advance_request(session),
					_ => unreachable!("feed_handshake only runs in Greeting/Request"),
				}
			}
			Err(err) if err.kind() == ErrorKind::WouldBlock => false,
			Err(err) => {
				warn!("read error during handshake from {}: {err}", session.peer_addr);
				true
			}
		}
	}

	fn advance_greeting(&mut self, session: &mut Session) -> bool {
		match protocol::parse_greeting(&mut session.msg) {
			None => false,
			Some(protocol::Greeting::NoAuthRequired) => {
				session.state = State::Request;
				let outcome = self.send_reply(session, &protocol::GREETING_NO_AUTH);
				self.apply_reply_outcome(session, outcome, false)
			}
			Some(protocol::Greeting::Unacceptable) => {
				let outcome = self.send_reply(session, &protocol::GREETING_NO_ACCEPTABLE);
				self.apply_reply_outcome(session, outcome, true)
			}
			Some(protocol::Greeting::BadVersion) => {
				warn!("{} sent an unsupported SOCKS version in the greeting", session.peer_addr);
				true
			}
		}
	}

	fn advance_request(&mut self, session: &mut Session) -> bool {
		match protocol::parse_request(&mut session.msg) {
			None => false,
			Some(protocol::Request::UnsupportedCommand) => self.reply_and_close(session, protocol::REP_COMMAND_NOT_SUPPORTED),
			Some(protocol::Request::UnsupportedAtyp) => self.reply_and_close(session, protocol::REP_ADDRESS_TYPE_NOT_SUPPORTED),
			Some(protocol::Request::Ipv4 { addr, port }) => {
				session.target_host = addr.to_string();
				session.target_port = port;
				self.begin_connect(session, IpAddr::V4(addr))
			}
			Some(protocol::Request::Domain { host, port }) => {
				session.target_port = port;
				session.target_host = host.clone();
				self.begin_resolution(session, host)
			}
		}
	}

	fn begin_resolution(&mut self, session: &mut Session, host: String) -> bool {
		let Some(id) = self.tracker.submit(session.id) else {
			return self.reply_and_close(session, protocol::REP_HOST_UNREACHABLE);
		};

		let fqdn = if host.ends_with('.') { host } else { format!("{host}.") };

		let Some(query) = dns::build_query(id, &fqdn) else {
			warn!("rejecting oversized domain label in {} for {}", session.target_host, session.peer_addr);
			self.tracker.take(id);
			return self.reply_and_close(session, protocol::REP_HOST_UNREACHABLE);
		};

		match self.udp.send_to(&query, self.resolver_addr) {
			Ok(_) => {
				session.state = State::Resolving;
				false
			}
			Err(err) => {
				warn!("failed to send DNS query for {}: {err}", session.target_host);
				self.tracker.take(id);
				self.reply_and_close(session, protocol::REP_HOST_UNREACHABLE)
			}
		}
	}

	fn begin_connect(&mut self, session: &mut Session, addr: IpAddr) -> bool {
		let target = SocketAddr::new(addr, session.target_port);
		let host = session.target_host.clone();

		let remote = connect_nonblocking(target).ok_or(|err| warn!("connect() to {target} ({host}) failed: {err}"));

		match remote {
			Some(remote) => {
				let token = self.alloc_token();
				self.selector.register(&remote, token, Interest::WRITABLE);
				self.tokens.insert(token, (session.id, Side::Remote));
				session.remote = Some(remote);
				session.remote_token = Some(token);
				session.state = State::Connecting;
				false
			}
			None => self.reply_and_close(session, protocol::REP_HOST_UNREACHABLE),
		}
	}

	fn finish_connect(&mut self, session: &mut Session) -> bool {
		let connect_err = {
			let remote = session.remote.as_ref().expect("Connecting implies a remote socket");
			remote.take_error()
		};

		match connect_err {
			Ok(None) => {}
			Ok(Some(err)) => {
				warn!("connect() to {} failed asynchronously: {err}", session.target_host);
				return self.reply_and_close(session, protocol::REP_HOST_UNREACHABLE);
			}
			Err(err) => {
				warn!("take_error() failed for {}: {err}", session.target_host);
				return self.reply_and_close(session, protocol::REP_HOST_UNREACHABLE);
			}
		}

		let bound = match session.remote.as_ref().unwrap().local_addr() {
			Ok(SocketAddr::V4(addr)) => Some((*addr.ip(), addr.port())),
			Ok(SocketAddr::V6(_)) => None,
			Err(err) => {
				warn!("local_addr() failed for {}: {err}", session.target_host);
				None
			}
		};

		let reply = protocol::encode_reply(protocol::REP_SUCCESS, bound);
		let outcome = self.send_reply(session, &reply);

		session.state = State::Relaying;
		info!("{} connected to {}:{}", session.peer_addr, session.target_host, session.target_port);

		let remote_token = session.remote_token.expect("Connecting implies a remote socket");
		self.selector.reregister(remote_token, Interest::READABLE);

		match outcome {
			Flush::Complete => {
				self.selector.reregister(session.client_token, Interest::READABLE);
				false
			}
			Flush::Partial => {
				self.selector.reregister(session.client_token, Interest::READABLE.add(Interest::WRITABLE));
				false
			}
			Flush::Failed => true,
		}
	}

	/// Encodes and sends an error reply, closing the session either right
	/// away (reply sent or failed outright) or once the spooled reply drains.
	fn reply_and_close(&mut self, session: &mut Session, rep: u8) -> bool {
		let reply = protocol::encode_reply(rep, None);
		let outcome = self.send_reply(session, &reply);
		self.apply_reply_outcome(session, outcome, true)
	}

	fn apply_reply_outcome(&mut self, session: &mut Session, outcome: Flush, close_when_drained: bool) -> bool {
		match outcome {
			Flush::Complete => close_when_drained,
			Flush::Partial => {
				session.pending_close = close_when_drained;
				self.selector.reregister(session.client_token, Interest::READABLE.add(Interest::WRITABLE));
				false
			}
			Flush::Failed => true,
		}
	}

	/// Writes `bytes` to the client directly. Anything left unwritten is
	/// queued into `r2c` (empty at this point, pre-RELAYING) so the relay
	/// write path drains it transparently once RELAYING begins - the same
	/// buffer the relay itself uses for remote -> client bytes.
	fn send_reply(&mut self, session: &mut Session, bytes: &[u8]) -> Flush {
		match session.client.write(bytes) {
			Ok(n) if n == bytes.len() => Flush::Complete,
			Ok(n) => {
				queue(&mut session.r2c, &bytes[n..]);
				Flush::Partial
			}
			Err(err) if err.kind() == ErrorKind::WouldBlock => {
				queue(&mut session.r2c, bytes);
				Flush::Partial
			}
			Err(err) => {
				warn!("reply write to {} failed: {err}", session.peer_addr);
				Flush::Failed
			}
		}
	}

	fn drain_spool(&mut self, session: &mut Session) -> bool {
		match flush_once(&mut session.client, &mut session.r2c) {
			Flush::Complete => {
				let interest = self.selector.current_interest(session.client_token).remove(Interest::WRITABLE);
				self.selector.reregister(session.client_token, interest);
				session.pending_close
			}
			Flush::Partial => false,
			Flush::Failed => true,
		}
	}

	fn relay_client_read(&mut self, session: &mut Session) -> bool {
		if session.c2r.is_full() {
			return false;
		}

		match session.client.read(session.c2r.fill_slice()) {
			Ok(0) => {
				session.client_half_closed = true;

				if let Some(remote) = session.remote.as_ref() {
					shutdown_write(remote);
				}

				// Deliberately clears OP_READ on the remote key (the
				// "opposite" key, not this one): see the design notes on
				// half-close handling.
				if let Some(remote_token) = session.remote_token {
					let interest = self.selector.current_interest(remote_token).remove(Interest::READABLE);
					self.selector.reregister(remote_token, interest);
				}

				session.fully_drained_and_closed()
			}
			Ok(n) => {
				session.c2r.advance(n);

				if let Some(remote_token) = session.remote_token {
					let interest = self.selector.current_interest(remote_token).add(Interest::WRITABLE);
					self.selector.reregister(remote_token, interest);
				}

				if session.c2r.is_full() {
					let interest = self.selector.current_interest(session.client_token).remove(Interest::READABLE);
					self.selector.reregister(session.client_token, interest);
				}

				false
			}
			Err(err) if err.kind() == ErrorKind::WouldBlock => false,
			Err(err) => {
				warn!("relay read (client->remote) failed for {}: {err}", session.peer_addr);
				true
			}
		}
	}

	fn relay_remote_read(&mut self, session: &mut Session) -> bool {
		if session.r2c.is_full() {
			return false;
		}

		let read_result = {
			let remote = session.remote.as_mut().expect("Relaying implies a remote socket");
			remote.read(session.r2c.fill_slice())
		};

		match read_result {
			Ok(0) => {
				session.remote_half_closed = true;
				shutdown_write(&session.client);

				let interest = self.selector.current_interest(session.client_token).remove(Interest::READABLE);
				self.selector.reregister(session.client_token, interest);

				session.fully_drained_and_closed()
			}
			Ok(n) => {
				session.r2c.advance(n);

				let interest = self.selector.current_interest(session.client_token).add(Interest::WRITABLE);
				self.selector.reregister(session.client_token, interest);

				if session.r2c.is_full() {
					if let Some(remote_token) = session.remote_token {
						let interest = self.selector.current_interest(remote_token).remove(Interest::READABLE);
						self.selector.reregister(remote_token, interest);
					}
				}

				false
			}
			Err(err) if err.kind() == ErrorKind::WouldBlock => false,
			Err(err) => {
				warn!("relay read (remote->client) failed for {}: {err}", session.peer_addr);
				true
			}
		}
	}

	fn relay_client_write(&mut self, session: &mut Session) -> bool {
		match flush_once(&mut session.client, &mut session.r2c) {
			Flush::Complete => {
				let interest = self.selector.current_interest(session.client_token).remove(Interest::WRITABLE);
				self.selector.reregister(session.client_token, interest);
			}
			Flush::Partial => {}
			Flush::Failed => return true,
		}

		if let Some(remote_token) = session.remote_token {
			let interest = self.selector.current_interest(remote_token).add(Interest::READABLE);
			self.selector.reregister(remote_token, interest);
		}

		session.fully_drained_and_closed()
	}

	fn relay_remote_write(&mut self, session: &mut Session) -> bool {
		let remote_token = session.remote_token.expect("Relaying implies a remote socket");

		let outcome = {
			let remote = session.remote.as_mut().expect("Relaying implies a remote socket");
			flush_once(remote, &mut session.c2r)
		};

		match outcome {
			Flush::Complete => {
				let interest = self.selector.current_interest(remote_token).remove(Interest::WRITABLE);
				self.selector.reregister(remote_token, interest);
			}
			Flush::Partial => {}
			Flush::Failed => return true,
		}

		let interest = self.selector.current_interest(session.client_token).add(Interest::READABLE);
		self.selector.reregister(session.client_token, interest);

		session.fully_drained_and_closed()
	}

	fn close_session(&mut self, id: SessionId) {
		let Some(session_rc) = self.sessions.remove(&id) else {
			return;
		};

		let session = session_rc.borrow();

		self.selector.deregister(session.client_token);
		self.tokens.remove(&session.client_token);

		if let Some(remote_token) = session.remote_token {
			self.selector.deregister(remote_token);
			self.tokens.remove(&remote_token);
		}

		debug!("closed session with {}", session.peer_addr);
		drop(session);

		self.tracker.cancel(id);
	}
}

/// Whether `err` represents the listener running out of a process- or
/// system-wide resource, as opposed to a transient failure tied to one
/// connection attempt.
fn is_resource_exhaustion(err: &io::Error) -> bool {
	matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM))
}

fn queue(buf: &mut Buffer, tail: &[u8]) {
	buf.fill_slice()[..tail.len()].copy_from_slice(tail);
	buf.advance(tail.len());
}

fn shutdown_write(stream: &TcpStream) {
	if let Err(err) = stream.shutdown(Shutdown::Write) {
		if err.kind() != ErrorKind::NotConnected {
			warn!("shutdown(Write) failed: {err}");
		}
	}
}

/// Flips `buf` for draining, attempts a single write, and compacts back to
/// fill mode - one socket operation per call, matching the rest of the
/// relay's "one syscall per readiness event" style.
fn flush_once(stream: &mut TcpStream, buf: &mut Buffer) -> Flush {
	buf.flip();

	let outcome = if !buf.has_remaining() {
		Flush::Complete
	} else {
		match stream.write(buf.as_slice()) {
			Ok(0) => Flush::Failed,
			Ok(n) => {
				buf.consume(n);
				if buf.has_remaining() { Flush::Partial } else { Flush::Complete }
			}
			Err(err) if err.kind() == ErrorKind::WouldBlock => Flush::Partial,
			Err(err) => {
				warn!("relay write failed: {err}");
				Flush::Failed
			}
		}
	};

	buf.compact();
	outcome
}

/// Opens a TCP socket, sets it non-blocking, and starts connecting to
/// `target` without waiting for completion - `EINPROGRESS`/`WouldBlock` is
/// the expected, successful outcome. Completion is discovered later via a
/// writable event plus `TcpStream::take_error`.
fn connect_nonblocking(target: SocketAddr) -> io::Result<TcpStream> {
	use socket2::{Domain, Protocol, Socket, Type};

	let domain = if target.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
	let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
	socket.set_nonblocking(true)?;

	match socket.connect(&target.into()) {
		Ok(()) => {}
		Err(err) if err.kind() == ErrorKind::WouldBlock => {}
		Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
		Err(err) => return Err(err),
	}

	Ok(socket.into())
}
