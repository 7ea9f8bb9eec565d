//! The per-connection state machine: one [`Session`] exists for every
//! accepted client, from the SOCKS greeting through relaying to close.

use std::net::{SocketAddr, TcpStream};

use runtime::Token;

use crate::buffer::Buffer;

const RELAY_BUFFER_CAPACITY: usize = 64 * 1024;
const HANDSHAKE_BUFFER_CAPACITY: usize = 2 * 1024;

/// Identifies a [`Session`] independent of either socket's reactor [`Token`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SessionId(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
	Greeting,
	Request,
	Resolving,
	Connecting,
	Relaying,
}

pub struct Session {
	pub id: SessionId,
	pub peer_addr: SocketAddr,
	pub state: State,

	pub client: TcpStream,
	pub client_token: Token,

	pub remote: Option<TcpStream>,
	pub remote_token: Option<Token>,

	/// Handshake bytes: GREETING then REQUEST, reused across both.
	pub msg: Buffer,
	/// Client -> remote relay bytes.
	pub c2r: Buffer,
	/// Remote -> client relay bytes, also used to spool a short handshake
	/// reply write until the client socket is writable again.
	pub r2c: Buffer,

	pub target_host: String,
	pub target_port: u16,

	pub client_half_closed: bool,
	pub remote_half_closed: bool,

	/// Set once an error reply has been spooled and the session should close
	/// as soon as the client socket finishes draining it.
	pub pending_close: bool,
}

impl Session {
	pub fn new(id: SessionId, client: TcpStream, client_token: Token, peer_addr: SocketAddr) -> Self {
		Self {
			id,
			peer_addr,
			state: State::Greeting,
			client,
			client_token,
			remote: None,
			remote_token: None,
			msg: Buffer::with_capacity(HANDSHAKE_BUFFER_CAPACITY),
			r2c: Buffer::with_capacity(RELAY_BUFFER_CAPACITY),
			c2r: Buffer::with_capacity(RELAY_BUFFER_CAPACITY),
			target_host: String::new(),
			target_port: 0,
			client_half_closed: false,
			remote_half_closed: false,
			pending_close: false,
		}
	}

	/// Both halves have seen EOF and nothing remains queued to write out
	/// either direction - the session has nothing left to do.
	pub fn fully_drained_and_closed(&self) -> bool {
		self.client_half_closed && self.remote_half_closed && !self.c2r.has_queued_data() && !self.r2c.has_queued_data()
	}
}
