//! A minimal non-blocking I/O multiplexer built directly on `libc::poll`.
//!
//! No `mio`, no async runtime: one flat array of `pollfd`, polled once per
//! reactor iteration. Registration is keyed by a caller-supplied [`Token`]
//! rather than the raw descriptor, so the layers above never touch `libc`.

use std::io;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Token(pub usize);

/// The readiness conditions a registered descriptor is waiting for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Interest(libc::c_short);

impl Interest {
	pub const NONE: Interest = Interest(0);
	pub const READABLE: Interest = Interest(libc::POLLIN);
	pub const WRITABLE: Interest = Interest(libc::POLLOUT);

	#[must_use]
	pub fn add(self, other: Interest) -> Interest {
		Interest(self.0 | other.0)
	}

	#[must_use]
	pub fn remove(self, other: Interest) -> Interest {
		Interest(self.0 & !other.0)
	}

	#[must_use]
	pub fn contains(self, other: Interest) -> bool {
		self.0 & other.0 == other.0
	}
}

impl Default for Interest {
	fn default() -> Self {
		Interest::NONE
	}
}

pub struct Event {
	pub token: Token,
	pub readable: bool,
	pub writable: bool,
}

pub struct Selector {
	fds: Vec<libc::pollfd>,
	tokens: Vec<Token>,
}

impl Selector {
	pub fn new() -> Self {
		Self { fds: Vec::new(), tokens: Vec::new() }
	}

	/// Whether any descriptor is currently registered.
	pub fn is_empty(&self) -> bool {
		self.fds.is_empty()
	}

	pub fn register(&mut self, fd: &impl AsRawFd, token: Token, interest: Interest) {
		self.fds.push(libc::pollfd { fd: fd.as_raw_fd(), events: interest.0, revents: 0 });
		self.tokens.push(token);
	}

	pub fn reregister(&mut self, token: Token, interest: Interest) {
		if let Some(idx) = self.index_of(token) {
			self.fds[idx].events = interest.0;
		}
	}

	/// The interest currently registered for `token`, or `Interest::NONE` if
	/// it isn't registered. Lets callers toggle a single bit without tracking
	/// a parallel copy of each key's interest set themselves.
	pub fn current_interest(&self, token: Token) -> Interest {
		match self.index_of(token) {
			Some(idx) => Interest(self.fds[idx].events),
			None => Interest::NONE,
		}
	}

	pub fn deregister(&mut self, token: Token) {
		if let Some(idx) = self.index_of(token) {
			self.fds.swap_remove(idx);
			self.tokens.swap_remove(idx);
		}
	}

	fn index_of(&self, token: Token) -> Option<usize> {
		self.tokens.iter().position(|&t| t == token)
	}

	/// Blocks for up to `timeout` (or indefinitely if `None`), returning the
	/// set of descriptors that became ready.
	pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
		let timeout_ms = timeout.and_then(|d| i32::try_from(d.as_millis()).ok()).unwrap_or(-1);

		let ret = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms) };

		if ret < 0 {
			return Err(io::Error::last_os_error());
		}

		let mut events = Vec::with_capacity(ret as usize);

		for (fd, &token) in self.fds.iter_mut().zip(self.tokens.iter()) {
			if fd.revents == 0 {
				continue;
			}

			let err = fd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;

			events.push(Event {
				token,
				readable: err || fd.revents & libc::POLLIN != 0,
				writable: err || fd.revents & libc::POLLOUT != 0,
			});

			fd.revents = 0;
		}

		Ok(events)
	}
}

impl Default for Selector {
	fn default() -> Self {
		Self::new()
	}
}
