//! A fixed-capacity byte buffer with Java-NIO-style `position`/`limit`/`mark`
//! semantics: the same storage is used in "fill" mode (appending bytes read
//! from a socket) and "drain" mode (reading bytes back out, whether to parse
//! a frame or to write them to a socket), switched with `flip`/`compact`.

pub struct Buffer {
	data: Box<[u8]>,
	position: usize,
	limit: usize,
	mark: Option<usize>,
}

impl Buffer {
	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			data: vec![0u8; capacity].into_boxed_slice(),
			position: 0,
			limit: capacity,
			mark: None,
		}
	}

	pub fn capacity(&self) -> usize {
		self.data.len()
	}

	pub fn position(&self) -> usize {
		self.position
	}

	pub fn limit(&self) -> usize {
		self.limit
	}

	/// Bytes available between `position` and `limit`.
	pub fn remaining(&self) -> usize {
		self.limit - self.position
	}

	pub fn has_remaining(&self) -> bool {
		self.remaining() > 0
	}

	/// Whether there are bytes queued for draining. Meaningful only at a rest
	/// point between operations, when the buffer is in fill mode: a non-zero
	/// `position` there means bytes are buffered and waiting to be written out.
	pub fn has_queued_data(&self) -> bool {
		self.position > 0
	}

	/// Whether the buffer has no room left to fill (`position == capacity`).
	/// Only meaningful while in fill mode (`limit == capacity`).
	pub fn is_full(&self) -> bool {
		self.position >= self.capacity()
	}

	/// Switches from fill mode to drain mode: `limit` becomes the current
	/// `position` (the amount filled), and `position` resets to 0.
	pub fn flip(&mut self) {
		self.limit = self.position;
		self.position = 0;
		self.mark = None;
	}

	/// Resets to an empty fill-mode buffer, discarding all content.
	pub fn clear(&mut self) {
		self.position = 0;
		self.limit = self.capacity();
		self.mark = None;
	}

	/// Shifts the unconsumed region (`position..limit`) to the front and
	/// switches back to fill mode, with `position` left just past the
	/// retained bytes. Used both to discard a successfully parsed frame's
	/// prefix and, on a short read, to undo a `reset()` cleanly.
	pub fn compact(&mut self) {
		let remaining = self.remaining();
		self.data.copy_within(self.position..self.limit, 0);
		self.position = remaining;
		self.limit = self.capacity();
		self.mark = None;
	}

	/// Records the current position so a later `reset` can roll back to it.
	pub fn mark(&mut self) {
		self.mark = Some(self.position);
	}

	/// Rolls `position` back to the last `mark`.
	///
	/// # Panics
	/// Panics if `mark` was never called since the last mode switch.
	pub fn reset(&mut self) {
		self.position = self.mark.expect("reset() without a prior mark()");
	}

	/// The writable region in fill mode.
	pub fn fill_slice(&mut self) -> &mut [u8] {
		&mut self.data[self.position..self.limit]
	}

	/// Advances `position` by `n`, as if `n` bytes were just written or read.
	pub fn advance(&mut self, n: usize) {
		assert!(self.position + n <= self.limit);
		self.position += n;
	}

	/// The readable region: bytes between `position` and `limit`.
	pub fn as_slice(&self) -> &[u8] {
		&self.data[self.position..self.limit]
	}

	pub fn consume(&mut self, n: usize) {
		self.advance(n);
	}

	pub fn get_u8(&mut self) -> Option<u8> {
		if self.remaining() < 1 {
			return None;
		}

		let b = self.data[self.position];
		self.position += 1;
		Some(b)
	}

	pub fn get_u16(&mut self) -> Option<u16> {
		if self.remaining() < 2 {
			return None;
		}

		let b = [self.data[self.position], self.data[self.position + 1]];
		self.position += 2;
		Some(u16::from_be_bytes(b))
	}

	pub fn get_bytes(&mut self, n: usize) -> Option<&[u8]> {
		if self.remaining() < n {
			return None;
		}

		let slice = &self.data[self.position..self.position + n];
		self.position += n;
		Some(slice)
	}
}

#[cfg(test)]
mod tests {
	use super::Buffer;

	#[test]
	fn fill_then_flip_then_drain() {
		let mut buf = Buffer::with_capacity(16);

		buf.fill_slice()[..5].copy_from_slice(b"hello");
		buf.advance(5);

		assert_eq!(buf.position(), 5);
		assert!(!buf.is_full());

		buf.flip();

		assert_eq!(buf.as_slice(), b"hello");
		assert_eq!(buf.remaining(), 5);
	}

	#[test]
	fn compact_preserves_unconsumed_tail() {
		let mut buf = Buffer::with_capacity(16);

		buf.fill_slice()[..6].copy_from_slice(b"abcdef");
		buf.advance(6);
		buf.flip();

		// Consume "ab", leaving "cdef" unconsumed.
		buf.consume(2);
		buf.compact();

		// Back in fill mode, with "cdef" retained at the front.
		assert_eq!(buf.position(), 4);
		assert_eq!(&buf.fill_slice()[..0], b"");
		buf.flip();
		assert_eq!(buf.as_slice(), b"cdef");
	}

	#[test]
	fn mark_and_reset_roll_back_a_short_read() {
		let mut buf = Buffer::with_capacity(16);

		buf.fill_slice()[0] = 5;
		buf.advance(1);
		buf.flip();

		buf.mark();
		let ver = buf.get_u8();
		assert_eq!(ver, Some(5));

		// Not enough bytes for the next field - roll back.
		assert_eq!(buf.get_u16(), None);
		buf.reset();
		assert_eq!(buf.position(), 0);

		buf.compact();
		assert_eq!(buf.position(), 1);
	}

	#[test]
	fn get_bytes_respects_remaining() {
		let mut buf = Buffer::with_capacity(8);

		buf.fill_slice()[..4].copy_from_slice(b"abcd");
		buf.advance(4);
		buf.flip();

		assert_eq!(buf.get_bytes(5), None);
		assert_eq!(buf.get_bytes(2), Some(&b"ab"[..]));
		assert_eq!(buf.remaining(), 2);
	}

	#[test]
	fn is_full_reflects_capacity() {
		let mut buf = Buffer::with_capacity(2);

		assert!(!buf.is_full());
		buf.advance(2);
		assert!(buf.is_full());
	}

	#[test]
	fn has_queued_data_tracks_fill_mode_position() {
		let mut buf = Buffer::with_capacity(8);

		assert!(!buf.has_queued_data());
		buf.advance(3);
		assert!(buf.has_queued_data());
	}
}
