//! Minimal A/IN-record DNS message encoding and decoding.
//!
//! Intentionally narrow: only what the resolver needs to issue an A query
//! and read back the first A answer. No compression-pointer following, no
//! other record types.

use std::net::Ipv4Addr;

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

/// Builds a standard, recursion-desired A/IN query for `name`, tagged with
/// `id`. A trailing `.` in `name` is tolerated and does not produce an
/// empty label. Returns `None` if any label is longer than the 63 octets a
/// DNS label can encode - `name` comes from a client-supplied SOCKS5
/// domain, so this has to be rejected rather than asserted on.
pub fn build_query(id: u16, name: &str) -> Option<Vec<u8>> {
	let mut buf = Vec::with_capacity(16 + name.len());

	buf.extend_from_slice(&id.to_be_bytes());
	buf.extend_from_slice(&0x0100u16.to_be_bytes()); // flags: RD=1
	buf.extend_from_slice(&1u16.to_be_bytes()); // qdcount
	buf.extend_from_slice(&0u16.to_be_bytes()); // ancount
	buf.extend_from_slice(&0u16.to_be_bytes()); // nscount
	buf.extend_from_slice(&0u16.to_be_bytes()); // arcount

	for label in name.split('.') {
		if label.is_empty() {
			continue;
		}

		if label.len() > 63 {
			return None;
		}

		buf.push(label.len() as u8);
		buf.extend_from_slice(label.as_bytes());
	}

	buf.push(0); // root label

	buf.extend_from_slice(&TYPE_A.to_be_bytes());
	buf.extend_from_slice(&CLASS_IN.to_be_bytes());

	Some(buf)
}

/// The outcome of a well-formed response: either an A record was found, or
/// the message parsed cleanly but carried no usable answer.
pub enum Answer {
	Found(Ipv4Addr),
	Empty,
}

/// Parses a response datagram, returning its transaction ID and the first
/// A record in the ANSWER section, if any. Returns `None` if the message is
/// too short or structurally inconsistent to parse at all - such datagrams
/// are dropped silently by the caller rather than treated as a resolution
/// failure.
pub fn parse_response(buf: &[u8]) -> Option<(u16, Answer)> {
	let mut c = Cursor::new(buf);

	let id = c.u16()?;
	let flags = c.u16()?;
	let qdcount = c.u16()?;
	let ancount = c.u16()?;
	let _nscount = c.u16()?;
	let _arcount = c.u16()?;

	// A non-zero RCODE (the low 4 bits of the flags word) means the resolver
	// is reporting an error - SERVFAIL, NXDOMAIN, etc. Treat it the same as
	// an empty ANSWER section rather than trusting whatever records follow.
	if flags & 0x000F != 0 {
		return Some((id, Answer::Empty));
	}

	for _ in 0..qdcount {
		skip_name(&mut c)?;
		c.skip(4)?; // qtype + qclass
	}

	for _ in 0..ancount {
		skip_name(&mut c)?;

		let ty = c.u16()?;
		let class = c.u16()?;
		let _ttl = c.u32()?;
		let rdlength = c.u16()?;
		let rdata = c.bytes(rdlength as usize)?;

		if ty == TYPE_A && class == CLASS_IN && rdata.len() == 4 {
			return Some((id, Answer::Found(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))));
		}
	}

	Some((id, Answer::Empty))
}

struct Cursor<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> Cursor<'a> {
	fn new(buf: &'a [u8]) -> Self {
		Self { buf, pos: 0 }
	}

	fn u8(&mut self) -> Option<u8> {
		let b = *self.buf.get(self.pos)?;
		self.pos += 1;
		Some(b)
	}

	fn u16(&mut self) -> Option<u16> {
		let s = self.buf.get(self.pos..self.pos + 2)?;
		self.pos += 2;
		Some(u16::from_be_bytes([s[0], s[1]]))
	}

	fn u32(&mut self) -> Option<u32> {
		let s = self.buf.get(self.pos..self.pos + 4)?;
		self.pos += 4;
		Some(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
	}

	fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
		let s = self.buf.get(self.pos..self.pos + n)?;
		self.pos += n;
		Some(s)
	}

	fn skip(&mut self, n: usize) -> Option<()> {
		if self.pos + n > self.buf.len() {
			return None;
		}

		self.pos += n;
		Some(())
	}
}

/// Skips a (possibly compressed) domain name, per RFC 1035 section 4.1.4.
/// A compression pointer is not followed - only skipped, since the caller
/// only needs to find where the name ends in this message.
fn skip_name(c: &mut Cursor) -> Option<()> {
	loop {
		let len = c.u8()?;

		if len == 0 {
			break;
		}

		if len & 0xC0 == 0xC0 {
			c.u8()?;
			break;
		}

		c.skip(len as usize)?;
	}

	Some(())
}
