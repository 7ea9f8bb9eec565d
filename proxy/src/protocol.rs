//! Pure SOCKS5 GREETING/REQUEST parsing and reply encoding. No I/O: frames
//! are read out of a [`Buffer`] already filled from the socket, using the
//! mark/reset dance to roll back a short read without losing bytes.

use std::net::Ipv4Addr;

use crate::buffer::Buffer;

const VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const NO_AUTH: u8 = 0x00;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

pub const GREETING_NO_AUTH: [u8; 2] = [VERSION, NO_AUTH];
pub const GREETING_NO_ACCEPTABLE: [u8; 2] = [VERSION, 0xFF];

pub enum Greeting {
	NoAuthRequired,
	/// No method the client offered is acceptable; reply 0x05 0xFF and close.
	Unacceptable,
	/// VER wasn't 0x05. The original parser never checked this; corrected
	/// here to close the connection rather than proceed into REQUEST parsing
	/// against a client that isn't speaking SOCKS5 at all.
	BadVersion,
}

pub enum Request {
	Ipv4 { addr: Ipv4Addr, port: u16 },
	Domain { host: String, port: u16 },
	/// VER or CMD didn't match what this proxy supports (CONNECT only).
	UnsupportedCommand,
	UnsupportedAtyp,
}

/// Attempts to parse one frame out of `buf`. `buf` is taken in fill mode;
/// on a short read the consumed bytes are rolled back via mark/reset so the
/// next socket read can append to the same frame, and either way `buf` is
/// left back in fill mode via `compact`.
fn frame<T>(buf: &mut Buffer, parse: impl FnOnce(&mut Buffer) -> Option<T>) -> Option<T> {
	buf.flip();
	buf.mark();

	let result = parse(buf);

	if result.is_none() {
		buf.reset();
	}

	buf.compact();
	result
}

pub fn parse_greeting(buf: &mut Buffer) -> Option<Greeting> {
	frame(buf, |b| {
		let ver = b.get_u8()?;
		let nmethods = b.get_u8()?;
		let methods = b.get_bytes(nmethods as usize)?;

		if ver != VERSION {
			return Some(Greeting::BadVersion);
		}

		if methods.contains(&NO_AUTH) {
			Some(Greeting::NoAuthRequired)
		} else {
			Some(Greeting::Unacceptable)
		}
	})
}

pub fn parse_request(buf: &mut Buffer) -> Option<Request> {
	frame(buf, |b| {
		let ver = b.get_u8()?;
		let cmd = b.get_u8()?;
		let _rsv = b.get_u8()?;
		let atyp = b.get_u8()?;

		if ver != VERSION || cmd != CMD_CONNECT {
			return Some(Request::UnsupportedCommand);
		}

		match atyp {
			ATYP_IPV4 => {
				let octets = b.get_bytes(4)?;
				let addr = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
				let port = b.get_u16()?;
				Some(Request::Ipv4 { addr, port })
			}
			ATYP_DOMAIN => {
				let len = b.get_u8()?;
				let name = b.get_bytes(len as usize)?;
				let host = String::from_utf8_lossy(name).into_owned();
				let port = b.get_u16()?;
				Some(Request::Domain { host, port })
			}
			_ => Some(Request::UnsupportedAtyp),
		}
	})
}

/// Encodes a 10-byte REQUEST reply. `bound` is the address/port the proxy's
/// outbound socket ended up bound to; omitted (zeroed) for non-success
/// replies, where the client doesn't care what it contains.
pub fn encode_reply(rep: u8, bound: Option<(Ipv4Addr, u16)>) -> [u8; 10] {
	let mut out = [0u8; 10];
	out[0] = VERSION;
	out[1] = rep;
	out[3] = ATYP_IPV4;

	if let Some((addr, port)) = bound {
		out[4..8].copy_from_slice(&addr.octets());
		out[8..10].copy_from_slice(&port.to_be_bytes());
	}

	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn greeting_needs_more_data_rolls_back_cleanly() {
		let mut buf = Buffer::with_capacity(64);

		buf.fill_slice()[0] = VERSION;
		buf.advance(1);

		assert!(parse_greeting(&mut buf).is_none());
		assert_eq!(buf.position(), 1);

		buf.fill_slice()[0] = 1;
		buf.fill_slice()[1] = NO_AUTH;
		buf.advance(2);

		assert!(matches!(parse_greeting(&mut buf), Some(Greeting::NoAuthRequired)));
	}

	#[test]
	fn greeting_rejects_no_acceptable_method() {
		let mut buf = Buffer::with_capacity(64);
		buf.fill_slice()[..3].copy_from_slice(&[VERSION, 1, 0x02]);
		buf.advance(3);

		assert!(matches!(parse_greeting(&mut buf), Some(Greeting::Unacceptable)));
	}

	#[test]
	fn greeting_rejects_bad_version() {
		let mut buf = Buffer::with_capacity(64);
		buf.fill_slice()[..3].copy_from_slice(&[0x04, 1, NO_AUTH]);
		buf.advance(3);

		assert!(matches!(parse_greeting(&mut buf), Some(Greeting::BadVersion)));
	}

	#[test]
	fn request_parses_ipv4_connect() {
		let mut buf = Buffer::with_capacity(64);
		let bytes = [VERSION, CMD_CONNECT, 0x00, ATYP_IPV4, 93, 184, 216, 34, 0x00, 0x50];
		buf.fill_slice()[..bytes.len()].copy_from_slice(&bytes);
		buf.advance(bytes.len());

		match parse_request(&mut buf) {
			Some(Request::Ipv4 { addr, port }) => {
				assert_eq!(addr, Ipv4Addr::new(93, 184, 216, 34));
				assert_eq!(port, 80);
			}
			_ => panic!("expected an IPv4 request"),
		}
	}

	#[test]
	fn request_parses_domain_connect_and_rolls_back_when_short() {
		let mut buf = Buffer::with_capacity(64);
		let mut bytes = vec![VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, 11];
		bytes.extend_from_slice(b"example.com");
		bytes.extend_from_slice(&443u16.to_be_bytes());

		// Feed everything but the last byte first.
		let (head, tail) = bytes.split_at(bytes.len() - 1);
		buf.fill_slice()[..head.len()].copy_from_slice(head);
		buf.advance(head.len());

		assert!(parse_request(&mut buf).is_none());

		buf.fill_slice()[..tail.len()].copy_from_slice(tail);
		buf.advance(tail.len());

		match parse_request(&mut buf) {
			Some(Request::Domain { host, port }) => {
				assert_eq!(host, "example.com");
				assert_eq!(port, 443);
			}
			_ => panic!("expected a domain request"),
		}
	}

	#[test]
	fn request_rejects_unsupported_command_and_atyp() {
		let mut buf = Buffer::with_capacity(64);
		buf.fill_slice()[..4].copy_from_slice(&[VERSION, 0x02, 0x00, ATYP_IPV4]);
		buf.advance(4);
		assert!(matches!(parse_request(&mut buf), Some(Request::UnsupportedCommand)));

		let mut buf = Buffer::with_capacity(64);
		buf.fill_slice()[..4].copy_from_slice(&[VERSION, CMD_CONNECT, 0x00, 0x04]);
		buf.advance(4);
		assert!(matches!(parse_request(&mut buf), Some(Request::UnsupportedAtyp)));
	}

	#[test]
	fn reply_encodes_version_and_atyp_ipv4() {
		let reply = encode_reply(REP_SUCCESS, Some((Ipv4Addr::new(10, 0, 0, 1), 1080)));
		assert_eq!(reply[0], VERSION);
		assert_eq!(reply[1], REP_SUCCESS);
		assert_eq!(reply[3], ATYP_IPV4);
		assert_eq!(&reply[4..8], &[10, 0, 0, 1]);
		assert_eq!(&reply[8..10], &1080u16.to_be_bytes());
	}
}
