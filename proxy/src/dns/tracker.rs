//! Maps outstanding DNS query IDs back to the session that issued them, with
//! allocation and a wall-clock timeout sweep.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::warn;
use rand::Rng;

use crate::session::SessionId;

pub const TIMEOUT: Duration = Duration::from_secs(8);

/// Above this many outstanding queries, ID allocation is treated as
/// resolution failure rather than spent searching for a free slot.
const MAX_IN_FLIGHT: usize = 65_536;

struct Entry {
	session: SessionId,
	submitted_at: Instant,
}

#[derive(Default)]
pub struct Tracker {
	in_flight: HashMap<u16, Entry>,
}

impl Tracker {
	/// Allocates a fresh ID and records the query as outstanding. Returns
	/// `None` if the tracker is already saturated (the caller should treat
	/// this the same as any other resolution failure).
	pub fn submit(&mut self, session: SessionId) -> Option<u16> {
		if self.in_flight.len() >= MAX_IN_FLIGHT {
			warn!("DNS tracker saturated at {MAX_IN_FLIGHT} outstanding queries");
			return None;
		}

		let mut rng = rand::thread_rng();
		let mut id = rng.gen();

		while self.in_flight.contains_key(&id) {
			id = rng.gen();
		}

		self.in_flight.insert(id, Entry { session, submitted_at: Instant::now() });

		Some(id)
	}

	/// Removes and returns the session that owns `id`, if any is tracked.
	pub fn take(&mut self, id: u16) -> Option<SessionId> {
		self.in_flight.remove(&id).map(|e| e.session)
	}

	/// Removes the tracked query for `session`, if it is still outstanding
	/// (used when a session closes for a reason unrelated to DNS).
	pub fn cancel(&mut self, session: SessionId) {
		self.in_flight.retain(|_, e| e.session != session);
	}

	/// Removes and returns the sessions whose queries have been outstanding
	/// longer than [`TIMEOUT`].
	pub fn sweep_timed_out(&mut self) -> Vec<SessionId> {
		let now = Instant::now();
		let mut timed_out = Vec::new();

		self.in_flight.retain(|_, e| {
			if now.duration_since(e.submitted_at) > TIMEOUT {
				timed_out.push(e.session);
				false
			} else {
				true
			}
		});

		timed_out
	}

	#[cfg(test)]
	pub fn len(&self) -> usize {
		self.in_flight.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::session::SessionId;

	#[test]
	fn submit_then_take_round_trips() {
		let mut t = Tracker::default();
		let id = t.submit(SessionId(1)).unwrap();
		assert_eq!(t.len(), 1);
		assert_eq!(t.take(id), Some(SessionId(1)));
		assert_eq!(t.len(), 0);
	}

	#[test]
	fn take_unknown_id_returns_none() {
		let mut t = Tracker::default();
		assert_eq!(t.take(42), None);
	}

	#[test]
	fn cancel_removes_only_that_sessions_query() {
		let mut t = Tracker::default();
		let a = t.submit(SessionId(1)).unwrap();
		let _b = t.submit(SessionId(2)).unwrap();

		t.cancel(SessionId(1));

		assert_eq!(t.len(), 1);
		assert_eq!(t.take(a), None);
	}
}
