use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Balancer, Member};

struct Entry {
	url: Arc<str>,
	weight: u32,
	active: i64,
}

#[derive(Default)]
struct State {
	entries: Vec<Entry>,
}

/// Least-connections: picks the origin with the fewest in-flight requests, tying by
/// higher weight then declared order.
pub struct LeastConnectionsBalancer {
	state: Mutex<State>,
}

impl LeastConnectionsBalancer {
	pub fn new() -> Self {
		LeastConnectionsBalancer {
			state: Mutex::new(State::default()),
		}
	}
}

impl Balancer for LeastConnectionsBalancer {
	fn next(&self, _client_ip: Option<IpAddr>) -> Option<Arc<str>> {
		let mut state = self.state.lock();
		let idx = state
			.entries
			.iter()
			.enumerate()
			.min_by_key(|(i, e)| (e.active, std::cmp::Reverse(e.weight), *i))
			.map(|(i, _)| i)?;
		state.entries[idx].active += 1;
		Some(state.entries[idx].url.clone())
	}

	fn update_members(&self, members: &[Member]) {
		let mut state = self.state.lock();
		let mut next = Vec::with_capacity(members.len());
		for m in members {
			let active = state.entries.iter().find(|e| e.url == m.url).map(|e| e.active).unwrap_or(0);
			next.push(Entry {
				url: m.url.clone(),
				weight: m.weight,
				active,
			});
		}
		state.entries = next;
	}

	fn note_complete(&self, url: &str) {
		let mut state = self.state.lock();
		if let Some(e) = state.entries.iter_mut().find(|e| &*e.url == url) {
			e.active = (e.active - 1).max(0);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn members(pairs: &[(&str, u32)]) -> Vec<Member> {
		pairs
			.iter()
			.map(|(u, w)| Member {
				url: (*u).into(),
				weight: *w,
			})
			.collect()
	}

	#[test]
	fn picks_fewest_active_connections() {
		let b = LeastConnectionsBalancer::new();
		b.update_members(&members(&[("a", 1), ("b", 1)]));
		assert_eq!(b.next(None).as_deref(), Some("a"));
		assert_eq!(b.next(None).as_deref(), Some("b"));
		// both now at 1 active; a was picked first so tie-breaks to declared order again
		assert_eq!(b.next(None).as_deref(), Some("a"));
		b.note_complete("a");
		b.note_complete("a");
		assert_eq!(b.next(None).as_deref(), Some("a"));
	}

	#[test]
	fn ties_prefer_higher_weight_then_order() {
		let b = LeastConnectionsBalancer::new();
		b.update_members(&members(&[("low", 1), ("high", 5)]));
		assert_eq!(b.next(None).as_deref(), Some("high"));
	}
}
