use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Balancer, Member};

struct Entry {
	url: Arc<str>,
	weight: i64,
	current: i64,
}

#[derive(Default)]
struct State {
	entries: Vec<Entry>,
}

/// Smooth weighted round-robin: a contiguous, smooth schedule matching declared
/// weights rather than bursts of the heaviest origin.
pub struct SmoothWeightedBalancer {
	state: Mutex<State>,
}

impl SmoothWeightedBalancer {
	pub fn new() -> Self {
		SmoothWeightedBalancer {
			state: Mutex::new(State::default()),
		}
	}
}

impl Balancer for SmoothWeightedBalancer {
	fn next(&self, _client_ip: Option<IpAddr>) -> Option<Arc<str>> {
		let mut state = self.state.lock();
		if state.entries.is_empty() {
			return None;
		}
		let total: i64 = state.entries.iter().map(|e| e.weight).sum();
		for e in state.entries.iter_mut() {
			e.current += e.weight;
		}
		// Tie-break to the earliest declared entry: pair with Reverse(index) so max_by_key's
		// last-wins-on-ties behavior resolves to the smallest index.
		let idx = state
			.entries
			.iter()
			.enumerate()
			.max_by_key(|(i, e)| (e.current, std::cmp::Reverse(*i)))
			.map(|(i, _)| i)?;
		state.entries[idx].current -= total;
		Some(state.entries[idx].url.clone())
	}

	fn update_members(&self, members: &[Member]) {
		let mut state = self.state.lock();
		let mut next = Vec::with_capacity(members.len());
		for m in members {
			let current = state
				.entries
				.iter()
				.find(|e| e.url == m.url)
				.map(|e| e.current)
				.unwrap_or(0);
			next.push(Entry {
				url: m.url.clone(),
				weight: m.weight as i64,
				current,
			});
		}
		state.entries = next;
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
	fn smooth_schedule_matches_weights_without_bursts() {
		let b = SmoothWeightedBalancer::new();
		b.update_members(&members(&[("a", 2), ("b", 1), ("c", 1)]));

		let mut counts = std::collections::HashMap::new();
		let mut history = Vec::new();
		for _ in 0..8 {
			let pick = b.next(None).unwrap();
			*counts.entry(pick.to_string()).or_insert(0) += 1;
			history.push(pick.to_string());
		}
		assert_eq!(counts.get("a"), Some(&4));
		assert_eq!(counts.get("b"), Some(&2));
		assert_eq!(counts.get("c"), Some(&2));

		let mut run = 0;
		let mut max_run = 0;
		let mut last = "";
		for pick in &history {
			if pick == last {
				run += 1;
			} else {
				run = 1;
				last = pick;
			}
			max_run = max_run.max(run);
		}
		assert!(max_run < 3, "no origin should run 3 times consecutively, history={history:?}");
	}

	#[test]
	fn empty_membership_returns_none() {
		let b = SmoothWeightedBalancer::new();
		assert!(b.next(None).is_none());
	}

	#[test]
	fn membership_update_preserves_state_for_surviving_urls() {
		let b = SmoothWeightedBalancer::new();
		b.update_members(&members(&[("a", 1), ("b", 1)]));
		b.next(None);
		b.update_members(&members(&[("a", 1), ("b", 1), ("c", 1)]));
		// doesn't panic, and c starts fresh at current=0
		for _ in 0..3 {
			b.next(None);
		}
	}
}
