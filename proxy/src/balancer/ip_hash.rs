use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::wrr::SmoothWeightedBalancer;
use super::{Balancer, Member};

struct State {
	members: Vec<Member>,
	total_weight: u64,
}

/// IP hash (optional policy): sticky selection by client IP, falling back to smooth
/// weighted round-robin when there is no IP (e.g. health-check driven calls) or the hashed origin
/// is unavailable.
pub struct IpHashBalancer {
	state: Mutex<State>,
	fallback: SmoothWeightedBalancer,
}

impl IpHashBalancer {
	pub fn new() -> Self {
		IpHashBalancer {
			state: Mutex::new(State {
				members: Vec::new(),
				total_weight: 0,
			}),
			fallback: SmoothWeightedBalancer::new(),
		}
	}
}

impl Balancer for IpHashBalancer {
	fn next(&self, client_ip: Option<IpAddr>) -> Option<Arc<str>> {
		let Some(ip) = client_ip else {
			return self.fallback.next(None);
		};
		let state = self.state.lock();
		if state.members.is_empty() {
			return None;
		}
		let mut hasher = std::collections::hash_map::DefaultHasher::new();
		ip.hash(&mut hasher);
		let idx = hasher.finish() % state.total_weight.max(1);
		let mut acc = 0u64;
		for m in &state.members {
			acc += m.weight as u64;
			if idx < acc {
				return Some(m.url.clone());
			}
		}
		self.fallback.next(None)
	}

	fn update_members(&self, members: &[Member]) {
		let mut state = self.state.lock();
		state.total_weight = members.iter().map(|m| m.weight as u64).sum();
		state.members = members.to_vec();
		self.fallback.update_members(members);
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
	fn same_ip_always_maps_to_same_origin() {
		let b = IpHashBalancer::new();
		b.update_members(&members(&[("a", 1), ("b", 1), ("c", 1)]));
		let ip: IpAddr = "203.0.113.7".parse().unwrap();
		let first = b.next(Some(ip));
		for _ in 0..10 {
			assert_eq!(b.next(Some(ip)), first);
		}
	}

	#[test]
	fn missing_ip_falls_back_to_weighted_round_robin() {
		let b = IpHashBalancer::new();
		b.update_members(&members(&[("a", 1)]));
		assert_eq!(b.next(None).as_deref(), Some("a"));
	}
}
