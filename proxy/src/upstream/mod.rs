//! Resolves `(listener, location, request)` to a target URL, respecting primary/backup tiers and
//! live health state. One `PoolState` is held per upstream pool; health events mutate
//! only the pool they name.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::debug;

use crate::balancer::{self, Balancer, Member};
use crate::config::{Policy, Snapshot, UpstreamPool};
use crate::health::{HealthChecker, HealthEvent};

#[derive(Debug, Error, Clone)]
pub enum Error {
	#[error("no healthy upstream available in pool '{pool}'")]
	NoAvailableUpstream { pool: Arc<str> },
	#[error("unknown upstream pool '{0}'")]
	UnknownPool(Arc<str>),
}

struct OriginState {
	backup: bool,
	manual_down: bool,
	is_down: AtomicBool,
}

struct PoolState {
	pool: Arc<UpstreamPool>,
	balancer: Arc<dyn Balancer>,
	checker: Arc<HealthChecker>,
	origins: HashMap<Arc<str>, OriginState>,
	backup_mode: AtomicBool,
}

impl PoolState {
	fn new(pool: Arc<UpstreamPool>) -> Self {
		let checker = HealthChecker::new(pool.name.clone());
		checker.update_members(&pool.origins);
		let balancer = balancer::build(pool.policy);
		let origins = pool
			.origins
			.iter()
			.map(|o| {
				(
					o.url.clone(),
					OriginState {
						backup: o.backup,
						manual_down: o.manual_down,
						is_down: AtomicBool::new(false),
					},
				)
			})
			.collect();
		let state = PoolState {
			pool,
			balancer,
			checker,
			origins,
			backup_mode: AtomicBool::new(false),
		};
		state.recompute_tier();
		state
	}

	fn eligible(&self, want_backup: bool) -> Vec<Member> {
		self.pool
			.origins
			.iter()
			.filter(|o| {
				let st = &self.origins[&o.url];
				st.backup == want_backup && !st.manual_down && !st.is_down.load(Ordering::Relaxed)
			})
			.map(Member::from)
			.collect()
	}

	/// Recomputes the primary/backup active tier and pushes it to the balancer if it changed
	/// selecting the backup tier when every primary origin is down.
	fn recompute_tier(&self) {
		let primaries = self.eligible(false);
		if !primaries.is_empty() {
			self.backup_mode.store(false, Ordering::Relaxed);
			self.balancer.update_members(&primaries);
			return;
		}
		let backups = self.eligible(true);
		if !backups.is_empty() {
			self.backup_mode.store(true, Ordering::Relaxed);
			self.balancer.update_members(&backups);
			return;
		}
		self.balancer.update_members(&[]);
	}

	/// Applies an `origin_down`/`origin_up` event. This only matters for the tier
	/// currently active (affects the primary set, or the backup set while in backup mode); a
	/// transition elsewhere is recorded but changes nothing observable until that tier is active,
	/// so unconditionally recomputing on any real state change is both correct and idempotent.
	fn mark(&self, url: &str, down: bool) {
		if let Some(state) = self.origins.get(url) {
			let was = state.is_down.swap(down, Ordering::Relaxed);
			if was != down {
				self.recompute_tier();
			}
		}
	}
}

pub struct UpstreamManager {
	pools: parking_lot::RwLock<HashMap<Arc<str>, Arc<PoolState>>>,
}

impl UpstreamManager {
	pub fn new(snapshot: &Snapshot) -> Arc<Self> {
		let mgr = Arc::new(UpstreamManager {
			pools: parking_lot::RwLock::new(HashMap::new()),
		});
		mgr.apply_snapshot(snapshot);
		mgr
	}

	/// Rebuilds pool state for a new config generation. Pools that persist by name keep their
	/// health-checker task set warm via `HealthChecker::update_members`'s own diffing; pools are
	/// otherwise replaced wholesale since weight/backup/health-check config may have changed.
	pub fn apply_snapshot(self: &Arc<Self>, snapshot: &Snapshot) {
		let mut pools = self.pools.write();
		let mut next = HashMap::new();
		for (name, pool) in &snapshot.upstreams {
			let state = Arc::new(PoolState::new(pool.clone()));
			let mgr = self.clone();
			let pool_name = name.clone();
			let mut events = state.checker.subscribe();
			tokio::spawn(async move {
				while let Ok(ev) = events.recv().await {
					mgr.on_health_event(&pool_name, ev);
				}
			});
			next.insert(name.clone(), state);
		}
		*pools = next;
	}

	fn on_health_event(&self, pool_name: &str, ev: HealthEvent) {
		let pools = self.pools.read();
		let Some(state) = pools.get(pool_name) else {
			return;
		};
		match ev {
			HealthEvent::Down { origin, .. } => {
				debug!(pool = pool_name, origin = %origin, "applying origin_down");
				state.mark(&origin, true);
			},
			HealthEvent::Up { origin, .. } => {
				debug!(pool = pool_name, origin = %origin, "applying origin_up");
				state.mark(&origin, false);
			},
		}
	}

	/// Resolution algorithm: `proxy_pass` locations never touch a balancer;
	/// `upstream` locations go through the pool's tiered, health-aware balancer.
	pub fn resolve(&self, upstream_name: &str, client_ip: Option<IpAddr>) -> Result<String, Error> {
		let pools = self.pools.read();
		let state = pools
			.get(upstream_name)
			.ok_or_else(|| Error::UnknownPool(upstream_name.into()))?;
		let url = state
			.balancer
			.next(client_ip)
			.ok_or_else(|| Error::NoAvailableUpstream {
				pool: upstream_name.into(),
			})?;
		Ok(normalize(&url))
	}

	pub fn note_complete(&self, upstream_name: &str, url: &str) {
		if let Some(state) = self.pools.read().get(upstream_name) {
			state.balancer.note_complete(url);
		}
	}

	/// Forces an immediate re-probe of `url` within `pool` (an urgent check, invoked by
	/// the proxy engine on connection-level errors).
	pub fn check_urgent(&self, upstream_name: &str, url: &str) {
		if let Some(state) = self.pools.read().get(upstream_name) {
			state.checker.check_urgent(url);
		}
	}

	pub fn policy(&self, upstream_name: &str) -> Option<Policy> {
		self.pools.read().get(upstream_name).map(|s| s.pool.policy)
	}

	/// Whether `upstream_name`'s active tier is currently its backup set, consulted
	/// by the proxy engine's redirect-rewriting rule for backup-origin external redirects.
	pub fn is_backup(&self, upstream_name: &str) -> bool {
		self.pools
			.read()
			.get(upstream_name)
			.map(|s| s.backup_mode.load(Ordering::Relaxed))
			.unwrap_or(false)
	}
}

fn normalize(url: &str) -> String {
	let trimmed = url.trim_end_matches('/');
	trimmed.replace("://localhost", "://127.0.0.1").replace("://[::1]", "://127.0.0.1")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn normalize_strips_trailing_slash_and_rewrites_localhost() {
		assert_eq!(normalize("http://localhost:8080/"), "http://127.0.0.1:8080");
	}
}
