//! Adaptive per-origin health checking. The checker owns one background task per
//! distinct origin URL and emits [`HealthEvent`]s on a broadcast channel; it never surfaces
//! errors to callers, only up/down transitions.

mod probe;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{HealthCheckConfig, Origin};

const SUCCESS_THRESHOLD: u32 = 3;
const MIN_INTERVAL: Duration = Duration::from_secs(1);
const MAX_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum HealthEvent {
	Up { pool: Arc<str>, origin: Arc<str> },
	Down { pool: Arc<str>, origin: Arc<str> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
	Up,
	Down,
}

struct OriginTask {
	handle: JoinHandle<()>,
	urgent: watch::Sender<u64>,
}

/// Background checker for one `UpstreamPool` generation. Dropping it aborts every probe task.
pub struct HealthChecker {
	pool: Arc<str>,
	events_tx: broadcast::Sender<HealthEvent>,
	tasks: parking_lot::Mutex<HashMap<Arc<str>, OriginTask>>,
}

impl HealthChecker {
	pub fn new(pool: Arc<str>) -> Arc<Self> {
		let (events_tx, _) = broadcast::channel(64);
		Arc::new(HealthChecker {
			pool,
			events_tx,
			tasks: parking_lot::Mutex::new(HashMap::new()),
		})
	}

	pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
		self.events_tx.subscribe()
	}

	/// Diffs the given origin set against currently running tasks: new origins get a task, origins
	/// that disappeared get theirs stopped, origins that persist keep their interval state.
	pub fn update_members(self: &Arc<Self>, origins: &[Arc<Origin>]) {
		let mut tasks = self.tasks.lock();
		let live: std::collections::HashSet<Arc<str>> = origins.iter().map(|o| o.url.clone()).collect();
		tasks.retain(|url, task| {
			if live.contains(url) {
				true
			} else {
				task.handle.abort();
				false
			}
		});
		for origin in origins {
			if tasks.contains_key(&origin.url) {
				continue;
			}
			let (urgent_tx, urgent_rx) = watch::channel(0u64);
			let this = self.clone();
			let origin = origin.clone();
			let handle = tokio::spawn(this.run_origin(origin.clone(), urgent_rx));
			tasks.insert(origin.url.clone(), OriginTask { handle, urgent: urgent_tx });
		}
	}

	/// Forces the named origin's next probe to run immediately at `MIN_INTERVAL`, bypassing its
	/// current backoff timer (an urgent check).
	pub fn check_urgent(&self, url: &str) {
		let tasks = self.tasks.lock();
		if let Some(task) = tasks.get(url) {
			task.urgent.send_modify(|n| *n += 1);
		}
	}

	async fn run_origin(self: Arc<Self>, origin: Arc<Origin>, mut urgent: watch::Receiver<u64>) {
		let cfg = origin.health_check.clone();
		let mut interval = cfg.interval.max(MIN_INTERVAL);
		let mut consecutive_successes = 0u32;
		let mut consecutive_failures = 0u32;
		let mut down = false;

		loop {
			tokio::select! {
				_ = tokio::time::sleep(interval) => {}
				_ = urgent.changed() => {
					interval = MIN_INTERVAL;
				}
			}

			let ok = probe::run(&origin.url, &cfg).await;
			if ok {
				consecutive_failures = 0;
				consecutive_successes += 1;
				if down {
					down = false;
					consecutive_successes = 0;
					consecutive_failures = 0;
					interval = cfg.interval.max(MIN_INTERVAL);
					info!(pool = %self.pool, origin = %origin.url, "origin recovered");
					let _ = self.events_tx.send(HealthEvent::Up {
						pool: self.pool.clone(),
						origin: origin.url.clone(),
					});
				} else if consecutive_successes >= SUCCESS_THRESHOLD {
					consecutive_successes = 0;
					interval = (interval * 2).min(MAX_INTERVAL);
				}
			} else {
				consecutive_successes = 0;
				consecutive_failures += 1;
				interval = MIN_INTERVAL;
				debug!(pool = %self.pool, origin = %origin.url, failures = consecutive_failures, "probe failed");
				if !down && consecutive_failures >= cfg.retries {
					down = true;
					info!(pool = %self.pool, origin = %origin.url, "origin marked down");
					let _ = self.events_tx.send(HealthEvent::Down {
						pool: self.pool.clone(),
						origin: origin.url.clone(),
					});
				}
			}
		}
	}
}

impl Drop for HealthChecker {
	fn drop(&mut self) {
		for task in self.tasks.lock().values() {
			task.handle.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn interval_bounds_are_sane() {
		assert!(MIN_INTERVAL < MAX_INTERVAL);
		assert_eq!(SUCCESS_THRESHOLD, 3);
	}
}
