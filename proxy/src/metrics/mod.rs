//! Per-listener counters and trend sampling. Hot-path writes are lock-free atomic
//! increments from the proxy engine; the trend ring buffer is the one place a `parking_lot::Mutex`
//! is used for shared state, since sampling happens on a low-frequency timer, not per request.

mod body;
mod registry;

pub use body::{Direction, MeteredBody, header_block_len};
pub use registry::PrometheusExport;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const DEFAULT_TREND_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
pub struct ListenerCounters {
	pub bytes_in: AtomicU64,
	pub bytes_out: AtomicU64,
	pub active_conns: AtomicI64,
	pub total_reqs: AtomicU64,
}

impl ListenerCounters {
	fn snapshot(&self) -> CounterSnapshot {
		CounterSnapshot {
			bytes_in: self.bytes_in.load(Ordering::Relaxed),
			bytes_out: self.bytes_out.load(Ordering::Relaxed),
			active_conns: self.active_conns.load(Ordering::Relaxed).max(0),
			total_reqs: self.total_reqs.load(Ordering::Relaxed),
		}
	}
}

#[derive(Debug, Clone, Copy, Default)]
struct CounterSnapshot {
	bytes_in: u64,
	bytes_out: u64,
	active_conns: i64,
	total_reqs: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct TrendSample {
	pub at: Instant,
	pub rps: f64,
	pub bytes_in_rate: f64,
	pub bytes_out_rate: f64,
	pub active_conns: i64,
}

struct Trend {
	samples: std::collections::VecDeque<TrendSample>,
	capacity: usize,
	last: Option<(Instant, CounterSnapshot)>,
}

/// Owns every listener's counters plus the overview trend buffer. Counters are keyed by listener
/// name and are intentionally stable across config reloads that keep the listener
/// name, so this registry is constructed once in `app::run` and outlives any single `Snapshot`.
pub struct MetricsRegistry {
	listeners: Mutex<HashMap<Arc<str>, Arc<ListenerCounters>>>,
	trend: Mutex<Trend>,
}

impl MetricsRegistry {
	pub fn new() -> Arc<Self> {
		Arc::new(MetricsRegistry {
			listeners: Mutex::new(HashMap::new()),
			trend: Mutex::new(Trend {
				samples: std::collections::VecDeque::with_capacity(DEFAULT_TREND_CAPACITY),
				capacity: DEFAULT_TREND_CAPACITY,
				last: None,
			}),
		})
	}

	pub fn listener(&self, name: &Arc<str>) -> Arc<ListenerCounters> {
		self.listeners.lock().entry(name.clone()).or_default().clone()
	}

	/// Ensures every listener in the current snapshot has a counter set. Pre-existing counters
	/// for listeners that persist across the reload are left untouched.
	pub fn sync_listeners(&self, names: impl Iterator<Item = Arc<str>>) {
		let mut listeners = self.listeners.lock();
		for name in names {
			listeners.entry(name).or_default();
		}
	}

	/// Computes one trend sample from the delta since the last tick.
	pub fn tick(&self) {
		let now = Instant::now();
		let totals = {
			let listeners = self.listeners.lock();
			listeners.values().fold(CounterSnapshot::default(), |mut acc, c| {
				let s = c.snapshot();
				acc.bytes_in += s.bytes_in;
				acc.bytes_out += s.bytes_out;
				acc.active_conns += s.active_conns;
				acc.total_reqs += s.total_reqs;
				acc
			})
		};

		let mut trend = self.trend.lock();
		if let Some((last_at, last_totals)) = trend.last {
			let elapsed = now.saturating_duration_since(last_at).as_secs_f64().max(f64::MIN_POSITIVE);
			let sample = TrendSample {
				at: now,
				rps: (totals.total_reqs.saturating_sub(last_totals.total_reqs)) as f64 / elapsed,
				bytes_in_rate: (totals.bytes_in.saturating_sub(last_totals.bytes_in)) as f64 / elapsed,
				bytes_out_rate: (totals.bytes_out.saturating_sub(last_totals.bytes_out)) as f64 / elapsed,
				active_conns: totals.active_conns,
			};
			if trend.samples.len() >= trend.capacity {
				trend.samples.pop_front();
			}
			trend.samples.push_back(sample);
		}
		trend.last = Some((now, totals));
	}

	pub fn get_overview(&self) -> Overview {
		let listeners = self.listeners.lock();
		let totals = listeners.values().fold(CounterSnapshot::default(), |mut acc, c| {
			let s = c.snapshot();
			acc.bytes_in += s.bytes_in;
			acc.bytes_out += s.bytes_out;
			acc.active_conns += s.active_conns;
			acc.total_reqs += s.total_reqs;
			acc
		});
		Overview {
			bytes_in: totals.bytes_in,
			bytes_out: totals.bytes_out,
			active_conns: totals.active_conns,
			total_reqs: totals.total_reqs,
		}
	}

	pub fn get_trend(&self, range: Option<Duration>) -> Vec<TrendSample> {
		let trend = self.trend.lock();
		match range {
			Some(range) => {
				let cutoff = Instant::now().checked_sub(range);
				trend
					.samples
					.iter()
					.filter(|s| cutoff.map(|c| s.at >= c).unwrap_or(true))
					.copied()
					.collect()
			},
			None => trend.samples.iter().copied().collect(),
		}
	}

	pub fn get_per_listener(&self) -> HashMap<Arc<str>, Overview> {
		self.listeners
			.lock()
			.iter()
			.map(|(name, c)| {
				let s = c.snapshot();
				(
					name.clone(),
					Overview {
						bytes_in: s.bytes_in,
						bytes_out: s.bytes_out,
						active_conns: s.active_conns,
						total_reqs: s.total_reqs,
					},
				)
			})
			.collect()
	}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Overview {
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub active_conns: i64,
	pub total_reqs: u64,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tick_computes_rate_since_previous_sample() {
		let registry = MetricsRegistry::new();
		let name: Arc<str> = "web".into();
		let counters = registry.listener(&name);
		counters.total_reqs.fetch_add(10, Ordering::Relaxed);
		registry.tick();
		counters.total_reqs.fetch_add(10, Ordering::Relaxed);
		std::thread::sleep(Duration::from_millis(10));
		registry.tick();
		let trend = registry.get_trend(None);
		assert_eq!(trend.len(), 1);
		assert!(trend[0].rps > 0.0);
	}

	#[test]
	fn active_conns_never_reported_negative() {
		let registry = MetricsRegistry::new();
		let name: Arc<str> = "web".into();
		let counters = registry.listener(&name);
		counters.active_conns.fetch_sub(3, Ordering::Relaxed);
		let overview = registry.get_per_listener();
		assert_eq!(overview[&name].active_conns, 0);
	}
}
