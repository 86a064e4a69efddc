//! Captcha blackhole gate: once an
//! IP trips the per-IP rate limit past `max_failed_attempts`, it is blackholed for `ban_duration`.
//! Survives config reloads since it is owned by `MiddlewareState`, not the `Snapshot`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct BanEntry {
	banned_at: Instant,
	duration: Duration,
}

const GC_INTERVAL: Duration = Duration::from_secs(60);

pub struct Blackhole {
	entries: Mutex<HashMap<IpAddr, BanEntry>>,
	last_gc: Mutex<Instant>,
}

impl Blackhole {
	pub fn new() -> Arc<Self> {
		Arc::new(Blackhole {
			entries: Mutex::new(HashMap::new()),
			last_gc: Mutex::new(Instant::now()),
		})
	}

	pub fn ban(&self, ip: IpAddr, duration: Duration) {
		self.entries.lock().insert(ip, BanEntry {
			banned_at: Instant::now(),
			duration,
		});
	}

	pub fn is_banned(&self, ip: IpAddr) -> bool {
		self.maybe_gc();
		self.entries
			.lock()
			.get(&ip)
			.map(|e| e.banned_at.elapsed() < e.duration)
			.unwrap_or(false)
	}

	/// Expired entries are swept every `GC_INTERVAL`, amortized onto whichever request happens to
	/// check a ban at the time (amortized garbage collection rather than a timer).
	fn maybe_gc(&self) {
		let mut last_gc = self.last_gc.lock();
		if last_gc.elapsed() < GC_INTERVAL {
			return;
		}
		*last_gc = Instant::now();
		self.entries.lock().retain(|_, e| e.banned_at.elapsed() < e.duration);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;

	#[test]
	fn ban_expires_after_duration() {
		let bh = Blackhole::new();
		let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
		bh.ban(ip, Duration::from_millis(1));
		std::thread::sleep(Duration::from_millis(5));
		assert!(!bh.is_banned(ip));
	}

	#[test]
	fn active_ban_blocks() {
		let bh = Blackhole::new();
		let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
		bh.ban(ip, Duration::from_secs(60));
		assert!(bh.is_banned(ip));
	}
}
