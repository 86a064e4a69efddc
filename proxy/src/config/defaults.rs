//! Field-by-field default merging: a missing field inherits from the next-broader
//! scope (origin -> pool -> built-in), never as a whole-object fallback.

use std::time::Duration;

use super::model::RawHealthCheck;
use super::snapshot::{HealthCheckConfig, ProbeKind};

pub fn merge_health_check(
	origin: Option<&RawHealthCheck>,
	pool: Option<&RawHealthCheck>,
) -> HealthCheckConfig {
	let base = HealthCheckConfig::default();
	let pick_kind = |r: Option<&RawHealthCheck>| {
		r.and_then(|h| h.kind.as_deref()).and_then(|k| match k {
			"tcp" => Some(ProbeKind::Tcp),
			"http" => Some(ProbeKind::Http),
			_ => None,
		})
	};
	let pick_path = |r: Option<&RawHealthCheck>| r.and_then(|h| h.path.clone());
	let pick_interval = |r: Option<&RawHealthCheck>| r.and_then(|h| h.interval).map(Duration::from_secs);
	let pick_timeout = |r: Option<&RawHealthCheck>| r.and_then(|h| h.timeout).map(Duration::from_secs);
	let pick_retries = |r: Option<&RawHealthCheck>| r.and_then(|h| h.retries);
	let pick_expected = |r: Option<&RawHealthCheck>| r.and_then(|h| h.expected_status.clone());

	HealthCheckConfig {
		kind: pick_kind(origin).or_else(|| pick_kind(pool)).unwrap_or(base.kind),
		path: pick_path(origin).or_else(|| pick_path(pool)).or(base.path),
		interval: pick_interval(origin)
			.or_else(|| pick_interval(pool))
			.unwrap_or(base.interval),
		timeout: pick_timeout(origin)
			.or_else(|| pick_timeout(pool))
			.unwrap_or(base.timeout),
		retries: pick_retries(origin)
			.or_else(|| pick_retries(pool))
			.unwrap_or(base.retries),
		expected_status: pick_expected(origin)
			.or_else(|| pick_expected(pool))
			.unwrap_or(base.expected_status),
	}
}

pub fn default_weight(weight: Option<u32>) -> u32 {
	weight.filter(|w| *w >= 1).unwrap_or(1)
}
