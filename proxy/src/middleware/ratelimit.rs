//! Fixed-window rate limiting keyed by client IP + the config object identity
//! (so a location's limiter and its listener's limiter are distinct buckets). Location config
//! takes precedence over listener config; the caller picks which one to apply.

use std::collections::HashMap;
use std::net::IpAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::Response;
use http_body_util::Full;
use parking_lot::Mutex;

use crate::config::RateLimitConfig;

use super::{MiddlewareCtx, ShortCircuit};

struct Window {
	started_at: Instant,
	count: u64,
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct Key {
	bucket: usize,
	ip: IpAddr,
}

pub struct RateLimiters {
	windows: Mutex<HashMap<Key, Window>>,
}

impl RateLimiters {
	pub fn new() -> Arc<Self> {
		Arc::new(RateLimiters {
			windows: Mutex::new(HashMap::new()),
		})
	}
}

pub fn run(
	state: &super::MiddlewareState,
	cfg: &Arc<RateLimitConfig>,
	ctx: &mut MiddlewareCtx<'_>,
) -> ControlFlow<ShortCircuit> {
	let bucket = Arc::as_ptr(cfg) as usize;
	let key = Key { bucket, ip: ctx.client_ip };

	let (count, remaining, reset_in) = {
		let mut windows = state.rate_limiters.windows.lock();
		let w = windows.entry(key).or_insert_with(|| Window {
			started_at: Instant::now(),
			count: 0,
		});
		if w.started_at.elapsed() >= cfg.window {
			w.started_at = Instant::now();
			w.count = 0;
		}
		w.count += 1;
		let remaining = cfg.max.saturating_sub(w.count);
		let reset_in = cfg.window.saturating_sub(w.started_at.elapsed());
		(w.count, remaining, reset_in)
	};

	if count > cfg.max {
		let body = format!("{{\"error\":\"{}\"}}", cfg.message);
		let resp = Response::builder()
			.status(cfg.status)
			.header("RateLimit-Limit", cfg.max.to_string())
			.header("RateLimit-Remaining", "0")
			.header("RateLimit-Reset", reset_in.as_secs().to_string())
			.header(http::header::CONTENT_TYPE, "application/json")
			.body(Full::new(Bytes::from(body)))
			.expect("rate limit response is well-formed");
		return ControlFlow::Break(resp);
	}

	ctx.request_headers.insert(
		"ratelimit-limit",
		http::HeaderValue::from_str(&cfg.max.to_string()).expect("numeric header value"),
	);
	ctx.request_headers.insert(
		"ratelimit-remaining",
		http::HeaderValue::from_str(&remaining.to_string()).expect("numeric header value"),
	);
	ControlFlow::Continue(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;

	fn cfg(max: u64) -> Arc<RateLimitConfig> {
		Arc::new(RateLimitConfig {
			window: Duration::from_secs(1),
			max,
			status: http::StatusCode::TOO_MANY_REQUESTS,
			message: "slow down".into(),
		})
	}

	#[test]
	fn blocks_after_exceeding_max_within_window() {
		let state = super::super::MiddlewareState::new();
		let c = cfg(2);
		let mut headers = http::HeaderMap::new();
		let method = http::Method::GET;
		let mut ctx = MiddlewareCtx {
			method: &method,
			path: "/",
			client_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
			host: "h".into(),
			user_agent: "ua".into(),
			request_headers: &mut headers,
			buffered_body: None,
		};
		assert!(matches!(run(&state, &c, &mut ctx), ControlFlow::Continue(())));
		assert!(matches!(run(&state, &c, &mut ctx), ControlFlow::Continue(())));
		assert!(matches!(run(&state, &c, &mut ctx), ControlFlow::Break(_)));
	}
}
