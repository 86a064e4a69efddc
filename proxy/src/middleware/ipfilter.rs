//! IP allow/deny, per-IP rate limiting, and the captcha blackhole gate.

use std::collections::HashMap;
use std::net::IpAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;
use parking_lot::Mutex;

use crate::config::{CaptchaOptions, IpFilterConfig};

use super::{MiddlewareCtx, ShortCircuit};

const CAPTCHA_PAGE: &str = "Verify you are human before continuing.";

struct Window {
	started_at: Instant,
	count: u64,
	failed_attempts: u64,
}

/// Sliding 1-second per-IP request counters.
pub struct PerIpCounters {
	windows: Mutex<HashMap<IpAddr, Window>>,
}

impl PerIpCounters {
	pub fn new() -> Arc<Self> {
		Arc::new(PerIpCounters {
			windows: Mutex::new(HashMap::new()),
		})
	}

	/// Returns `(current_count, failed_attempts)` after recording one hit for `ip`.
	fn hit(&self, ip: IpAddr) -> (u64, u64) {
		let mut windows = self.windows.lock();
		let w = windows.entry(ip).or_insert_with(|| Window {
			started_at: Instant::now(),
			count: 0,
			failed_attempts: 0,
		});
		if w.started_at.elapsed() >= Duration::from_secs(1) {
			w.started_at = Instant::now();
			w.count = 0;
		}
		w.count += 1;
		(w.count, w.failed_attempts)
	}

	fn record_failure(&self, ip: IpAddr) -> u64 {
		let mut windows = self.windows.lock();
		let w = windows.entry(ip).or_insert_with(|| Window {
			started_at: Instant::now(),
			count: 0,
			failed_attempts: 0,
		});
		w.failed_attempts += 1;
		w.failed_attempts
	}
}

fn forbidden(body: &str) -> ShortCircuit {
	Response::builder()
		.status(StatusCode::FORBIDDEN)
		.header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Full::new(Bytes::from(body.to_string())))
		.expect("static forbidden response is well-formed")
}

pub fn run(
	state: &super::MiddlewareState,
	captcha: Option<&CaptchaOptions>,
	filter: Option<&Arc<IpFilterConfig>>,
	ctx: &mut MiddlewareCtx<'_>,
) -> ControlFlow<ShortCircuit> {
	let ip = normalize_ip(ctx.client_ip);
	let captcha_active = captcha.map(|c| c.enabled).unwrap_or(false);

	if captcha_active && state.blackhole.is_banned(ip) {
		return ControlFlow::Break(forbidden(CAPTCHA_PAGE));
	}

	if let Some(f) = filter {
		if !f.whitelist.is_empty() && !f.whitelist.iter().any(|net| net.contains(&ip)) {
			return ControlFlow::Break(forbidden("Access denied."));
		}
		if f.blacklist.iter().any(|net| net.contains(&ip)) {
			return ControlFlow::Break(forbidden("Access denied."));
		}

		if let Some(max_rps) = f.max_requests_per_second {
			let (count, _) = state.ip_counters.hit(ip);
			if count > max_rps {
				if captcha_active {
					return ControlFlow::Break(forbidden(CAPTCHA_PAGE));
				}
				let failed = state.ip_counters.record_failure(ip);
				if let Some(max_failed) = f.max_failed_attempts {
					if failed >= max_failed {
						let ban = captcha.map(|c| c.ban_duration).unwrap_or(Duration::from_secs(3600));
						state.blackhole.ban(ip, ban);
						return ControlFlow::Break(forbidden("Access denied."));
					}
				}
			}
		}
	}

	ControlFlow::Continue(())
}

/// Collapses an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) to its IPv4 form.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
	match ip {
		IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
		other => other,
	}
}

/// Client IP precedence: the first token of `X-Forwarded-For`, then
/// `X-Real-IP`, falling back to the accepted socket's peer address.
pub fn resolve_client_ip(headers: &http::HeaderMap, socket_ip: IpAddr) -> IpAddr {
	if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
		if let Some(first) = xff.split(',').next() {
			if let Ok(ip) = first.trim().parse::<IpAddr>() {
				return normalize_ip(ip);
			}
		}
	}
	if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
		if let Ok(ip) = real_ip.trim().parse::<IpAddr>() {
			return normalize_ip(ip);
		}
	}
	normalize_ip(socket_ip)
}

#[cfg(test)]
mod resolve_tests {
	use super::*;
	use std::net::Ipv4Addr;

	#[test]
	fn prefers_first_forwarded_for_token() {
		let mut headers = http::HeaderMap::new();
		headers.insert("x-forwarded-for", http::HeaderValue::from_static("203.0.113.5, 10.0.0.1"));
		let socket = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
		assert_eq!(resolve_client_ip(&headers, socket), "203.0.113.5".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn falls_back_to_real_ip_then_socket() {
		let mut headers = http::HeaderMap::new();
		headers.insert("x-real-ip", http::HeaderValue::from_static("198.51.100.9"));
		let socket = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
		assert_eq!(resolve_client_ip(&headers, socket), "198.51.100.9".parse::<IpAddr>().unwrap());

		let empty = http::HeaderMap::new();
		assert_eq!(resolve_client_ip(&empty, socket), socket);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;

	#[test]
	fn normalize_collapses_mapped_ipv6() {
		let mapped: IpAddr = "::ffff:192.0.2.1".parse().unwrap();
		assert_eq!(normalize_ip(mapped), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
	}

	#[test]
	fn whitelist_rejects_unknown_ip() {
		let cfg = IpFilterConfig {
			whitelist: vec!["10.0.0.0/8".parse().unwrap()],
			blacklist: vec![],
			max_requests_per_second: None,
			max_failed_attempts: None,
		};
		let state = super::super::MiddlewareState::new();
		let mut headers = http::HeaderMap::new();
		let method = http::Method::GET;
		let mut ctx = MiddlewareCtx {
			method: &method,
			path: "/",
			client_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
			host: "example.com".into(),
			user_agent: "test".into(),
			request_headers: &mut headers,
			buffered_body: None,
		};
		let out = run(&state, None, Some(&Arc::new(cfg)), &mut ctx);
		assert!(matches!(out, ControlFlow::Break(_)));
	}

	#[test]
	fn per_ip_counter_tracks_failures() {
		let counters = PerIpCounters::new();
		let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
		for _ in 0..3 {
			counters.hit(ip);
		}
		let failed = counters.record_failure(ip);
		assert_eq!(failed, 1);
	}
}
