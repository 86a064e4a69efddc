//! Fixed five-stage request pipeline. Each stage is a small function rather than a
//! generic tower-style stack, matching the teacher's preference for an explicit, sequential
//! pipeline over a composable middleware trait when the stage list is closed and short.

pub mod captcha;
pub mod csrf;
pub mod headers;
pub mod ipfilter;
pub mod ratelimit;

use std::net::IpAddr;
use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, Response};
use http_body_util::Full;

use crate::config::{CaptchaOptions, Listener, Location};

pub use captcha::Blackhole;
pub use ipfilter::{PerIpCounters, resolve_client_ip};
pub use ratelimit::RateLimiters;

pub type ShortCircuit = Response<Full<Bytes>>;

/// Per-request state threaded through the chain. `request_headers` is mutated in place (CSRF
/// canonicalization, header rewrite); everything else is read-only context gathered once by the
/// caller before the chain runs.
pub struct MiddlewareCtx<'a> {
	pub method: &'a Method,
	pub path: &'a str,
	pub client_ip: IpAddr,
	pub host: String,
	pub user_agent: String,
	pub request_headers: &'a mut HeaderMap,
	/// CSRF/body scanning only looks here; the chain never buffers a streaming body itself (CSRF
	/// extraction is pass-through and must never block the request).
	pub buffered_body: Option<&'a [u8]>,
}

/// Shared, process-lifetime middleware state that must persist across config reloads: the
/// blackhole table, per-IP counters, and rate limiter state.
pub struct MiddlewareState {
	pub blackhole: Arc<Blackhole>,
	pub ip_counters: Arc<PerIpCounters>,
	pub rate_limiters: Arc<RateLimiters>,
}

impl MiddlewareState {
	pub fn new() -> Arc<Self> {
		Arc::new(MiddlewareState {
			blackhole: Blackhole::new(),
			ip_counters: PerIpCounters::new(),
			rate_limiters: RateLimiters::new(),
		})
	}
}

/// Runs the five fixed stages in order for one request, given the listener- and location-level
/// overrides (location takes precedence over listener).
pub fn run(
	state: &MiddlewareState,
	captcha: Option<&CaptchaOptions>,
	listener: &Listener,
	location: &Location,
	ctx: &mut MiddlewareCtx<'_>,
) -> ControlFlow<ShortCircuit> {
	csrf::run(ctx)?;

	let ip_filter = location.middleware.ip_filter.as_ref().or(listener.middleware.ip_filter.as_ref());
	ipfilter::run(state, captcha, ip_filter, ctx)?;

	let rate_limit = location.middleware.rate_limit.as_ref().or(listener.middleware.rate_limit.as_ref());
	if let Some(rl) = rate_limit {
		ratelimit::run(state, rl, ctx)?;
	}

	let header_rewrite = location.middleware.headers.as_ref().or(listener.middleware.headers.as_ref());
	if let Some(hr) = header_rewrite {
		headers::rewrite_request(hr, ctx);
	}

	ControlFlow::Continue(())
}
