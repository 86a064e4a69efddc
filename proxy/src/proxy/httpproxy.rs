//! Per-request forwarding: route match, middleware chain, outbound call, redirect rewriting,
//! retry-on-connection-error, and WebSocket tunneling. One [`RequestContext`] is built
//! once per accepted connection and shared by every request `hyper` drives on it.

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use headers::HeaderMapExt;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::config::{ConfigStore, Listener, Location, RouteTarget};
use crate::metrics::{Direction, ListenerCounters, MeteredBody, header_block_len};
use crate::middleware::{self, MiddlewareCtx};
use crate::upstream::UpstreamManager;

use super::ProxyError;

pub type RespBody = BoxBody<Bytes, hyper::Error>;
type ReqBody = BoxBody<Bytes, hyper::Error>;

type InsecureConnector = hyper_rustls::HttpsConnector<HttpConnector>;

/// Pooled keep-alive client used for every upstream leg. Skipping TLS verification on the upstream
/// side is deliberate, to tolerate self-signed internal origins; HTTP/1.1 only, keep-alive. The
/// request body is boxed so a retry can rebuild a fresh (empty) body without needing `Incoming`,
/// which cannot be cloned, to survive past the first attempt.
static UPSTREAM_CLIENT: Lazy<Client<InsecureConnector, ReqBody>> = Lazy::new(|| {
	let mut http = HttpConnector::new();
	http.enforce_http(false);
	http.set_nodelay(true);
	let connector = hyper_rustls::HttpsConnectorBuilder::new()
		.with_tls_config(crate::tls::insecure_client_config())
		.https_or_http()
		.enable_http1()
		.wrap_connector(http);
	Client::builder(TokioExecutor::new()).build(connector)
});

static HOP_BY_HOP: [HeaderName; 8] = [
	header::CONNECTION,
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
];

fn empty_body() -> ReqBody {
	Empty::<Bytes>::new().map_err(|never: Infallible| match never {}).boxed()
}

/// Everything a request needs to know about the connection it arrived on. Built once per
/// accepted socket and cheaply cloned (every field is an `Arc`) for each request `hyper` drives.
#[derive(Clone)]
pub struct RequestContext {
	pub config: Arc<ConfigStore>,
	pub listener_name: Arc<str>,
	pub tls_enabled: bool,
	pub client_ip: IpAddr,
	pub upstreams: Arc<UpstreamManager>,
	pub middleware: Arc<crate::middleware::MiddlewareState>,
	pub counters: Arc<ListenerCounters>,
}

pub async fn handle(ctx: RequestContext, req: Request<Incoming>) -> Response<RespBody> {
	use std::sync::atomic::Ordering;
	ctx.counters.total_reqs.fetch_add(1, Ordering::Relaxed);
	ctx.counters.active_conns.fetch_add(1, Ordering::Relaxed);
	let resp = handle_inner(&ctx, req).await.unwrap_or_else(|e| {
		warn!(listener = %ctx.listener_name, error = %e, "request failed");
		e.into_response().map(|b| b.boxed())
	});
	ctx.counters.active_conns.fetch_sub(1, Ordering::Relaxed);
	resp
}

async fn handle_inner(ctx: &RequestContext, req: Request<Incoming>) -> Result<Response<RespBody>, ProxyError> {
	let snapshot = ctx.config.current();
	let listener = snapshot
		.listeners
		.iter()
		.find(|l| l.name == ctx.listener_name)
		.ok_or_else(|| ProxyError::Internal("listener removed mid-request".into()))?;

	let path = req.uri().path().to_string();
	let location = best_match(&listener.locations, &path)
		.ok_or_else(|| ProxyError::InvalidRequest(format!("no location matches {path}")))?;

	let host = header_str(req.headers(), header::HOST);
	let user_agent = header_str(req.headers(), header::USER_AGENT);
	let query = req.uri().query().map(|q| format!("?{q}")).unwrap_or_default();
	let method = req.method().clone();
	let replayable = matches!(method, Method::GET | Method::HEAD | Method::OPTIONS);
	let request_line = format!("{method} {path}{query} HTTP/1.1");

	let (mut parts, body) = req.into_parts();
	let client_ip = middleware::resolve_client_ip(&parts.headers, ctx.client_ip);
	let mut mw_ctx = MiddlewareCtx {
		method: &method,
		path: &path,
		client_ip,
		host: host.clone(),
		user_agent,
		request_headers: &mut parts.headers,
		buffered_body: None,
	};
	if let std::ops::ControlFlow::Break(short_circuit) =
		middleware::run(&ctx.middleware, snapshot.captcha.as_ref(), listener, location, &mut mw_ctx)
	{
		return Ok(short_circuit.map(|b| b.boxed()));
	}
	ctx.counters
		.bytes_in
		.fetch_add(header_block_len(&request_line, &parts.headers), std::sync::atomic::Ordering::Relaxed);

	match &location.target {
		RouteTarget::Static { status, body, content_type } => Ok(static_response(*status, body, content_type.as_deref())),
		RouteTarget::ProxyPass(url) => {
			let target = rewrite_target(url, &path, &query);
			let metered = MeteredBody::new(body, ctx.counters.clone(), Direction::In).boxed();
			let outbound = build_request(parts, metered, &target);
			forward(ctx, listener, location, outbound, &host, false, false).await
		},
		RouteTarget::Upstream(pool) => {
			let body: ReqBody = if replayable {
				empty_body()
			} else {
				MeteredBody::new(body, ctx.counters.clone(), Direction::In).boxed()
			};
			let origin = ctx
				.upstreams
				.resolve(pool, Some(client_ip))
				.map_err(|e| ProxyError::UpstreamUnavailable(e.to_string()))?;
			let backup = ctx.upstreams.is_backup(pool);
			let target = rewrite_target(&origin, &path, &query);
			let outbound = build_request(parts.clone(), body, &target);
			let result = forward(ctx, listener, location, outbound, &host, true, backup).await;
			match result {
				Err(e) if e.is_retryable() && replayable => {
					ctx.upstreams.check_urgent(pool, &origin);
					match ctx.upstreams.resolve(pool, Some(client_ip)) {
						Ok(next) if next != origin => {
							let backup = ctx.upstreams.is_backup(pool);
							let target = rewrite_target(&next, &path, &query);
							let outbound = build_request(parts, empty_body(), &target);
							let outcome = forward(ctx, listener, location, outbound, &host, true, backup).await;
							if outcome.is_ok() {
								ctx.upstreams.note_complete(pool, &next);
							}
							outcome
						},
						_ => Err(e),
					}
				},
				other => {
					if other.is_ok() {
						ctx.upstreams.note_complete(pool, &origin);
					}
					other
				},
			}
		},
	}
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> String {
	headers.get(name).and_then(|h| h.to_str().ok()).unwrap_or_default().to_string()
}

fn build_request(parts: http::request::Parts, body: ReqBody, target: &Uri) -> Request<ReqBody> {
	let mut req = Request::from_parts(parts, body);
	*req.uri_mut() = target.clone();
	req
}

fn best_match<'a>(locations: &'a [Location], path: &str) -> Option<&'a Location> {
	locations
		.iter()
		.filter(|l| path.starts_with(l.path_prefix.as_str()))
		.max_by_key(|l| l.path_prefix.len())
}

fn static_response(status: u16, body: &str, content_type: Option<&str>) -> Response<RespBody> {
	let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
	Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, content_type.unwrap_or("text/plain"))
		.body(Full::new(Bytes::from(body.to_string())).map_err(|never: Infallible| match never {}).boxed())
		.unwrap_or_else(|_| Response::new(empty_body()))
}

/// Builds the outbound URI: `target_base` is the selected origin (`scheme://host:port`, no
/// path); the inbound path/query is appended unchanged so locations proxy transparently.
fn rewrite_target(target_base: &str, path: &str, query: &str) -> Uri {
	format!("{}{}{}", target_base.trim_end_matches('/'), path, query)
		.parse()
		.unwrap_or_else(|_| Uri::from_static("/"))
}

async fn forward(
	ctx: &RequestContext,
	listener: &Listener,
	location: &Location,
	mut req: Request<ReqBody>,
	original_host: &str,
	retryable_on_connect_error: bool,
	backup: bool,
) -> Result<Response<RespBody>, ProxyError> {
	let upgrade = strip_hop_by_hop(&mut req);

	let timeout = location.timeout.unwrap_or(Duration::from_secs(30));
	let outcome = tokio::time::timeout(timeout, UPSTREAM_CLIENT.request(req))
		.await
		.map_err(|_| ProxyError::Timeout)?
		.map_err(|e| classify_connect_error(e, retryable_on_connect_error))?;

	if upgrade.is_some() && outcome.status() == StatusCode::SWITCHING_PROTOCOLS {
		return handle_upgrade(ctx, upgrade, outcome).await;
	}

	let (mut parts, body) = outcome.into_parts();
	if !(backup && mark_backup_external_redirect(&mut parts, original_host)) {
		rewrite_redirect(&mut parts, original_host, listener.tls.is_some());
	}
	rewrite_set_cookie(&mut parts.headers);
	apply_cache_headers(&mut parts.headers);

	let status_line = format!("HTTP/1.1 {} {}", parts.status.as_u16(), parts.status.canonical_reason().unwrap_or(""));
	ctx.counters
		.bytes_out
		.fetch_add(header_block_len(&status_line, &parts.headers), std::sync::atomic::Ordering::Relaxed);

	let body: RespBody = if location.buffering {
		let collected = body.collect().await.map_err(|e| ProxyError::UpstreamProtocolError(e.to_string()))?.to_bytes();
		ctx.counters.bytes_out.fetch_add(collected.len() as u64, std::sync::atomic::Ordering::Relaxed);
		Full::new(collected).map_err(|never: Infallible| match never {}).boxed()
	} else {
		MeteredBody::new(body, ctx.counters.clone(), Direction::Out).boxed()
	};

	Ok(Response::from_parts(parts, body))
}

/// A connect-phase failure (the only kind eligible for retry) is reported as
/// `UpstreamConnError` only when this call is itself allowed to be retried; otherwise it is
/// surfaced as a protocol error so the caller's `is_retryable` check short-circuits to a single
/// 502 instead of attempting a replay against a body that has already been consumed.
fn classify_connect_error(e: hyper_util::client::legacy::Error, retryable_on_connect_error: bool) -> ProxyError {
	if retryable_on_connect_error && e.is_connect() {
		ProxyError::UpstreamConnError(e.to_string())
	} else {
		ProxyError::UpstreamProtocolError(e.to_string())
	}
}

/// Spec §4.6 "Redirect rewriting". `had_tls` is the listener's own scheme, used to rebuild
/// relative `Location`s and to pick the scheme when rewriting an internal-origin external
/// redirect. The backup-and-external-host carve-out is applied by the caller before this runs,
/// via the `X-Proxy-Backup-Redirect` header set on that path instead of a rewrite.
fn rewrite_redirect(parts: &mut http::response::Parts, original_host: &str, had_tls: bool) {
	if !parts.status.is_redirection() {
		return;
	}
	let Some(location) = parts.headers.get(header::LOCATION).and_then(|h| h.to_str().ok().map(str::to_string)) else {
		return;
	};
	let scheme = if had_tls { "https" } else { "http" };
	let original_host_only = original_host.split(':').next().unwrap_or(original_host);

	let parsed = location.parse::<Uri>().ok();
	let is_relative = parsed.as_ref().map(|u| u.authority().is_none()).unwrap_or(true);

	if is_relative {
		let rebuilt = format!("{scheme}://{original_host}{location}");
		if let Ok(v) = HeaderValue::from_str(&rebuilt) {
			parts.headers.insert(header::LOCATION, v);
		}
		return;
	}
	let Some(u) = parsed else { return };
	let same_host = u.authority().map(|a| a.host() == original_host_only).unwrap_or(false);
	if same_host {
		return;
	}
	let path_and_query = u.path_and_query().map(|p| p.as_str()).unwrap_or("/");
	let rebuilt = format!("{scheme}://{original_host}{path_and_query}");
	if let Ok(v) = HeaderValue::from_str(&rebuilt) {
		parts.headers.insert(header::LOCATION, v);
	}
}

/// Marks an external redirect from a backup origin instead of rewriting it: the
/// backup may be a public fallback whose own host must be reached directly.
fn mark_backup_external_redirect(parts: &mut http::response::Parts, original_host: &str) -> bool {
	if !parts.status.is_redirection() {
		return false;
	}
	let Some(location) = parts.headers.get(header::LOCATION).and_then(|h| h.to_str().ok()) else {
		return false;
	};
	let Ok(parsed) = location.parse::<Uri>() else { return false };
	let original_host_only = original_host.split(':').next().unwrap_or(original_host);
	let external = parsed.authority().map(|a| a.host() != original_host_only).unwrap_or(false);
	if external {
		if let Ok(v) = HeaderValue::from_str("true") {
			parts.headers.insert(HeaderName::from_static("x-proxy-backup-redirect"), v);
		}
	}
	external
}

fn rewrite_set_cookie(headers: &mut HeaderMap) {
	let rewritten: Vec<HeaderValue> = headers
		.get_all(header::SET_COOKIE)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.map(rewrite_one_cookie)
		.filter_map(|s| HeaderValue::from_str(&s).ok())
		.collect();
	if rewritten.is_empty() {
		return;
	}
	headers.remove(header::SET_COOKIE);
	for v in rewritten {
		headers.append(header::SET_COOKIE, v);
	}
}

fn rewrite_one_cookie(cookie: &str) -> String {
	cookie
		.split(';')
		.map(|attr| {
			let trimmed = attr.trim();
			if trimmed.to_ascii_lowercase().starts_with("domain=") {
				"Domain=".to_string()
			} else if trimmed.to_ascii_lowercase().starts_with("path=") {
				"Path=/".to_string()
			} else {
				attr.to_string()
			}
		})
		.collect::<Vec<_>>()
		.join(";")
}

fn apply_cache_headers(headers: &mut HeaderMap) {
	if headers.contains_key(header::CACHE_CONTROL) {
		return;
	}
	headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store, no-cache, must-revalidate"));
	headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
	headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
}

fn strip_hop_by_hop(req: &mut Request<ReqBody>) -> Option<OnUpgrade> {
	let wants_upgrade = req
		.headers()
		.typed_get::<headers::Connection>()
		.map(|c| c.contains(header::UPGRADE))
		.unwrap_or(false);
	let upgrade_header = req.headers().get(header::UPGRADE).cloned();
	for h in HOP_BY_HOP.iter() {
		req.headers_mut().remove(h);
	}
	if wants_upgrade {
		if let Some(v) = upgrade_header {
			req.headers_mut().typed_insert(headers::Connection::upgrade());
			req.headers_mut().insert(header::UPGRADE, v);
		}
		return req.extensions_mut().remove::<OnUpgrade>();
	}
	None
}

/// Tunnels bytes bidirectionally between the client and origin after a successful WebSocket
/// handshake (a WebSocket upgrade): picks a target once, no retry after the handshake.
async fn handle_upgrade(
	ctx: &RequestContext,
	client_upgrade: Option<OnUpgrade>,
	origin_resp: Response<Incoming>,
) -> Result<Response<RespBody>, ProxyError> {
	let Some(client_upgrade) = client_upgrade else {
		return Err(ProxyError::UpstreamProtocolError("origin upgraded but client did not request one".into()));
	};
	let (parts, origin_body) = origin_resp.into_parts();
	let origin_upgrade = hyper::upgrade::on(Response::from_parts(parts.clone(), origin_body));
	let counters = ctx.counters.clone();
	tokio::spawn(async move {
		let client_io = match client_upgrade.await {
			Ok(io) => io,
			Err(e) => {
				warn!(error = %e, "client upgrade failed");
				return;
			},
		};
		let origin_io = match origin_upgrade.await {
			Ok(io) => io,
			Err(e) => {
				warn!(error = %e, "origin upgrade failed");
				return;
			},
		};
		let mut client_io = TokioIo::new(client_io);
		let mut origin_io = TokioIo::new(origin_io);
		match tokio::io::copy_bidirectional(&mut client_io, &mut origin_io).await {
			Ok((to_origin, to_client)) => {
				counters.bytes_in.fetch_add(to_origin, std::sync::atomic::Ordering::Relaxed);
				counters.bytes_out.fetch_add(to_client, std::sync::atomic::Ordering::Relaxed);
				debug!(to_origin, to_client, "websocket tunnel closed");
			},
			Err(e) => debug!(error = %e, "websocket tunnel error"),
		}
	});
	Ok(Response::from_parts(parts, empty_body()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn longest_prefix_wins() {
		let locations = vec![
			Location {
				path_prefix: "/".into(),
				target: RouteTarget::ProxyPass("http://a".into()),
				timeout: None,
				buffering: false,
				middleware: Default::default(),
			},
			Location {
				path_prefix: "/api".into(),
				target: RouteTarget::ProxyPass("http://b".into()),
				timeout: None,
				buffering: false,
				middleware: Default::default(),
			},
		];
		let found = best_match(&locations, "/api/widgets").unwrap();
		assert_eq!(found.path_prefix, "/api");
	}

	#[test]
	fn relative_redirect_is_rebuilt_against_original_host() {
		let mut parts = Response::builder()
			.status(302)
			.header(header::LOCATION, "/login")
			.body(())
			.unwrap()
			.into_parts()
			.0;
		rewrite_redirect(&mut parts, "app.example.com", true);
		assert_eq!(parts.headers.get(header::LOCATION).unwrap(), "https://app.example.com/login");
	}

	#[test]
	fn same_host_redirect_is_untouched() {
		let mut parts = Response::builder()
			.status(302)
			.header(header::LOCATION, "http://app.example.com/next")
			.body(())
			.unwrap()
			.into_parts()
			.0;
		rewrite_redirect(&mut parts, "app.example.com", false);
		assert_eq!(parts.headers.get(header::LOCATION).unwrap(), "http://app.example.com/next");
	}

	#[test]
	fn backup_external_redirect_is_marked_not_rewritten() {
		let mut parts = Response::builder()
			.status(302)
			.header(header::LOCATION, "https://public-fallback.example/start")
			.body(())
			.unwrap()
			.into_parts()
			.0;
		let marked = mark_backup_external_redirect(&mut parts, "app.example.com");
		assert!(marked);
		assert_eq!(parts.headers.get("x-proxy-backup-redirect").unwrap(), "true");
		assert_eq!(
			parts.headers.get(header::LOCATION).unwrap(),
			"https://public-fallback.example/start"
		);
	}

	#[test]
	fn set_cookie_domain_and_path_are_stripped() {
		let mut headers = HeaderMap::new();
		headers.insert(header::SET_COOKIE, "sid=abc; Domain=.example.com; Path=/app; Secure".parse().unwrap());
		rewrite_set_cookie(&mut headers);
		let rewritten = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
		assert!(rewritten.contains("Domain=;") || rewritten.ends_with("Domain="));
		assert!(rewritten.contains("Path=/;") || rewritten.contains("Path=/"));
	}
}
