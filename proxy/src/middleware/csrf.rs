//! CSRF token extraction. Pass-through, it never rejects a request, only
//! canonicalizes whichever token name the client used into one header the origin can rely on.

use std::ops::ControlFlow;

use http::HeaderValue;

use super::{MiddlewareCtx, ShortCircuit};

const TOKEN_NAMES: &[&str] = &[
	"x-csrf-token",
	"csrf-token",
	"xsrf-token",
	"x-xsrf-token",
	"_csrf",
	"authjs.csrf-token",
	"next-auth.csrf-token",
	"XSRF-TOKEN",
];

pub const CANONICAL_HEADER: &str = "x-csrf-token-canonical";

pub fn run(ctx: &mut MiddlewareCtx<'_>) -> ControlFlow<ShortCircuit> {
	if let Some(token) = find_token(ctx) {
		if let Ok(value) = HeaderValue::from_str(&token) {
			ctx.request_headers.insert(CANONICAL_HEADER, value);
		}
	}
	ControlFlow::Continue(())
}

fn find_token(ctx: &MiddlewareCtx<'_>) -> Option<String> {
	for name in TOKEN_NAMES {
		if let Some(v) = ctx.request_headers.get(name.to_lowercase()) {
			if let Ok(s) = v.to_str() {
				return Some(s.to_string());
			}
		}
	}
	if let Some(cookie) = ctx.request_headers.get(http::header::COOKIE) {
		if let Ok(s) = cookie.to_str() {
			for pair in s.split(';') {
				let mut parts = pair.trim().splitn(2, '=');
				let key = parts.next().unwrap_or("").trim();
				if TOKEN_NAMES.iter().any(|n| n.eq_ignore_ascii_case(key)) {
					if let Some(value) = parts.next() {
						return Some(value.trim().to_string());
					}
				}
			}
		}
	}
	if let Some(body) = ctx.buffered_body {
		if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) {
			if let Some(obj) = json.as_object() {
				for name in TOKEN_NAMES {
					if let Some(v) = obj.get(*name).and_then(|v| v.as_str()) {
						return Some(v.to_string());
					}
				}
			}
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use http::{HeaderMap, Method};
	use std::net::{IpAddr, Ipv4Addr};

	fn ctx<'a>(headers: &'a mut HeaderMap, method: &'a Method) -> MiddlewareCtx<'a> {
		MiddlewareCtx {
			method,
			path: "/",
			client_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
			host: "example.com".into(),
			user_agent: "test".into(),
			request_headers: headers,
			buffered_body: None,
		}
	}

	#[test]
	fn copies_header_token_into_canonical_header() {
		let mut headers = HeaderMap::new();
		headers.insert("xsrf-token", HeaderValue::from_static("abc123"));
		let method = Method::GET;
		let mut c = ctx(&mut headers, &method);
		assert!(matches!(run(&mut c), ControlFlow::Continue(())));
		assert_eq!(
			c.request_headers.get(CANONICAL_HEADER).unwrap().to_str().unwrap(),
			"abc123"
		);
	}

	#[test]
	fn never_short_circuits_without_a_token() {
		let mut headers = HeaderMap::new();
		let method = Method::GET;
		let mut c = ctx(&mut headers, &method);
		assert!(matches!(run(&mut c), ControlFlow::Continue(())));
		assert!(c.request_headers.get(CANONICAL_HEADER).is_none());
	}
}
