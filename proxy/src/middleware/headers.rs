//! Add/remove header rewriting with `${remote_addr}`/`${host}`/`${user_agent}`
//! placeholder substitution in added values.

use http::{HeaderName, HeaderValue};

use crate::config::HeaderRewrite;

use super::MiddlewareCtx;

pub fn rewrite_request(rewrite: &HeaderRewrite, ctx: &mut MiddlewareCtx<'_>) {
	for name in &rewrite.remove {
		if let Ok(hn) = HeaderName::try_from(name.as_str()) {
			ctx.request_headers.remove(hn);
		}
	}
	for (name, template) in &rewrite.add {
		let Ok(hn) = HeaderName::try_from(name.as_str()) else {
			continue;
		};
		let value = substitute(template, ctx);
		if let Ok(hv) = HeaderValue::from_str(&value) {
			ctx.request_headers.insert(hn, hv);
		}
	}
}

fn substitute(template: &str, ctx: &MiddlewareCtx<'_>) -> String {
	template
		.replace("${remote_addr}", &ctx.client_ip.to_string())
		.replace("${host}", &ctx.host)
		.replace("${user_agent}", &ctx.user_agent)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;
	use std::net::{IpAddr, Ipv4Addr};

	#[test]
	fn substitutes_known_placeholders() {
		let mut headers = http::HeaderMap::new();
		let method = http::Method::GET;
		let mut ctx = MiddlewareCtx {
			method: &method,
			path: "/",
			client_ip: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
			host: "example.com".into(),
			user_agent: "curl/8".into(),
			request_headers: &mut headers,
			buffered_body: None,
		};
		let mut add = HashMap::new();
		add.insert("x-forwarded-for".to_string(), "${remote_addr}".to_string());
		let rewrite = HeaderRewrite { add, remove: vec![] };
		rewrite_request(&rewrite, &mut ctx);
		assert_eq!(
			ctx.request_headers.get("x-forwarded-for").unwrap().to_str().unwrap(),
			"1.2.3.4"
		);
	}

	#[test]
	fn removes_named_headers() {
		let mut headers = http::HeaderMap::new();
		headers.insert("x-internal", http::HeaderValue::from_static("secret"));
		let method = http::Method::GET;
		let mut ctx = MiddlewareCtx {
			method: &method,
			path: "/",
			client_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
			host: "h".into(),
			user_agent: "ua".into(),
			request_headers: &mut headers,
			buffered_body: None,
		};
		let rewrite = HeaderRewrite {
			add: HashMap::new(),
			remove: vec!["x-internal".to_string()],
		};
		rewrite_request(&rewrite, &mut ctx);
		assert!(ctx.request_headers.get("x-internal").is_none());
	}
}
