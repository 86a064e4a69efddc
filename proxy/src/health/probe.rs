use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use hyper::Request;
use once_cell::sync::Lazy;
use tracing::trace;

use crate::config::{HealthCheckConfig, ProbeKind};
use crate::tls::insecure_client_config;

type ProbeConnector = hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>;

static PROBE_CLIENT: Lazy<hyper_util::client::legacy::Client<ProbeConnector, Empty<Bytes>>> = Lazy::new(|| {
	let connector = hyper_rustls::HttpsConnectorBuilder::new()
		.with_tls_config(insecure_client_config())
		.https_or_http()
		.enable_http1()
		.build();
	hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector)
});

pub async fn run(url: &str, cfg: &HealthCheckConfig) -> bool {
	match cfg.kind {
		ProbeKind::Http => http_probe(url, cfg).await,
		ProbeKind::Tcp => tcp_probe(url, cfg.timeout).await,
	}
}

async fn http_probe(url: &str, cfg: &HealthCheckConfig) -> bool {
	let Ok(parsed) = url::Url::parse(url) else {
		return false;
	};
	let path = cfg.path.clone().unwrap_or_else(|| {
		let p = parsed.path();
		if p.is_empty() { "/".to_string() } else { p.to_string() }
	});
	let port = parsed
		.port_or_known_default()
		.unwrap_or(if parsed.scheme() == "https" { 443 } else { 80 });
	let target = format!(
		"{}://{}:{}{}",
		parsed.scheme(),
		parsed.host_str().unwrap_or("127.0.0.1"),
		port,
		path
	);
	let Ok(req) = Request::builder()
		.method("GET")
		.uri(&target)
		.header("Accept", "*/*")
		.header("Connection", "close")
		.header("User-Agent", "HealthChecker/1.0")
		.body(Empty::<Bytes>::new())
	else {
		return false;
	};

	let outcome = tokio::time::timeout(cfg.timeout, PROBE_CLIENT.request(req)).await;
	match outcome {
		Ok(Ok(resp)) => {
			let status = resp.status();
			if status.is_redirection() {
				return true;
			}
			cfg.expected_status.contains(&status.as_u16())
		},
		Ok(Err(e)) => {
			trace!(url, error = %e, "http probe request error");
			false
		},
		Err(_) => {
			trace!(url, "http probe timed out");
			false
		},
	}
}

async fn tcp_probe(url: &str, timeout: Duration) -> bool {
	let Ok(parsed) = url::Url::parse(url) else {
		return false;
	};
	let Some(host) = parsed.host_str() else {
		return false;
	};
	let port = parsed
		.port_or_known_default()
		.unwrap_or(if parsed.scheme() == "https" { 443 } else { 80 });
	let addr = format!("{host}:{port}");
	match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await {
		Ok(Ok(stream)) => {
			drop(stream);
			true
		},
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration as StdDuration;

	#[tokio::test]
	async fn tcp_probe_fails_fast_against_closed_port() {
		let ok = tcp_probe("tcp://127.0.0.1:1", StdDuration::from_millis(200)).await;
		assert!(!ok);
	}
}
