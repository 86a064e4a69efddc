//! Listener supervisor and request-forwarding engine. `gateway` owns the bound
//! sockets and reacts to snapshot swaps; `httpproxy` implements the per-request forwarding
//! contract, redirect rewriting, retry-on-connection-error, and WebSocket tunneling.

mod gateway;
mod httpproxy;

pub use gateway::Gateway;

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;
use thiserror::Error;

/// Abstract error kinds, mapped to the response each one produces. Distinct from
/// `config::ConfigError`/`tls::Error`, which are startup/reload-time failures; these are
/// per-request outcomes.
#[derive(Debug, Error)]
pub enum ProxyError {
	#[error("no eligible upstream for pool '{0}'")]
	UpstreamUnavailable(String),
	#[error("upstream connection error: {0}")]
	UpstreamConnError(String),
	#[error("upstream protocol error: {0}")]
	UpstreamProtocolError(String),
	#[error("request timed out")]
	Timeout,
	#[error("malformed request: {0}")]
	InvalidRequest(String),
	#[error("internal error: {0}")]
	Internal(String),
}

impl ProxyError {
	/// Only a connection-level failure while reading
	/// response headers qualifies for the urgent-recheck-then-retry path.
	pub fn is_retryable(&self) -> bool {
		matches!(self, ProxyError::UpstreamConnError(_))
	}

	pub fn into_response(self) -> Response<Full<Bytes>> {
		let status = match &self {
			ProxyError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::UpstreamConnError(_) => StatusCode::BAD_GATEWAY,
			ProxyError::UpstreamProtocolError(_) => StatusCode::BAD_GATEWAY,
			ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
			ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		let message = self.to_string();
		let body = format!("{{\"error\":\"{}\",\"message\":{:?}}}", status.canonical_reason().unwrap_or(""), message);
		Response::builder()
			.status(status)
			.header(http::header::CONTENT_TYPE, "application/json")
			.body(Full::new(Bytes::from(body)))
			.unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
	}
}
