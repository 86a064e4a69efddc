//! Raw, directly-deserialized mirror of the on-disk JSON config document. Every field is
//! optional except what the schema marks required; defaulting and validation happen in
//! `super::defaults` / `super::validate`, never here.

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigDocument {
	pub upstreams: Vec<RawUpstream>,
	pub servers: Vec<RawServer>,
	pub ssl: Option<RawSsl>,
	pub logging: Option<RawLogging>,
	pub monitoring: Option<RawMonitoring>,
	pub captcha: Option<RawCaptcha>,
}

#[derive(Debug, Deserialize)]
pub struct RawUpstream {
	pub name: Option<String>,
	pub balancer: Option<String>,
	#[serde(default)]
	pub servers: Vec<RawOrigin>,
	pub health_check: Option<RawHealthCheck>,
}

#[derive(Debug, Deserialize)]
pub struct RawOrigin {
	pub url: Option<String>,
	pub weight: Option<u32>,
	#[serde(default)]
	pub backup: bool,
	#[serde(default)]
	pub down: bool,
	pub health_check: Option<RawHealthCheck>,
}

#[derive(Debug, Deserialize)]
pub struct RawHealthCheck {
	#[serde(rename = "type")]
	pub kind: Option<String>,
	pub path: Option<String>,
	pub interval: Option<u64>,
	pub timeout: Option<u64>,
	pub retries: Option<u32>,
	pub expected_status: Option<Vec<u16>>,
}

#[derive(Debug, Deserialize)]
pub struct RawServer {
	pub name: Option<String>,
	pub listen: Option<u16>,
	pub server_name: Option<Vec<String>>,
	#[serde(default)]
	pub locations: Vec<RawLocation>,
	pub headers: Option<RawHeaders>,
	pub rate_limit: Option<RawRateLimit>,
	pub ip_filter: Option<RawIpFilter>,
	#[serde(default = "default_true")]
	pub csrf: bool,
	pub ssl: Option<RawSsl>,
}

#[derive(Debug, Deserialize)]
pub struct RawLocation {
	pub path: Option<String>,
	pub upstream: Option<String>,
	pub proxy_pass: Option<String>,
	#[serde(rename = "return")]
	pub r#return: Option<RawStaticResponse>,
	pub proxy_timeout: Option<u64>,
	#[serde(default)]
	pub proxy_buffering: bool,
	pub headers: Option<RawHeaders>,
	pub rate_limit: Option<RawRateLimit>,
	pub ip_filter: Option<RawIpFilter>,
	#[serde(default = "default_true")]
	pub csrf: bool,
}

#[derive(Debug, Deserialize)]
pub struct RawStaticResponse {
	pub status: u16,
	#[serde(default)]
	pub body: String,
	pub content_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawHeaders {
	pub add: HashMap<String, String>,
	pub remove: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawRateLimit {
	pub window_ms: u64,
	pub max: u64,
	pub status: Option<u16>,
	pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawIpFilter {
	pub whitelist: Vec<String>,
	pub blacklist: Vec<String>,
	pub max_requests_per_second: Option<u64>,
	pub max_failed_attempts: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RawSsl {
	#[serde(default)]
	pub enabled: bool,
	pub key: Option<String>,
	pub cert: Option<String>,
	#[serde(default)]
	pub http2: bool,
	pub ciphers: Option<String>,
	pub protocols: Option<Vec<String>>,
	pub dhparam: Option<String>,
	pub client_certificate: Option<String>,
	pub session_timeout: Option<u64>,
	#[serde(default)]
	pub session_tickets: bool,
}

#[derive(Debug, Deserialize)]
pub struct RawLogging {
	pub level: Option<String>,
	pub file: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawMonitoring {
	#[serde(default)]
	pub enabled: bool,
	pub ws_port: Option<u16>,
	pub push_interval: Option<u64>,
	#[serde(default)]
	pub metrics: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawCaptcha {
	#[serde(default)]
	pub enabled: bool,
	pub max_attempts: Option<u32>,
	pub timeout: Option<u64>,
	pub blackhole_threshold: Option<u32>,
	pub ban_duration: Option<u64>,
	pub google: Option<RawGoogleCaptcha>,
}

#[derive(Debug, Deserialize)]
pub struct RawGoogleCaptcha {
	pub site_key: String,
	pub secret_key: String,
	pub min_score: Option<f32>,
}

fn default_true() -> bool {
	true
}
