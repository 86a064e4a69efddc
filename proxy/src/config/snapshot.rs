//! Validated, defaulted runtime configuration. Everything downstream
//! of `config::validate::build` is constructed from a `Snapshot`; it is immutable and versioned,
//! held behind an `arc_swap::ArcSwap` by `ConfigStore` so a reload never blocks an in-flight
//! request against the previous one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use edge_core::telemetry::LogLevel;

#[derive(Debug)]
pub struct Snapshot {
	pub version: u64,
	pub listeners: Vec<Arc<Listener>>,
	pub upstreams: HashMap<Arc<str>, Arc<UpstreamPool>>,
	pub logging: LoggingOptions,
	pub monitoring: MonitoringOptions,
	pub captcha: Option<CaptchaOptions>,
}

impl Snapshot {
	pub fn upstream(&self, name: &str) -> Option<&Arc<UpstreamPool>> {
		self.upstreams.get(name)
	}
}

#[derive(Debug)]
pub struct Listener {
	pub name: Arc<str>,
	pub listen_port: u16,
	pub server_names: Option<Vec<String>>,
	pub locations: Vec<Location>,
	pub tls: Option<Arc<TlsRef>>,
	pub middleware: MiddlewareOverrides,
}

#[derive(Debug, Clone)]
pub struct TlsRef {
	pub cert: PathBuf,
	pub key: PathBuf,
	pub http2: bool,
	pub ciphers: Option<String>,
	pub protocols: Vec<String>,
	pub dhparam: Option<PathBuf>,
	pub client_certificate: Option<PathBuf>,
	pub session_timeout: Duration,
	pub session_tickets: bool,
}

#[derive(Debug)]
pub struct Location {
	pub path_prefix: String,
	pub target: RouteTarget,
	pub timeout: Option<Duration>,
	pub buffering: bool,
	pub middleware: MiddlewareOverrides,
}

#[derive(Debug, Clone)]
pub enum RouteTarget {
	Upstream(Arc<str>),
	ProxyPass(Arc<str>),
	Static {
		status: u16,
		body: String,
		content_type: Option<String>,
	},
}

#[derive(Debug, Default, Clone)]
pub struct MiddlewareOverrides {
	pub headers: Option<Arc<HeaderRewrite>>,
	pub rate_limit: Option<Arc<RateLimitConfig>>,
	pub ip_filter: Option<Arc<IpFilterConfig>>,
	pub csrf_enabled: bool,
}

impl MiddlewareOverrides {
	pub fn new_enabled() -> Self {
		MiddlewareOverrides {
			csrf_enabled: true,
			..Default::default()
		}
	}
}

#[derive(Debug, Default)]
pub struct HeaderRewrite {
	pub add: HashMap<String, String>,
	pub remove: Vec<String>,
}

#[derive(Debug)]
pub struct RateLimitConfig {
	pub window: Duration,
	pub max: u64,
	pub status: http::StatusCode,
	pub message: String,
}

#[derive(Debug, Default)]
pub struct IpFilterConfig {
	pub whitelist: Vec<ipnet::IpNet>,
	pub blacklist: Vec<ipnet::IpNet>,
	pub max_requests_per_second: Option<u64>,
	pub max_failed_attempts: Option<u64>,
}

#[derive(Debug)]
pub struct UpstreamPool {
	pub name: Arc<str>,
	pub policy: Policy,
	pub origins: Vec<Arc<Origin>>,
	pub health_check: HealthCheckConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
	RoundRobin,
	LeastConnections,
	IpHash,
}

#[derive(Debug)]
pub struct Origin {
	/// Normalized `scheme://host:port`; identity of the origin within a snapshot.
	pub url: Arc<str>,
	pub weight: u32,
	pub backup: bool,
	pub manual_down: bool,
	pub health_check: HealthCheckConfig,
}

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
	pub kind: ProbeKind,
	pub path: Option<String>,
	pub interval: Duration,
	pub timeout: Duration,
	pub retries: u32,
	pub expected_status: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
	Http,
	Tcp,
}

impl Default for HealthCheckConfig {
	fn default() -> Self {
		HealthCheckConfig {
			kind: ProbeKind::Http,
			path: None,
			interval: Duration::from_secs(5),
			timeout: Duration::from_secs(5),
			retries: 3,
			expected_status: vec![200, 201, 202, 301, 302, 303, 307, 308, 404],
		}
	}
}

#[derive(Debug, Clone)]
pub struct LoggingOptions {
	pub level: LogLevel,
	pub file: Option<PathBuf>,
}

impl Default for LoggingOptions {
	fn default() -> Self {
		LoggingOptions {
			level: LogLevel::default(),
			file: None,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct MonitoringOptions {
	pub enabled: bool,
	pub ws_port: Option<u16>,
	pub push_interval: Duration,
	pub metrics: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CaptchaOptions {
	pub enabled: bool,
	pub max_attempts: u32,
	pub timeout: Duration,
	pub blackhole_threshold: u32,
	pub ban_duration: Duration,
	pub google: Option<GoogleCaptcha>,
}

#[derive(Debug, Clone)]
pub struct GoogleCaptcha {
	pub site_key: String,
	pub secret_key: String,
	pub min_score: Option<f32>,
}
