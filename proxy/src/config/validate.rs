//! Turns a [`ConfigDocument`] into a validated, defaulted [`Snapshot`]. Validation
//! failures are collected into a single [`ValidationErrors`]; the caller decides whether to keep
//! the prior snapshot (always, for a reload) or exit (startup).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use edge_core::telemetry::LogLevel;
use tracing::warn;

use super::defaults::{default_weight, merge_health_check};
use super::error::{ConfigError, ValidationError, ValidationErrors};
use super::model::*;
use super::snapshot::*;

pub fn build(doc: ConfigDocument, next_version: u64) -> Result<Snapshot, ConfigError> {
	let mut errors = Vec::new();

	if doc.upstreams.is_empty() {
		errors.push(ValidationError::NoUpstreams);
	}
	if doc.servers.is_empty() {
		errors.push(ValidationError::NoListeners);
	}

	let mut upstreams = HashMap::new();
	let mut seen_origin_urls: HashSet<String> = HashSet::new();

	for (index, raw) in doc.upstreams.iter().enumerate() {
		let Some(name) = raw.name.clone().filter(|n| !n.is_empty()) else {
			errors.push(ValidationError::UpstreamMissingName { index });
			continue;
		};
		if raw.servers.is_empty() {
			errors.push(ValidationError::UpstreamEmpty { pool: name.clone() });
			continue;
		}

		let policy = match raw.balancer.as_deref() {
			Some("least-connections") | Some("least_connections") => Policy::LeastConnections,
			Some("ip-hash") | Some("ip_hash") => Policy::IpHash,
			Some("round-robin") | Some("round_robin") | None => Policy::RoundRobin,
			Some(other) => {
				warn!(pool = %name, policy = other, "unknown balancer policy, defaulting to round-robin");
				Policy::RoundRobin
			},
		};

		let mut origins = Vec::new();
		for o in &raw.servers {
			let Some(url) = o.url.as_deref() else {
				errors.push(ValidationError::OriginUrlInvalid {
					pool: name.clone(),
					url: String::new(),
				});
				continue;
			};
			let normalized = match normalize_origin_url(url) {
				Some(u) => u,
				None => {
					errors.push(ValidationError::OriginUrlInvalid {
						pool: name.clone(),
						url: url.to_string(),
					});
					continue;
				},
			};
			if !seen_origin_urls.insert(normalized.clone()) {
				warn!(pool = %name, url = %normalized, "duplicate origin url across pools, dropping (first wins)");
				continue;
			}
			origins.push(Arc::new(Origin {
				url: normalized.into(),
				weight: default_weight(o.weight),
				backup: o.backup,
				manual_down: o.down,
				health_check: merge_health_check(o.health_check.as_ref(), raw.health_check.as_ref()),
			}));
		}

		let pool = Arc::new(UpstreamPool {
			name: name.clone().into(),
			policy,
			origins,
			health_check: merge_health_check(None, raw.health_check.as_ref()),
		});
		upstreams.insert(Arc::<str>::from(name), pool);
	}

	let mut listeners = Vec::new();
	for (index, raw) in doc.servers.iter().enumerate() {
		let Some(name) = raw.name.clone().filter(|n| !n.is_empty()) else {
			errors.push(ValidationError::ListenerMissingName { index });
			continue;
		};
		let Some(listen_port) = raw.listen else {
			errors.push(ValidationError::ListenerMissingName { index });
			continue;
		};

		let mut locations = Vec::new();
		for (lindex, rl) in raw.locations.iter().enumerate() {
			let Some(path_prefix) = rl.path.clone().filter(|p| !p.is_empty()) else {
				errors.push(ValidationError::LocationMissingPath {
					listener: name.clone(),
					index: lindex,
				});
				continue;
			};

			let mut targets = 0;
			if rl.upstream.is_some() {
				targets += 1;
			}
			if rl.proxy_pass.is_some() {
				targets += 1;
			}
			if rl.r#return.is_some() {
				targets += 1;
			}
			if targets != 1 {
				errors.push(ValidationError::LocationTargetCount {
					listener: name.clone(),
					path: path_prefix.clone(),
					found: targets,
				});
				continue;
			}

			let target = if let Some(u) = &rl.upstream {
				if !upstreams.contains_key(u.as_str()) {
					errors.push(ValidationError::UnknownUpstream {
						listener: name.clone(),
						path: path_prefix.clone(),
						upstream: u.clone(),
					});
					continue;
				}
				RouteTarget::Upstream(u.as_str().into())
			} else if let Some(p) = &rl.proxy_pass {
				RouteTarget::ProxyPass(p.as_str().into())
			} else {
				let r = rl.r#return.as_ref().expect("checked above");
				RouteTarget::Static {
					status: r.status,
					body: r.body.clone(),
					content_type: r.content_type.clone(),
				}
			};

			locations.push(Location {
				path_prefix,
				target,
				timeout: rl.proxy_timeout.map(Duration::from_millis),
				buffering: rl.proxy_buffering,
				middleware: build_middleware_overrides(
					rl.headers.as_ref(),
					rl.rate_limit.as_ref(),
					rl.ip_filter.as_ref(),
					rl.csrf,
				),
			});
		}

		// Longest-prefix match requires locations sorted so earlier entries never shadow a more
		// specific one; sort once here so `resolve_location` can linear-scan in order.
		locations.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));

		let tls = match build_tls_ref(&name, raw.ssl.as_ref(), doc.ssl.as_ref(), &mut errors) {
			Some(t) => Some(Arc::new(t)),
			None => None,
		};

		listeners.push(Arc::new(Listener {
			name: name.clone().into(),
			listen_port,
			server_names: raw.server_name.clone(),
			locations,
			tls,
			middleware: build_middleware_overrides(
				raw.headers.as_ref(),
				raw.rate_limit.as_ref(),
				raw.ip_filter.as_ref(),
				raw.csrf,
			),
		}));
	}

	if !errors.is_empty() {
		return Err(ConfigError::Validation(ValidationErrors(errors)));
	}

	let logging = LoggingOptions {
		level: doc
			.logging
			.as_ref()
			.and_then(|l| l.level.as_deref())
			.and_then(parse_log_level)
			.unwrap_or_default(),
		file: doc
			.logging
			.as_ref()
			.and_then(|l| l.file.clone())
			.map(Into::into),
	};

	let monitoring = MonitoringOptions {
		enabled: doc.monitoring.as_ref().map(|m| m.enabled).unwrap_or(false),
		ws_port: doc.monitoring.as_ref().and_then(|m| m.ws_port),
		push_interval: doc
			.monitoring
			.as_ref()
			.and_then(|m| m.push_interval)
			.map(Duration::from_millis)
			.unwrap_or(Duration::from_secs(5)),
		metrics: doc.monitoring.as_ref().map(|m| m.metrics.clone()).unwrap_or_default(),
	};

	let captcha = doc.captcha.as_ref().map(|c| CaptchaOptions {
		enabled: c.enabled,
		max_attempts: c.max_attempts.unwrap_or(5),
		timeout: Duration::from_secs(c.timeout.unwrap_or(120)),
		blackhole_threshold: c.blackhole_threshold.unwrap_or(10),
		ban_duration: Duration::from_secs(c.ban_duration.unwrap_or(3600)),
		google: c.google.as_ref().map(|g| GoogleCaptcha {
			site_key: g.site_key.clone(),
			secret_key: g.secret_key.clone(),
			min_score: g.min_score,
		}),
	});

	Ok(Snapshot {
		version: next_version,
		listeners,
		upstreams,
		logging,
		monitoring,
		captcha,
	})
}

fn build_middleware_overrides(
	headers: Option<&RawHeaders>,
	rate_limit: Option<&RawRateLimit>,
	ip_filter: Option<&RawIpFilter>,
	csrf: bool,
) -> MiddlewareOverrides {
	MiddlewareOverrides {
		headers: headers.map(|h| {
			Arc::new(HeaderRewrite {
				add: h.add.clone(),
				remove: h.remove.clone(),
			})
		}),
		rate_limit: rate_limit.map(|r| {
			Arc::new(RateLimitConfig {
				window: Duration::from_millis(r.window_ms),
				max: r.max,
				status: http::StatusCode::from_u16(r.status.unwrap_or(429))
					.unwrap_or(http::StatusCode::TOO_MANY_REQUESTS),
				message: r.message.clone().unwrap_or_else(|| "Too Many Requests".to_string()),
			})
		}),
		ip_filter: ip_filter.map(|f| {
			Arc::new(IpFilterConfig {
				whitelist: f.whitelist.iter().filter_map(|s| parse_cidr(s)).collect(),
				blacklist: f.blacklist.iter().filter_map(|s| parse_cidr(s)).collect(),
				max_requests_per_second: f.max_requests_per_second,
				max_failed_attempts: f.max_failed_attempts,
			})
		}),
		csrf_enabled: csrf,
	}
}

fn parse_cidr(s: &str) -> Option<ipnet::IpNet> {
	if let Ok(net) = s.parse::<ipnet::IpNet>() {
		return Some(net);
	}
	s.parse::<std::net::IpAddr>().ok().map(ipnet::IpNet::from)
}

fn build_tls_ref(
	listener: &str,
	ssl: Option<&RawSsl>,
	global_ssl: Option<&RawSsl>,
	errors: &mut Vec<ValidationError>,
) -> Option<TlsRef> {
	let ssl = ssl.or(global_ssl)?;
	if !ssl.enabled {
		return None;
	}
	let cert = ssl.cert.clone().or_else(|| global_ssl.and_then(|g| g.cert.clone()));
	let key = ssl.key.clone().or_else(|| global_ssl.and_then(|g| g.key.clone()));
	let (Some(cert), Some(key)) = (cert, key) else {
		errors.push(ValidationError::TlsFile {
			listener: listener.to_string(),
			what: "cert/key",
			detail: "ssl.enabled is true but cert or key path is missing".to_string(),
		});
		return None;
	};
	let cert_path = std::path::PathBuf::from(&cert);
	let key_path = std::path::PathBuf::from(&key);
	if !cert_path.exists() {
		errors.push(ValidationError::TlsFile {
			listener: listener.to_string(),
			what: "cert",
			detail: format!("{cert} does not exist"),
		});
	}
	if !key_path.exists() {
		errors.push(ValidationError::TlsFile {
			listener: listener.to_string(),
			what: "key",
			detail: format!("{key} does not exist"),
		});
	}
	if let Err(e) = crate::tls::verify_key_pair(&cert_path, &key_path) {
		errors.push(ValidationError::TlsKeyMismatch {
			listener: listener.to_string(),
			detail: e.to_string(),
		});
	}
	if let Some(dh) = ssl.dhparam.as_deref() {
		if !std::path::Path::new(dh).exists() {
			errors.push(ValidationError::TlsFile {
				listener: listener.to_string(),
				what: "dhparam",
				detail: format!("{dh} does not exist"),
			});
		}
	}
	if let Some(ca) = ssl.client_certificate.as_deref() {
		if !std::path::Path::new(ca).exists() {
			errors.push(ValidationError::TlsFile {
				listener: listener.to_string(),
				what: "client_certificate",
				detail: format!("{ca} does not exist"),
			});
		}
	}
	Some(TlsRef {
		cert: cert_path,
		key: key_path,
		http2: ssl.http2,
		ciphers: ssl.ciphers.clone(),
		protocols: ssl.protocols.clone().unwrap_or_default(),
		dhparam: ssl.dhparam.clone().map(Into::into),
		client_certificate: ssl.client_certificate.clone().map(Into::into),
		session_timeout: Duration::from_secs(ssl.session_timeout.unwrap_or(300)),
		session_tickets: ssl.session_tickets,
	})
}

fn parse_log_level(s: &str) -> Option<LogLevel> {
	match s {
		"error" => Some(LogLevel::Error),
		"warn" => Some(LogLevel::Warn),
		"info" => Some(LogLevel::Info),
		"http" => Some(LogLevel::Http),
		"verbose" => Some(LogLevel::Verbose),
		"debug" => Some(LogLevel::Debug),
		"silly" => Some(LogLevel::Silly),
		_ => None,
	}
}

/// Strips a trailing slash and rewrites `localhost`/`::1` to `127.0.0.1`.
/// Applied once here, at storage time, since origin identity and dedup both depend on it.
pub fn normalize_origin_url(url: &str) -> Option<String> {
	let trimmed = url.trim_end_matches('/');
	let parsed = url::Url::parse(trimmed).ok()?;
	if parsed.scheme().is_empty() || parsed.host_str().is_none() {
		return None;
	}
	let host = parsed.host_str().unwrap();
	let host = if host.eq_ignore_ascii_case("localhost") || host == "::1" || host == "[::1]" {
		"127.0.0.1"
	} else {
		host
	};
	let mut out = format!("{}://{}", parsed.scheme(), host);
	if let Some(port) = parsed.port() {
		out.push(':');
		out.push_str(&port.to_string());
	}
	Some(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn normalizes_localhost_and_trailing_slash() {
		assert_eq!(
			normalize_origin_url("http://localhost:8080/").as_deref(),
			Some("http://127.0.0.1:8080")
		);
		assert_eq!(
			normalize_origin_url("https://[::1]:443").as_deref(),
			Some("https://127.0.0.1:443")
		);
	}

	#[test]
	fn rejects_unparseable_url() {
		assert_eq!(normalize_origin_url("not a url"), None);
		assert_eq!(normalize_origin_url("/just/a/path"), None);
	}

	fn minimal_doc() -> ConfigDocument {
		ConfigDocument {
			upstreams: vec![RawUpstream {
				name: Some("api".into()),
				balancer: None,
				servers: vec![RawOrigin {
					url: Some("http://127.0.0.1:9000".into()),
					weight: None,
					backup: false,
					down: false,
					health_check: None,
				}],
				health_check: None,
			}],
			servers: vec![RawServer {
				name: Some("main".into()),
				listen: Some(8080),
				server_name: None,
				locations: vec![RawLocation {
					path: Some("/".into()),
					upstream: Some("api".into()),
					proxy_pass: None,
					r#return: None,
					proxy_timeout: None,
					proxy_buffering: false,
					headers: None,
					rate_limit: None,
					ip_filter: None,
					csrf: true,
				}],
				headers: None,
				rate_limit: None,
				ip_filter: None,
				csrf: true,
				ssl: None,
			}],
			ssl: None,
			logging: None,
			monitoring: None,
			captcha: None,
		}
	}

	#[test]
	fn minimal_document_validates() {
		let snap = build(minimal_doc(), 1).expect("should validate");
		assert_eq!(snap.listeners.len(), 1);
		assert_eq!(snap.upstreams.len(), 1);
	}

	#[test]
	fn rejects_unknown_upstream_reference() {
		let mut doc = minimal_doc();
		doc.servers[0].locations[0].upstream = Some("missing".into());
		let err = build(doc, 1).unwrap_err();
		assert!(err.to_string().contains("unknown upstream"));
	}

	#[test]
	fn rejects_zero_or_multiple_routing_targets() {
		let mut doc = minimal_doc();
		doc.servers[0].locations[0].proxy_pass = Some("http://example.com".into());
		// now both upstream and proxy_pass are set: two targets
		let err = build(doc, 1).unwrap_err();
		assert!(err.to_string().contains("exactly one"));
	}

	#[test]
	fn requires_at_least_one_pool_and_listener() {
		let mut doc = minimal_doc();
		doc.upstreams.clear();
		doc.servers.clear();
		let err = build(doc, 1).unwrap_err();
		let msg = err.to_string();
		assert!(msg.contains("upstream pool"));
		assert!(msg.contains("listener"));
	}
}
