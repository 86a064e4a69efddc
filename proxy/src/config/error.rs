use thiserror::Error;

/// Fatal at startup, logged-and-ignored on reload.
#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	Read {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("invalid JSON at {pointer}: {source}")]
	Parse {
		pointer: String,
		#[source]
		source: serde_json::Error,
	},
	#[error("{0}")]
	Validation(#[from] ValidationErrors),
}

/// Every problem found during a single validation pass, collected rather than short-circuited on
/// the first error, but the reload outcome is still all-or-nothing.
#[derive(Debug, Error)]
#[error("{} validation error(s): {}", .0.len(), .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
pub struct ValidationErrors(pub Vec<ValidationError>);

#[derive(Debug, Error, Clone)]
pub enum ValidationError {
	#[error("at least one upstream pool is required")]
	NoUpstreams,
	#[error("at least one listener is required")]
	NoListeners,
	#[error("upstream pool at index {index} is missing a name")]
	UpstreamMissingName { index: usize },
	#[error("upstream pool '{pool}' has no origins")]
	UpstreamEmpty { pool: String },
	#[error("upstream pool '{pool}' origin '{url}' is not a parseable absolute URL")]
	OriginUrlInvalid { pool: String, url: String },
	#[error("listener at index {index} is missing a name")]
	ListenerMissingName { index: usize },
	#[error("listener '{listener}' location at index {index} is missing a path")]
	LocationMissingPath { listener: String, index: usize },
	#[error(
		"listener '{listener}' location '{path}' must set exactly one of upstream, proxy_pass, or return (found {found})"
	)]
	LocationTargetCount {
		listener: String,
		path: String,
		found: usize,
	},
	#[error("listener '{listener}' location '{path}' references unknown upstream '{upstream}'")]
	UnknownUpstream {
		listener: String,
		path: String,
		upstream: String,
	},
	#[error("listener '{listener}' enables TLS but {what} is missing or unreadable: {detail}")]
	TlsFile {
		listener: String,
		what: &'static str,
		detail: String,
	},
	#[error("listener '{listener}' certificate and key do not form a matching pair: {detail}")]
	TlsKeyMismatch { listener: String, detail: String },
}
