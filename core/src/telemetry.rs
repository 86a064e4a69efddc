use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::{Registry, fmt, reload};

/// Process start time, used for "time since start" readiness/log fields.
pub static APPLICATION_START_TIME: OnceLock<Instant> = OnceLock::new();

/// Returns the process start time, initializing it on first call if `setup_logging` hasn't run yet.
pub fn start_time() -> Instant {
	*APPLICATION_START_TIME.get_or_init(Instant::now)
}

type ReloadHandle = reload::Handle<EnvFilter, Registry>;
static FILTER_HANDLE: OnceLock<ReloadHandle> = OnceLock::new();

/// The Node-style level names accepted by `logging.level` in the config document, mapped onto
/// `tracing`'s five levels (which has no `http`/`verbose`/`silly` distinction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
	Error,
	Warn,
	Info,
	Http,
	Verbose,
	Debug,
	Silly,
}

impl LogLevel {
	pub fn as_level_filter(self) -> LevelFilter {
		match self {
			LogLevel::Error => LevelFilter::ERROR,
			LogLevel::Warn => LevelFilter::WARN,
			LogLevel::Info | LogLevel::Http => LevelFilter::INFO,
			LogLevel::Verbose | LogLevel::Debug => LevelFilter::DEBUG,
			LogLevel::Silly => LevelFilter::TRACE,
		}
	}
}

impl Default for LogLevel {
	fn default() -> Self {
		LogLevel::Info
	}
}

/// A guard that must be held for the lifetime of the process to keep the non-blocking log writer
/// alive; dropping it flushes and stops the background writer thread.
pub struct LoggingGuard {
	_stdout: tracing_appender::non_blocking::WorkerGuard,
	_file: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initializes the global `tracing` subscriber: an `EnvFilter` seeded from `initial_level`
/// (further adjustable at runtime via [`set_level`] when the config document's `logging.level`
/// changes on reload) writing to stdout, plus an optional rolling file appender when
/// `logging.file` is set.
pub fn setup_logging(initial_level: LogLevel, file: Option<PathBuf>) -> LoggingGuard {
	let _ = start_time();

	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(initial_level.as_level_filter().to_string()));
	let (filter, handle) = reload::Layer::new(filter);
	let _ = FILTER_HANDLE.set(handle);

	let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
	let stdout_layer = fmt::layer().with_target(true).with_writer(stdout_writer);

	let (file_layer, file_guard) = match file {
		Some(path) => {
			let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
			let file_name = path
				.file_name()
				.map(|n| n.to_string_lossy().into_owned())
				.unwrap_or_else(|| "proxy.log".to_string());
			let appender =
				tracing_appender::rolling::daily(dir.unwrap_or_else(|| std::path::Path::new(".")), file_name);
			let (writer, guard) = tracing_appender::non_blocking(appender);
			(
				Some(fmt::layer().with_ansi(false).with_target(true).with_writer(writer)),
				Some(guard),
			)
		},
		None => (None, None),
	};

	use tracing_subscriber::layer::SubscriberExt;
	tracing_subscriber::registry()
		.with(filter)
		.with(stdout_layer)
		.with(file_layer)
		.init();

	LoggingGuard {
		_stdout: stdout_guard,
		_file: file_guard,
	}
}

/// Applies a new `logging.level` at runtime, e.g. after a config reload. A no-op (with a debug
/// log) if the filter was overridden by `RUST_LOG` at startup.
pub fn set_level(level: LogLevel) {
	if let Some(handle) = FILTER_HANDLE.get() {
		let _ = handle.modify(|f| *f = EnvFilter::new(level.as_level_filter().to_string()));
	}
}
