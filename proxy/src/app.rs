//! Wires the independently-testable pieces (`ConfigStore`, `UpstreamManager`, `MetricsRegistry`,
//! `MiddlewareState`, `Gateway`) into one running process. Grounded on the teacher's
//! `app::run`/`Bound`/`wait_termination` split: `run` does all the fallible setup and returns a
//! handle whose `wait_termination` blocks until shutdown, so `main` stays a thin CLI shell.

use std::path::PathBuf;
use std::sync::Arc;

use edge_core::prelude::*;
use edge_core::{readiness, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ConfigStore;
use crate::metrics::MetricsRegistry;
use crate::middleware::MiddlewareState;
use crate::proxy::Gateway;
use crate::upstream::UpstreamManager;

/// Loads and validates the config document at `path`, then starts every background task (config
/// watcher, upstream reload wiring, listener supervisor) and returns once they are all running.
/// A `config_invalid` or `bind_failed` error here is fatal: the caller should exit nonzero.
pub async fn run(path: PathBuf) -> anyhow::Result<Bound> {
	let store = ConfigStore::load(&path)
		.await
		.map_err(|e| anyhow::anyhow!("failed to load config from {}: {e}", path.display()))?;

	let snapshot = store.current();
	let log_guard = edge_core::telemetry::setup_logging(snapshot.logging.level, snapshot.logging.file.clone());
	info!(path = %path.display(), version = snapshot.version, "config loaded");

	let ready = readiness::Ready::new();
	let config_task = ready.register_task("config watcher");
	let proxy_task = ready.register_task("listener supervisor");

	let metrics = MetricsRegistry::new();
	metrics.sync_listeners(snapshot.listeners.iter().map(|l| l.name.clone()));

	let upstreams = UpstreamManager::new(&snapshot);
	spawn_upstream_reload(store.clone(), upstreams.clone());

	let middleware = MiddlewareState::new();

	let (reload_tx, reload_rx) = mpsc::channel::<()>(4);
	spawn_sighup_bridge(reload_tx);
	{
		let store = store.clone();
		let watch_shutdown = signal::Shutdown::new();
		tokio::spawn(async move {
			store.watch(reload_rx, watch_shutdown).await;
		});
	}
	drop(config_task);

	let gateway = Gateway::new(store.clone(), upstreams.clone(), metrics.clone(), middleware.clone());
	let gateway_shutdown = signal::Shutdown::new();
	let gw = gateway.clone();
	let gateway_handle = tokio::spawn(async move {
		gw.run(gateway_shutdown).await;
	});
	drop(proxy_task);

	spawn_metrics_tick(metrics.clone(), snapshot.monitoring.push_interval);

	let shutdown = signal::Shutdown::new();
	info!("ready to accept connections");
	Ok(Bound {
		shutdown,
		gateway_handle,
		metrics,
		store,
		_log_guard: log_guard,
	})
}

/// Parses and validates `path` without starting any listener (CLI `--validate-only`).
pub async fn validate_only(path: PathBuf) -> anyhow::Result<()> {
	ConfigStore::validate_only(&path)
		.await
		.map_err(|e| anyhow::anyhow!("{e}"))
}

pub struct Bound {
	pub shutdown: signal::Shutdown,
	gateway_handle: JoinHandle<()>,
	pub metrics: Arc<MetricsRegistry>,
	pub store: Arc<ConfigStore>,
	/// Keeps the non-blocking log writer(s) alive until the process shuts down; dropping this
	/// early would flush and stop the background writer thread mid-run.
	_log_guard: edge_core::telemetry::LoggingGuard,
}

impl Bound {
	/// Blocks until `SIGTERM`/`SIGINT` (or an explicit [`signal::ShutdownTrigger`]) fires, then
	/// waits for the listener supervisor to finish its own bounded graceful drain of in-flight
	/// connections (it reacts to the same OS signal directly, independently of this handle).
	pub async fn wait_termination(self) -> anyhow::Result<()> {
		self.shutdown.wait().await;
		match self.gateway_handle.await {
			Ok(()) => Ok(()),
			Err(e) if e.is_cancelled() => Ok(()),
			Err(e) => Err(anyhow::anyhow!("listener supervisor task panicked: {e}")),
		}
	}
}

/// Rebuilds upstream pool/balancer/health-checker state on every successful reload: consumers
/// hold an `Arc<PoolState>` they replace atomically, so in-flight requests keep using the old
/// pool until they finish. The health checker's own member diffing means a pool whose origin set
/// is unchanged keeps its interval state across this rebuild.
fn spawn_upstream_reload(store: Arc<ConfigStore>, upstreams: Arc<UpstreamManager>) {
	let mut changed = store.subscribe();
	tokio::spawn(async move {
		while changed.changed().await.is_ok() {
			upstreams.apply_snapshot(&store.current());
		}
	});
}

/// `SIGHUP` is reserved for an explicit reload, equivalent to a filesystem change event.
fn spawn_sighup_bridge(reload_tx: mpsc::Sender<()>) {
	tokio::spawn(async move {
		loop {
			signal::watch_sighup().await;
			let _ = reload_tx.send(()).await;
		}
	});
}

/// Periodic trend-buffer sampling, independent of any scrape/push from the monitoring backend.
fn spawn_metrics_tick(metrics: Arc<MetricsRegistry>, interval: std::time::Duration) {
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(interval.max(std::time::Duration::from_millis(100)));
		loop {
			tick.tick().await;
			metrics.tick();
		}
	});
}
