//! Loads a config document from disk, validates it into a [`Snapshot`], and republishes new
//! snapshots behind an [`ArcSwap`] as the file changes on disk.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use super::error::ConfigError;
use super::model::ConfigDocument;
use super::snapshot::Snapshot;
use super::validate;

/// Config file changes are coalesced over this window before a reload is attempted, so an editor
/// doing several writes in a row (truncate, then write, then rename) only triggers one reload.
const DEBOUNCE: Duration = Duration::from_millis(200);

pub struct ConfigStore {
	path: PathBuf,
	current: ArcSwap<Snapshot>,
	version: AtomicU64,
	changed_tx: watch::Sender<u64>,
}

impl ConfigStore {
	/// Loads and validates `path`, failing hard if the document does not validate at startup.
	pub async fn load(path: impl AsRef<Path>) -> Result<Arc<Self>, ConfigError> {
		let path = path.as_ref().to_path_buf();
		let snapshot = read_and_validate(&path, 1).await?;
		let (changed_tx, _) = watch::channel(1);
		Ok(Arc::new(ConfigStore {
			path,
			current: ArcSwap::from_pointee(snapshot),
			version: AtomicU64::new(1),
			changed_tx,
		}))
	}

	pub fn current(&self) -> Arc<Snapshot> {
		self.current.load_full()
	}

	/// Notifies on every successful reload with the new version number, so the listener
	/// supervisor can reconcile bound sockets against the new snapshot.
	pub fn subscribe(&self) -> watch::Receiver<u64> {
		self.changed_tx.subscribe()
	}

	/// Validates a document only (used by `--validate-only`), never touching the live snapshot.
	pub async fn validate_only(path: impl AsRef<Path>) -> Result<(), ConfigError> {
		read_and_validate(path.as_ref(), 1).await.map(|_| ())
	}

	/// Watches the config file for changes and reloads on each debounced event. A reload that
	/// fails validation is logged and the prior snapshot keeps serving traffic.
	pub async fn watch(self: Arc<Self>, mut reload_rx: mpsc::Receiver<()>, shutdown: edge_core::signal::Shutdown) {
		let (tx, mut rx) = mpsc::channel::<()>(16);
		let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
			if res.is_ok() {
				let _ = tx.try_send(());
			}
		}) {
			Ok(w) => w,
			Err(e) => {
				error!(error = %e, "failed to start config file watcher, live reload disabled");
				return;
			},
		};
		if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
			if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
				error!(error = %e, path = %parent.display(), "failed to watch config directory");
				return;
			}
		}

		let mut shutdown_fut = Box::pin(shutdown.wait());
		loop {
			tokio::select! {
				_ = &mut shutdown_fut => break,
				got = rx.recv() => {
					if got.is_none() {
						break;
					}
					// Drain any further events that arrive within the debounce window.
					loop {
						tokio::select! {
							_ = tokio::time::sleep(DEBOUNCE) => break,
							more = rx.recv() => if more.is_none() { break },
						}
					}
					self.reload().await;
				}
				got = reload_rx.recv() => {
					if got.is_none() {
						continue;
					}
					self.reload().await;
				}
			}
		}
	}

	async fn reload(&self) {
		let next_version = self.version.load(Ordering::SeqCst) + 1;
		match read_and_validate(&self.path, next_version).await {
			Ok(snapshot) => {
				info!(version = next_version, "config reloaded");
				self.version.store(next_version, Ordering::SeqCst);
				self.current.store(Arc::new(snapshot));
				let _ = self.changed_tx.send(next_version);
			},
			Err(e) => {
				warn!(error = %e, "config reload failed validation, keeping previous snapshot");
			},
		}
	}
}

async fn read_and_validate(path: &Path, version: u64) -> Result<Snapshot, ConfigError> {
	let text = tokio::fs::read_to_string(path)
		.await
		.map_err(|source| ConfigError::Read {
			path: path.display().to_string(),
			source,
		})?;
	let doc: ConfigDocument = serde_path_to_error::deserialize(&mut serde_json::Deserializer::from_str(&text))
		.map_err(|e| {
			let pointer = e.path().to_string();
			ConfigError::Parse {
				pointer,
				source: e.into_inner(),
			}
		})?;
	validate::build(doc, version)
}
