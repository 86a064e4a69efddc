//! Watches a listener's cert/key files and swaps its live `rustls::ServerConfig` in place when
//! either changes, leaving the listening socket untouched.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::TlsRef;

use super::{Error, build_server_config};

pub struct TlsManager {
	current: ArcSwap<rustls::ServerConfig>,
	_watcher: Option<notify::RecommendedWatcher>,
}

impl TlsManager {
	/// Builds the initial `ServerConfig` and starts watching `tls.cert`/`tls.key` for changes.
	pub fn load(tls: &TlsRef) -> Result<Arc<Self>, Error> {
		let config = build_server_config(tls)?;
		let (tx, mut rx) = mpsc::channel::<()>(4);
		let watcher = watch_paths(&[tls.cert.clone(), tls.key.clone()], tx);

		let manager = Arc::new(TlsManager {
			current: ArcSwap::from_pointee(config),
			_watcher: watcher,
		});

		let mgr = manager.clone();
		let tls = tls.clone();
		tokio::spawn(async move {
			while rx.recv().await.is_some() {
				match build_server_config(&tls) {
					Ok(cfg) => {
						info!(cert = %tls.cert.display(), "tls certificate reloaded");
						mgr.current.store(Arc::new(cfg));
					},
					Err(e) => warn!(error = %e, "tls reload failed, keeping previous certificate"),
				}
			}
		});

		Ok(manager)
	}

	pub fn current(&self) -> Arc<rustls::ServerConfig> {
		self.current.load_full()
	}
}

fn watch_paths(paths: &[PathBuf], tx: mpsc::Sender<()>) -> Option<notify::RecommendedWatcher> {
	let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
		if res.is_ok() {
			let _ = tx.try_send(());
		}
	}) {
		Ok(w) => w,
		Err(e) => {
			error!(error = %e, "failed to start tls file watcher, hot reload disabled");
			return None;
		},
	};
	for path in paths {
		let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
			continue;
		};
		if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
			warn!(error = %e, path = %parent.display(), "failed to watch tls directory");
		}
	}
	Some(watcher)
}
