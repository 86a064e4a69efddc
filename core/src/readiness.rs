use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::telemetry;

/// Tracks whether the process is ready: a set of named tasks must all complete before readiness
/// is reached.
#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<Mutex<HashSet<String>>>);

impl Ready {
	pub fn new() -> Ready {
		Ready(Default::default())
	}

	/// Registers a dependency that must complete before the process is considered ready.
	pub fn register_task(&self, name: &str) -> BlockReady {
		self.0.lock().unwrap().insert(name.to_string());
		BlockReady {
			parent: self.to_owned(),
			name: name.to_string(),
		}
	}

	pub fn pending(&self) -> HashSet<String> {
		self.0.lock().unwrap().clone()
	}

	pub fn is_ready(&self) -> bool {
		self.0.lock().unwrap().is_empty()
	}
}

/// Blocks readiness until dropped.
pub struct BlockReady {
	parent: Ready,
	name: String,
}

impl BlockReady {
	pub fn subtask(&self, name: &str) -> BlockReady {
		self.parent.register_task(name)
	}
}

impl Drop for BlockReady {
	fn drop(&mut self) {
		let mut pending = self.parent.0.lock().unwrap();
		let removed = pending.remove(&self.name);
		debug_assert!(removed, "task '{}' completed twice", self.name);
		let left = pending.len();
		let dur = telemetry::start_time().elapsed();
		if left == 0 {
			info!("task '{}' complete ({dur:?}), marking process ready", self.name);
		} else {
			info!(
				"task '{}' complete ({dur:?}), still awaiting {left} task(s)",
				self.name
			);
		}
	}
}
