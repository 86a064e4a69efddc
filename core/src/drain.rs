use std::time::Duration;

pub use internal::{
	DrainMode, ReleaseShutdown as DrainBlocker, Signal as DrainTrigger, Upgrader as DrainUpgrader,
	Watch as DrainWatcher,
};
use tokio::sync::watch;
use tracing::{Instrument, debug, info, warn};

/// Constructs a new drain pair.
/// * `DrainTrigger` starts a draining sequence and waits for it to complete.
/// * `DrainWatcher` should be held by anything that wants to participate in draining. It can be
///   cloned, and a drain will not complete until all outstanding watchers are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (tx, rx) = internal::channel();
	(tx, rx)
}

/// Runs a future with graceful shutdown support.
/// * `drain`: while held, the future is marked active, blocking the server from shutting down.
///   It can also be watched (`drain.wait_for_drain()`) to know when to start a graceful shutdown.
/// * `force_shutdown`: once triggered, any ongoing work must stop immediately. This fires when the
///   graceful drain exceeded `deadline`.
pub async fn run_with_drain<F, O>(
	component: String,
	drain: DrainWatcher,
	deadline: Duration,
	make_future: F,
) where
	F: AsyncFnOnce(DrainWatcher, watch::Receiver<()>) -> O,
	O: Send + 'static,
{
	let (sub_drain_signal, sub_drain) = new();
	let (trigger_force_shutdown, force_shutdown) = watch::channel(());
	let trigger_force_shutdown_cpy = trigger_force_shutdown.clone();
	let fut = make_future(sub_drain, force_shutdown).in_current_span();
	let watch = async move {
		let res = drain.wait_for_drain().await;
		if res.mode() == DrainMode::Graceful {
			info!(
				component,
				"drain started, waiting {:?} for connections to complete", deadline
			);
			if tokio::time::timeout(
				deadline,
				sub_drain_signal.start_drain_and_wait(DrainMode::Graceful),
			)
			.await
			.is_err()
			{
				warn!(
					component,
					"drain duration expired with pending connections, forcefully shutting down"
				);
			}
		} else {
			debug!(component, "terminating");
		}
		// Only needed in the timeout case, but harmless to always send.
		let _ = trigger_force_shutdown.send(());
		info!(component, "shutdown complete");
	};
	tokio::select! {
		_ = fut => {
			let _ = trigger_force_shutdown_cpy.send(());
		},
		_ = watch => {}
	}
}

mod internal {
	use tokio::sync::{mpsc, watch};

	pub fn channel() -> (Signal, Watch) {
		let (signal_tx, signal_rx) = watch::channel(None);
		let (drained_tx, drained_rx) = mpsc::channel(1);

		let signal = Signal {
			drained_rx,
			signal_tx,
		};
		let watch = Watch {
			drained_tx,
			signal_rx,
		};
		(signal, watch)
	}

	enum Never {}

	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub enum DrainMode {
		Immediate,
		Graceful,
	}

	/// Sends a drain command to all watchers.
	pub struct Signal {
		drained_rx: mpsc::Receiver<Never>,
		signal_tx: watch::Sender<Option<DrainMode>>,
	}

	/// Watches for a drain command. All `Watch` instances must be dropped before
	/// `Signal::start_drain_and_wait` can complete.
	#[derive(Clone)]
	pub struct Watch {
		drained_tx: mpsc::Sender<Never>,
		signal_rx: watch::Receiver<Option<DrainMode>>,
	}

	#[derive(Clone)]
	pub struct Weak {
		signal_rx: watch::Receiver<Option<DrainMode>>,
	}

	pub struct Upgrader {
		drained_tx: Option<mpsc::Sender<Never>>,
	}

	impl Upgrader {
		pub fn disable(&mut self) {
			self.drained_tx = None;
		}
		pub fn upgrade(&self, other: Weak) -> Watch {
			let drained_tx = self.drained_tx.clone().unwrap_or_else(|| {
				let (tx, _) = mpsc::channel(1);
				tx
			});
			Watch {
				drained_tx,
				signal_rx: other.signal_rx,
			}
		}
	}

	impl Watch {
		pub fn into_weak(self) -> (Upgrader, Weak) {
			let Self {
				drained_tx,
				signal_rx,
			} = self;
			(
				Upgrader {
					drained_tx: Some(drained_tx),
				},
				Weak { signal_rx },
			)
		}
	}

	#[must_use = "ReleaseShutdown should be dropped explicitly to release the runtime"]
	#[derive(Clone)]
	#[allow(dead_code)]
	pub struct ReleaseShutdown(mpsc::Sender<Never>, DrainMode);

	impl ReleaseShutdown {
		pub fn mode(&self) -> DrainMode {
			self.1
		}
	}

	impl Signal {
		pub async fn closed(&mut self) {
			self.signal_tx.closed().await;
		}

		pub fn count(&self) -> usize {
			self.signal_tx.receiver_count()
		}

		/// Signals all watchers to begin draining and waits for all handles to be dropped.
		pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
			let _ = self.signal_tx.send(Some(mode));
			match self.drained_rx.recv().await {
				None => {},
				Some(n) => match n {},
			}
		}
	}

	impl Watch {
		/// Wraps a connection so it is gracefully shut down when a drain is signaled.
		pub fn wrap_connection<C: crate::drain::hyperfork::GracefulConnection>(
			self,
			conn: C,
		) -> impl Future<Output = C::Output> {
			crate::drain::hyperfork::GracefulConnectionFuture::new(conn, self.wait_for_drain())
		}

		/// Resolves once a drain has been signaled, returning a handle that must be dropped when
		/// the caller's shutdown work is complete.
		pub async fn wait_for_drain(mut self) -> ReleaseShutdown {
			let mode = self
				.signal_rx
				.wait_for(Option::is_some)
				.await
				.map(|mode| mode.expect("already asserted is_some"))
				.unwrap_or(DrainMode::Immediate);
			ReleaseShutdown(self.drained_tx, mode)
		}
	}

	impl std::fmt::Debug for Signal {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Signal").finish_non_exhaustive()
		}
	}
	impl std::fmt::Debug for Watch {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Watch").finish_non_exhaustive()
		}
	}
	impl std::fmt::Debug for ReleaseShutdown {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("ReleaseShutdown").finish_non_exhaustive()
		}
	}
}

mod hyperfork {
	use std::fmt::Debug;
	use std::pin::Pin;
	use std::task::Poll;
	use std::{fmt, task};

	pub use hyper_util::server::graceful::GracefulConnection as HyperGracefulConnection;
	use pin_project_lite::pin_project;

	pub trait GracefulConnection: Future<Output = Result<(), Self::Error>> {
		type Error;
		fn graceful_shutdown(self: Pin<&mut Self>);
	}

	impl<T: HyperGracefulConnection> GracefulConnection for T {
		type Error = T::Error;
		fn graceful_shutdown(self: Pin<&mut Self>) {
			self.graceful_shutdown()
		}
	}

	pin_project! {
		pub struct GracefulConnectionFuture<C, F: Future> {
			#[pin]
			conn: C,
			#[pin]
			cancel: F,
			#[pin]
			cancelled_guard: Option<F::Output>,
		}
	}

	impl<C, F: Future> GracefulConnectionFuture<C, F> {
		pub fn new(conn: C, cancel: F) -> Self {
			Self {
				conn,
				cancel,
				cancelled_guard: None,
			}
		}
	}

	impl<C, F: Future> Debug for GracefulConnectionFuture<C, F> {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.debug_struct("GracefulConnectionFuture").finish()
		}
	}

	impl<C, F> Future for GracefulConnectionFuture<C, F>
	where
		C: GracefulConnection,
		F: Future,
	{
		type Output = C::Output;

		fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
			let mut this = self.project();
			if this.cancelled_guard.is_none() {
				if let Poll::Ready(guard) = this.cancel.poll(cx) {
					this.cancelled_guard.set(Some(guard));
					this.conn.as_mut().graceful_shutdown();
				}
			}
			this.conn.poll(cx)
		}
	}
}

#[cfg(test)]
mod test {
	use std::pin::Pin;
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::task;
	use std::task::Poll;

	use pin_project_lite::pin_project;

	use crate::drain;
	use crate::drain::DrainMode::Graceful;

	pin_project! {
		#[derive(Debug)]
		struct DummyConnection<F> {
			#[pin]
			future: F,
			shutdown_counter: Arc<AtomicUsize>,
		}
	}

	impl<F: Future> super::hyperfork::GracefulConnection for DummyConnection<F> {
		type Error = ();
		fn graceful_shutdown(self: Pin<&mut Self>) {
			self.shutdown_counter.fetch_add(1, Ordering::SeqCst);
		}
	}

	impl<F: Future> Future for DummyConnection<F> {
		type Output = Result<(), ()>;
		fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
			match self.project().future.poll(cx) {
				Poll::Ready(_) => Poll::Ready(Ok(())),
				Poll::Pending => Poll::Pending,
			}
		}
	}

	#[tokio::test]
	async fn graceful_shutdown_waits_for_connections() {
		let (trigger, watcher) = drain::new();
		let shutdown_counter = Arc::new(AtomicUsize::new(0));
		let (dummy_tx, _) = tokio::sync::broadcast::channel(1);

		for i in 1..=3 {
			let mut dummy_rx = dummy_tx.subscribe();
			let shutdown_counter = shutdown_counter.clone();
			let future = async move {
				tokio::time::sleep(std::time::Duration::from_millis(i * 10)).await;
				let _ = dummy_rx.recv().await;
			};
			let dummy_conn = DummyConnection {
				future,
				shutdown_counter,
			};
			let conn = watcher.clone().wrap_connection(dummy_conn);
			tokio::spawn(async move {
				conn.await.unwrap();
			});
		}
		drop(watcher);

		assert_eq!(shutdown_counter.load(Ordering::SeqCst), 0);
		let _ = dummy_tx.send(());

		tokio::select! {
			_ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {
				panic!("timeout")
			},
			_ = trigger.start_drain_and_wait(Graceful) => {
				assert_eq!(shutdown_counter.load(Ordering::SeqCst), 3);
			}
		}
	}
}
