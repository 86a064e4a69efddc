//! `prometheus_client` exposition of the same counters `MetricsRegistry` tracks, matching the
//! teacher's `Family<Labels, Counter>` idiom for labeled counters. Kept separate from the
//! lock-free hot-path counters: this registry is populated by reading them, never written to
//! directly from the request path.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use super::MetricsRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct ListenerLabels {
	listener: String,
}

pub struct PrometheusExport {
	registry: Registry,
	bytes_in: Family<ListenerLabels, Counter>,
	bytes_out: Family<ListenerLabels, Counter>,
	active_conns: Family<ListenerLabels, Gauge>,
	total_reqs: Family<ListenerLabels, Counter>,
}

impl PrometheusExport {
	pub fn new() -> Self {
		let mut registry = Registry::default();
		let bytes_in = Family::<ListenerLabels, Counter>::default();
		let bytes_out = Family::<ListenerLabels, Counter>::default();
		let active_conns = Family::<ListenerLabels, Gauge>::default();
		let total_reqs = Family::<ListenerLabels, Counter>::default();

		registry.register("proxy_bytes_in", "Bytes received from clients", bytes_in.clone());
		registry.register("proxy_bytes_out", "Bytes sent to clients", bytes_out.clone());
		registry.register("proxy_active_conns", "In-flight connections", active_conns.clone());
		registry.register("proxy_requests_total", "Total requests handled", total_reqs.clone());

		PrometheusExport {
			registry,
			bytes_in,
			bytes_out,
			active_conns,
			total_reqs,
		}
	}

	/// Re-derives every labeled metric from the live atomics; called on each scrape rather than
	/// kept continuously in sync, since the scrape interval is far lower frequency than request
	/// volume.
	pub fn refresh(&self, source: &MetricsRegistry) {
		for (name, overview) in source.get_per_listener() {
			let labels = ListenerLabels { listener: name.to_string() };
			self.bytes_in.get_or_create(&labels).inner().store(overview.bytes_in, std::sync::atomic::Ordering::Relaxed);
			self.bytes_out.get_or_create(&labels).inner().store(overview.bytes_out, std::sync::atomic::Ordering::Relaxed);
			self.active_conns.get_or_create(&labels).set(overview.active_conns);
			self.total_reqs
				.get_or_create(&labels)
				.inner()
				.store(overview.total_reqs, std::sync::atomic::Ordering::Relaxed);
		}
	}

	pub fn encode(&self) -> String {
		let mut buf = String::new();
		let _ = prometheus_client::encoding::text::encode(&mut buf, &self.registry);
		buf
	}
}

impl Default for PrometheusExport {
	fn default() -> Self {
		Self::new()
	}
}
