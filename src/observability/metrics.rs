use prometheus::{
	Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Central registry for all Prometheus metrics
pub struct MetricsRegistry {
	registry: Registry,

	// Transformation metrics
	pub transform_requests_total: IntCounter,
	pub transform_failures_total: IntCounter,
	pub transform_warnings_total: IntCounter,
	pub transform_duration_seconds: Histogram,

	// Change detection metrics
	pub changes_detected_total: IntCounter,
	pub changes_deduplicated_total: IntCounter,
	pub change_buffer_flushes_total: IntCounter,
	pub change_buffer_length: IntGauge,

	// Sync execution metrics
	pub sync_operations_total: IntCounter,
	pub sync_completed_total: IntCounter,
	pub sync_failed_total: IntCounter,
	pub sync_retries_total: IntCounter,
	pub sync_duplicates_suppressed_total: IntCounter,
	pub sync_queue_depth: IntGauge,
	pub sync_in_flight: IntGauge,
	pub sync_latency_ms: Histogram,

	// Conflict metrics
	pub conflicts_detected_total: IntCounter,
	pub conflicts_resolved_total: IntCounter,
	pub conflicts_escalated_total: IntCounter,

	// Health
	pub health_score: IntGauge,
}

impl MetricsRegistry {
	pub fn new() -> Self {
		let registry = Registry::new();

		let transform_requests_total = IntCounter::with_opts(
			Opts::new(
				"concordia_transform_requests_total",
				"Total transformation requests",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let transform_failures_total = IntCounter::with_opts(
			Opts::new(
				"concordia_transform_failures_total",
				"Transformations that did not produce a usable entity",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let transform_warnings_total = IntCounter::with_opts(
			Opts::new(
				"concordia_transform_warnings_total",
				"Transformations that succeeded with warnings",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let transform_duration_seconds = Histogram::with_opts(
			HistogramOpts::new(
				"concordia_transform_duration_seconds",
				"Duration of single-record transformations in seconds",
			)
			.namespace("concordia")
			.buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
		)
		.unwrap();

		let changes_detected_total = IntCounter::with_opts(
			Opts::new(
				"concordia_changes_detected_total",
				"Change events emitted by the detector",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let changes_deduplicated_total = IntCounter::with_opts(
			Opts::new(
				"concordia_changes_deduplicated_total",
				"Change events dropped inside the deduplication window",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let change_buffer_flushes_total = IntCounter::with_opts(
			Opts::new(
				"concordia_change_buffer_flushes_total",
				"Number of change buffer flushes",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let change_buffer_length = IntGauge::with_opts(
			Opts::new(
				"concordia_change_buffer_length",
				"Current length of the change event buffer",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let sync_operations_total = IntCounter::with_opts(
			Opts::new(
				"concordia_sync_operations_total",
				"Sync operations created",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let sync_completed_total = IntCounter::with_opts(
			Opts::new(
				"concordia_sync_completed_total",
				"Sync operations completed successfully",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let sync_failed_total = IntCounter::with_opts(
			Opts::new(
				"concordia_sync_failed_total",
				"Sync operations failed permanently",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let sync_retries_total = IntCounter::with_opts(
			Opts::new(
				"concordia_sync_retries_total",
				"Sync operation retries scheduled",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let sync_duplicates_suppressed_total = IntCounter::with_opts(
			Opts::new(
				"concordia_sync_duplicates_suppressed_total",
				"Enqueue attempts dropped by duplicate suppression",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let sync_queue_depth = IntGauge::with_opts(
			Opts::new(
				"concordia_sync_queue_depth",
				"Operations waiting in the priority queue",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let sync_in_flight = IntGauge::with_opts(
			Opts::new(
				"concordia_sync_in_flight",
				"Operations currently executing",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let sync_latency_ms = Histogram::with_opts(
			HistogramOpts::new(
				"concordia_sync_latency_ms",
				"End-to-end sync operation latency in milliseconds",
			)
			.namespace("concordia")
			.buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
		)
		.unwrap();

		let conflicts_detected_total = IntCounter::with_opts(
			Opts::new(
				"concordia_conflicts_detected_total",
				"Conflicts detected during sync",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let conflicts_resolved_total = IntCounter::with_opts(
			Opts::new(
				"concordia_conflicts_resolved_total",
				"Conflicts resolved automatically or manually",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let conflicts_escalated_total = IntCounter::with_opts(
			Opts::new(
				"concordia_conflicts_escalated_total",
				"Conflicts escalated to manual resolution",
			)
			.namespace("concordia"),
		)
		.unwrap();

		let health_score = IntGauge::with_opts(
			Opts::new(
				"concordia_health_score",
				"Composite sync health score (0-100)",
			)
			.namespace("concordia"),
		)
		.unwrap();

		// Register all metrics
		registry
			.register(Box::new(transform_requests_total.clone()))
			.unwrap();
		registry
			.register(Box::new(transform_failures_total.clone()))
			.unwrap();
		registry
			.register(Box::new(transform_warnings_total.clone()))
			.unwrap();
		registry
			.register(Box::new(transform_duration_seconds.clone()))
			.unwrap();
		registry
			.register(Box::new(changes_detected_total.clone()))
			.unwrap();
		registry
			.register(Box::new(changes_deduplicated_total.clone()))
			.unwrap();
		registry
			.register(Box::new(change_buffer_flushes_total.clone()))
			.unwrap();
		registry
			.register(Box::new(change_buffer_length.clone()))
			.unwrap();
		registry
			.register(Box::new(sync_operations_total.clone()))
			.unwrap();
		registry
			.register(Box::new(sync_completed_total.clone()))
			.unwrap();
		registry
			.register(Box::new(sync_failed_total.clone()))
			.unwrap();
		registry
			.register(Box::new(sync_retries_total.clone()))
			.unwrap();
		registry
			.register(Box::new(sync_duplicates_suppressed_total.clone()))
			.unwrap();
		registry
			.register(Box::new(sync_queue_depth.clone()))
			.unwrap();
		registry.register(Box::new(sync_in_flight.clone())).unwrap();
		registry.register(Box::new(sync_latency_ms.clone())).unwrap();
		registry
			.register(Box::new(conflicts_detected_total.clone()))
			.unwrap();
		registry
			.register(Box::new(conflicts_resolved_total.clone()))
			.unwrap();
		registry
			.register(Box::new(conflicts_escalated_total.clone()))
			.unwrap();
		registry.register(Box::new(health_score.clone())).unwrap();

		Self {
			registry,
			transform_requests_total,
			transform_failures_total,
			transform_warnings_total,
			transform_duration_seconds,
			changes_detected_total,
			changes_deduplicated_total,
			change_buffer_flushes_total,
			change_buffer_length,
			sync_operations_total,
			sync_completed_total,
			sync_failed_total,
			sync_retries_total,
			sync_duplicates_suppressed_total,
			sync_queue_depth,
			sync_in_flight,
			sync_latency_ms,
			conflicts_detected_total,
			conflicts_resolved_total,
			conflicts_escalated_total,
			health_score,
		}
	}

	/// Encode all registered metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		encoder
			.encode_to_string(&metric_families)
			.unwrap_or_default()
	}
}

impl Default for MetricsRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Initialize the Prometheus metrics registry
pub fn init_metrics() -> anyhow::Result<Arc<MetricsRegistry>> {
	Ok(Arc::new(MetricsRegistry::new()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encode_contains_registered_metrics() {
		let metrics = MetricsRegistry::new();
		metrics.sync_operations_total.inc_by(3);
		metrics.health_score.set(97);

		let text = metrics.encode();
		assert!(text.contains("concordia_sync_operations_total 3"));
		assert!(text.contains("concordia_health_score 97"));
	}
}
