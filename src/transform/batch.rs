use futures_util::future::join_all;
use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

use super::{TransformationEngine, TransformationResult};
use crate::events::SyncEvent;
use crate::model::{EntityType, RawRecord, SourceSystem};

/// Per-bucket tallies in a batch summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
	pub total: usize,
	pub succeeded: usize,
	pub failed: usize,
}

impl BatchCounts {
	fn record(&mut self, success: bool) {
		self.total += 1;
		if success {
			self.succeeded += 1;
		} else {
			self.failed += 1;
		}
	}
}

/// Quality-score distribution of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QualityBuckets {
	/// score >= 90
	pub high: usize,
	/// 70..=89
	pub medium: usize,
	/// 50..=69
	pub low: usize,
	/// < 50
	pub poor: usize,
}

impl QualityBuckets {
	fn record(&mut self, score: u8) {
		if score >= 90 {
			self.high += 1;
		} else if score >= 70 {
			self.medium += 1;
		} else if score >= 50 {
			self.low += 1;
		} else {
			self.poor += 1;
		}
	}
}

/// Aggregated view of a batch transformation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
	pub total: usize,
	pub succeeded: usize,
	pub failed: usize,
	pub with_warnings: usize,
	pub by_source: HashMap<SourceSystem, BatchCounts>,
	pub by_entity_type: HashMap<EntityType, BatchCounts>,
	pub by_quality: QualityBuckets,
	pub duration_ms: u64,
	/// Records per elapsed second.
	pub throughput: f64,
}

/// Batch results plus their summary.
#[derive(Debug)]
pub struct BatchOutcome {
	pub results: Vec<TransformationResult>,
	pub summary: BatchSummary,
}

impl TransformationEngine {
	/// Transform a batch of records, a fixed-size chunk at a time.
	///
	/// One record's failure never aborts the batch; failures land in the
	/// per-record results and the summary tallies.
	pub async fn transform_batch(
		&self,
		records: &[RawRecord],
		user_id: Option<&str>,
	) -> BatchOutcome {
		let started = Instant::now();
		let concurrency = self.batch_concurrency;
		let mut results = Vec::with_capacity(records.len());

		for chunk in records.chunks(concurrency) {
			let futures = chunk.iter().map(|record| self.transform(record, user_id));
			results.extend(join_all(futures).await);
		}

		let mut summary = BatchSummary {
			total: records.len(),
			..BatchSummary::default()
		};

		for (record, result) in records.iter().zip(results.iter()) {
			if result.success {
				summary.succeeded += 1;
			} else {
				summary.failed += 1;
			}
			if !result.warnings.is_empty() {
				summary.with_warnings += 1;
			}
			summary
				.by_source
				.entry(record.source_type)
				.or_default()
				.record(result.success);
			if let Some(entity) = &result.entity {
				summary
					.by_entity_type
					.entry(entity.entity_type)
					.or_default()
					.record(result.success);
			}
			summary.by_quality.record(result.quality_score);
		}

		let elapsed = started.elapsed();
		summary.duration_ms = elapsed.as_millis() as u64;
		let secs = elapsed.as_secs_f64();
		summary.throughput = if secs > 0.0 {
			records.len() as f64 / secs
		} else {
			records.len() as f64
		};

		info!(
			"batch transform finished: {}/{} succeeded, {} warnings, {:.1} rec/s",
			summary.succeeded, summary.total, summary.with_warnings, summary.throughput
		);
		self.bus.publish(
			"transformer",
			SyncEvent::TransformBatchCompleted {
				total: summary.total,
				succeeded: summary.succeeded,
				failed: summary.failed,
				duration_ms: summary.duration_ms,
			},
		);

		BatchOutcome { results, summary }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::events::EventBus;
	use crate::mapping::{FieldMapping, MappingRegistry, TransformationMapping};
	use crate::model::RecordQuality;
	use crate::observability::MetricsRegistry;
	use crate::store::EntityStore;
	use serde_json::json;
	use std::sync::Arc;

	fn engine() -> TransformationEngine {
		let registry = Arc::new(MappingRegistry::new());
		registry
			.register(
				TransformationMapping::new(
					"v2-project",
					SourceSystem::V2,
					"project",
					EntityType::Project,
				)
				.with_field(FieldMapping::new("name", "title").required()),
			)
			.unwrap();
		TransformationEngine::new(
			registry,
			Arc::new(EntityStore::new()),
			EventBus::new(64),
			Arc::new(MetricsRegistry::new()),
		)
		.with_batch_concurrency(2)
	}

	#[tokio::test]
	async fn batch_counts_success_and_failure() {
		let records = vec![
			RawRecord::new(
				"ok-1",
				"e1",
				SourceSystem::V2,
				json!({"type": "project", "name": "Atlas"}),
				RecordQuality::High,
			),
			RawRecord::new(
				"bad-1",
				"e2",
				SourceSystem::V2,
				json!({"type": "unknown"}),
				RecordQuality::High,
			),
			RawRecord::new(
				"ok-2",
				"e3",
				SourceSystem::V2,
				json!({"type": "project", "name": "Borealis"}),
				RecordQuality::High,
			),
		];

		let outcome = engine().transform_batch(&records, None).await;
		assert_eq!(outcome.summary.total, 3);
		assert_eq!(outcome.summary.succeeded, 2);
		assert_eq!(outcome.summary.failed, 1);
		assert_eq!(outcome.results.len(), 3);

		let v2 = outcome.summary.by_source[&SourceSystem::V2];
		assert_eq!(v2.total, 3);
		assert_eq!(v2.succeeded, 2);

		let projects = outcome.summary.by_entity_type[&EntityType::Project];
		assert_eq!(projects.total, 2);
		assert!(outcome.summary.throughput > 0.0);
	}

	#[test]
	fn quality_buckets_boundaries() {
		let mut buckets = QualityBuckets::default();
		for score in [95, 90, 89, 70, 69, 50, 49, 0] {
			buckets.record(score);
		}
		assert_eq!(buckets.high, 2);
		assert_eq!(buckets.medium, 2);
		assert_eq!(buckets.low, 2);
		assert_eq!(buckets.poor, 2);
	}
}
