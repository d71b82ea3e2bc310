#![cfg(feature = "integration-tests")]

mod common;

use concordia::Hub;
use concordia::model::{EntityStatus, EntityType, RecordQuality};

use common::{buildup_kpi_record, test_settings, v2_project_record};
use serde_json::json;

/// A registered, condition-satisfying mapping always yields an entity of
/// the mapping's target type, stored under its generated id.
#[tokio::test]
async fn transform_yields_the_mapped_target_type() -> Result<(), Box<dyn std::error::Error>> {
	let hub = Hub::build(test_settings());

	let result = hub
		.transformer
		.transform(&v2_project_record("r-1", "Atlas", RecordQuality::High), None)
		.await;

	assert!(result.success, "unexpected errors: {:?}", result.errors);
	let entity = result.entity.expect("entity produced");
	assert_eq!(entity.entity_type, EntityType::Project);
	assert_eq!(entity.title, "Atlas");
	assert_eq!(entity.status, EntityStatus::Active);
	assert_eq!(entity.tags, vec!["core", "sync"]);

	let stored = hub.store.get(&entity.id).await.expect("stored");
	assert_eq!(stored.title, "Atlas");
	Ok(())
}

/// Corrupted source quality with an otherwise clean record scores exactly
/// 100 - 25 = 75.
#[tokio::test]
async fn corrupted_quality_scores_seventy_five() -> Result<(), Box<dyn std::error::Error>> {
	let hub = Hub::build(test_settings());

	let result = hub
		.transformer
		.transform(
			&v2_project_record("r-2", "Borealis", RecordQuality::Corrupted),
			None,
		)
		.await;

	assert!(result.success);
	assert_eq!(result.quality_score, 75);
	Ok(())
}

/// KPI normalization clamps each axis into 0..=100 and drops unknown axes;
/// the low-axis post-processor escalates the entity priority.
#[tokio::test]
async fn kpi_values_normalize_and_escalate() -> Result<(), Box<dyn std::error::Error>> {
	let hub = Hub::build(test_settings());

	let result = hub
		.transformer
		.transform(
			&buildup_kpi_record(
				"k-1",
				json!({"performance": 130, "quality": 12, "made_up_axis": 50}),
			),
			None,
		)
		.await;

	assert!(result.success, "unexpected errors: {:?}", result.errors);
	let entity = result.entity.expect("entity produced");
	assert_eq!(entity.entity_type, EntityType::Kpi);

	let scores = entity.extra.get("scores").and_then(|v| v.as_object()).unwrap();
	assert_eq!(scores.get("performance"), Some(&json!(100.0)));
	assert_eq!(scores.get("quality"), Some(&json!(12.0)));
	assert!(!scores.contains_key("made_up_axis"));

	// quality axis below 25 raised the priority.
	assert_eq!(entity.priority, concordia::model::EntityPriority::Critical);
	Ok(())
}

/// Batch transformation never aborts on one bad record and tallies the
/// per-quality buckets.
#[tokio::test]
async fn batches_isolate_failures() -> Result<(), Box<dyn std::error::Error>> {
	let hub = Hub::build(test_settings());

	let records = vec![
		v2_project_record("ok-1", "One", RecordQuality::High),
		concordia::model::RawRecord::new(
			"bad-1",
			"ext-bad",
			concordia::model::SourceSystem::V2,
			json!({"type": "no_such_kind"}),
			RecordQuality::High,
		),
		v2_project_record("ok-2", "Two", RecordQuality::High),
	];

	let outcome = hub.transformer.transform_batch(&records, Some("batch-test")).await;
	assert_eq!(outcome.summary.total, 3);
	assert_eq!(outcome.summary.succeeded, 2);
	assert_eq!(outcome.summary.failed, 1);
	assert!(outcome.summary.throughput > 0.0);
	assert_eq!(hub.store.len().await, 2);
	Ok(())
}
