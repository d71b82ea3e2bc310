#![allow(dead_code)]

use chrono::Utc;
use serde_json::{Map, Value, json};

use concordia::config::Settings;
use concordia::model::{
	EntityPriority, EntityStatus, EntityType, Provenance, RawRecord, RecordQuality,
	SourceSystem, UnifiedEntity,
};

/// Settings tuned for tests: fast ticks, no artificial waits.
pub fn test_settings() -> Settings {
	let mut settings = Settings::default();
	settings.sync.tick_interval_ms = 10;
	settings.sync.stop_timeout_ms = 500;
	settings.detection.flush_interval_ms = 100;
	settings.retry.jitter_enabled = false;
	settings
}

pub fn entity(id: &str, entity_type: EntityType, source: SourceSystem) -> UnifiedEntity {
	let now = Utc::now();
	UnifiedEntity {
		id: id.to_string(),
		entity_type,
		title: format!("Entity {id}"),
		description: None,
		status: EntityStatus::Active,
		priority: EntityPriority::Medium,
		created_at: now,
		updated_at: now,
		created_by: None,
		updated_by: None,
		tags: vec!["seeded".to_string()],
		metadata: Map::new(),
		source: Provenance {
			source_id: format!("ext-{id}"),
			source_type: source,
			original_data: json!({}),
			transformed_at: now,
			version: 1,
		},
		extra: Map::new(),
	}
}

pub fn v2_project_record(id: &str, name: &str, quality: RecordQuality) -> RawRecord {
	RawRecord::new(
		id,
		format!("ext-{id}"),
		SourceSystem::V2,
		json!({
			"type": "project",
			"name": name,
			"state": "open",
			"labels": "core, sync",
			"progress": 40,
		}),
		quality,
	)
}

pub fn buildup_kpi_record(id: &str, values: Value) -> RawRecord {
	RawRecord::new(
		id,
		format!("ext-{id}"),
		SourceSystem::Buildup,
		json!({
			"type": "kpi",
			"name": format!("KPI {id}"),
			"values": values,
			"period": "2026-Q3",
			"themes": "kpi",
		}),
		RecordQuality::High,
	)
}
