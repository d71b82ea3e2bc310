use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::record::SourceSystem;

/// Discriminant for the unified, system-agnostic entity model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
	Project,
	Event,
	Task,
	Kpi,
	Recommendation,
	Milestone,
	Resource,
	Metric,
}

impl EntityType {
	pub const ALL: [EntityType; 8] = [
		EntityType::Project,
		EntityType::Event,
		EntityType::Task,
		EntityType::Kpi,
		EntityType::Recommendation,
		EntityType::Milestone,
		EntityType::Resource,
		EntityType::Metric,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			EntityType::Project => "project",
			EntityType::Event => "event",
			EntityType::Task => "task",
			EntityType::Kpi => "kpi",
			EntityType::Recommendation => "recommendation",
			EntityType::Milestone => "milestone",
			EntityType::Resource => "resource",
			EntityType::Metric => "metric",
		}
	}
}

impl fmt::Display for EntityType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

impl std::str::FromStr for EntityType {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"project" => Ok(EntityType::Project),
			"event" => Ok(EntityType::Event),
			"task" => Ok(EntityType::Task),
			"kpi" => Ok(EntityType::Kpi),
			"recommendation" => Ok(EntityType::Recommendation),
			"milestone" => Ok(EntityType::Milestone),
			"resource" => Ok(EntityType::Resource),
			"metric" => Ok(EntityType::Metric),
			_ => Err(format!("unknown entity type: {s}")),
		}
	}
}

/// Lifecycle status of a unified entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
	Draft,
	Active,
	Completed,
	Cancelled,
	Archived,
}

impl EntityStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			EntityStatus::Draft => "draft",
			EntityStatus::Active => "active",
			EntityStatus::Completed => "completed",
			EntityStatus::Cancelled => "cancelled",
			EntityStatus::Archived => "archived",
		}
	}

	/// Archived entities are treated as soft-deleted: a transition into this
	/// status classifies as a delete, a transition out as a restore.
	pub fn is_archived(&self) -> bool {
		matches!(self, EntityStatus::Archived)
	}
}

impl fmt::Display for EntityStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

impl std::str::FromStr for EntityStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"draft" => Ok(EntityStatus::Draft),
			"active" => Ok(EntityStatus::Active),
			"completed" => Ok(EntityStatus::Completed),
			"cancelled" => Ok(EntityStatus::Cancelled),
			"archived" => Ok(EntityStatus::Archived),
			_ => Err(format!("unknown entity status: {s}")),
		}
	}
}

/// Priority of a unified entity (distinct from sync operation priority,
/// which is a 1..=10 scheduling weight).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityPriority {
	Low,
	Medium,
	High,
	Critical,
}

impl EntityPriority {
	pub fn as_str(&self) -> &'static str {
		match self {
			EntityPriority::Low => "low",
			EntityPriority::Medium => "medium",
			EntityPriority::High => "high",
			EntityPriority::Critical => "critical",
		}
	}
}

impl fmt::Display for EntityPriority {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// Where a unified entity came from and when it was produced.
///
/// `source_type` is immutable after creation; the entity store rejects
/// upserts that try to change it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
	pub source_id: String,
	pub source_type: SourceSystem,
	pub original_data: Value,
	pub transformed_at: DateTime<Utc>,
	pub version: u64,
}

/// A system-agnostic record produced by transformation from a raw,
/// system-specific record.
///
/// Typed fields cover the common schema; anything a mapping writes outside
/// of it (scores, progress, kpiImpact, ...) is retained in the flattened
/// `extra` map so no mapped data is silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedEntity {
	pub id: String,
	#[serde(rename = "type")]
	pub entity_type: EntityType,
	pub title: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	pub status: EntityStatus,
	pub priority: EntityPriority,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub created_by: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub updated_by: Option<String>,
	#[serde(default)]
	pub tags: Vec<String>,
	#[serde(default)]
	pub metadata: Map<String, Value>,
	pub source: Provenance,
	#[serde(flatten, default)]
	pub extra: Map<String, Value>,
}

impl UnifiedEntity {
	/// Serialize to a JSON object. Infallible for this shape; used by the
	/// diffing, checksumming, and conflict-inspection paths.
	pub fn to_value(&self) -> Value {
		serde_json::to_value(self).unwrap_or(Value::Null)
	}

	/// Look up a (possibly dotted) field across typed fields and the extra
	/// map, through the entity's JSON view.
	pub fn field_value(&self, path: &str) -> Option<Value> {
		crate::mapping::path::get(&self.to_value(), path).cloned()
	}

	/// Refresh the update stamp, keeping `updated_at` monotonically
	/// non-decreasing.
	pub fn touch(&mut self, by: Option<&str>) {
		let now = Utc::now();
		if now > self.updated_at {
			self.updated_at = now;
		}
		if let Some(actor) = by {
			self.updated_by = Some(actor.to_string());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn sample() -> UnifiedEntity {
		let now = Utc::now();
		UnifiedEntity {
			id: "ent-1".to_string(),
			entity_type: EntityType::Project,
			title: "Atlas".to_string(),
			description: None,
			status: EntityStatus::Active,
			priority: EntityPriority::Medium,
			created_at: now,
			updated_at: now,
			created_by: None,
			updated_by: None,
			tags: vec!["core".to_string()],
			metadata: Map::new(),
			source: Provenance {
				source_id: "ext-1".to_string(),
				source_type: SourceSystem::V2,
				original_data: json!({}),
				transformed_at: now,
				version: 1,
			},
			extra: Map::new(),
		}
	}

	#[test]
	fn serializes_type_discriminant() {
		let value = sample().to_value();
		assert_eq!(value["type"], "project");
		assert_eq!(value["status"], "active");
	}

	#[test]
	fn extra_fields_flatten_and_roundtrip() {
		let mut entity = sample();
		entity
			.extra
			.insert("progress".to_string(), json!(42));
		let value = entity.to_value();
		assert_eq!(value["progress"], 42);

		let back: UnifiedEntity = serde_json::from_value(value).unwrap();
		assert_eq!(back.extra.get("progress"), Some(&json!(42)));
	}

	#[test]
	fn field_value_reads_typed_and_extra() {
		let mut entity = sample();
		entity.extra.insert("scores".to_string(), json!({"quality": 80}));
		assert_eq!(entity.field_value("title"), Some(json!("Atlas")));
		assert_eq!(entity.field_value("scores.quality"), Some(json!(80)));
		assert_eq!(entity.field_value("missing.path"), None);
	}
}
