use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::entity::EntityType;

/// One of the three external systems of record that produce raw records and
/// receive propagated writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSystem {
	V2,
	Calendar,
	Buildup,
}

impl SourceSystem {
	/// All known systems, in a stable order.
	pub const ALL: [SourceSystem; 3] = [
		SourceSystem::V2,
		SourceSystem::Calendar,
		SourceSystem::Buildup,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			SourceSystem::V2 => "v2",
			SourceSystem::Calendar => "calendar",
			SourceSystem::Buildup => "buildup",
		}
	}

	/// Entity types this system accepts as a sync target. Writes outside the
	/// whitelist fail fast at the adapter boundary.
	pub fn allowed_entity_types(&self) -> &'static [EntityType] {
		match self {
			SourceSystem::Calendar => &[EntityType::Event, EntityType::Task],
			SourceSystem::V2 => &[EntityType::Project, EntityType::Recommendation],
			SourceSystem::Buildup => &[EntityType::Project, EntityType::Kpi],
		}
	}

	pub fn allows(&self, entity_type: EntityType) -> bool {
		self.allowed_entity_types().contains(&entity_type)
	}
}

impl fmt::Display for SourceSystem {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

impl std::str::FromStr for SourceSystem {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"v2" => Ok(SourceSystem::V2),
			"calendar" => Ok(SourceSystem::Calendar),
			"buildup" => Ok(SourceSystem::Buildup),
			_ => Err(format!("unknown source system: {s}")),
		}
	}
}

/// Self-reported quality of a raw record as delivered by its collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordQuality {
	High,
	Medium,
	Low,
	Corrupted,
}

impl RecordQuality {
	pub fn as_str(&self) -> &'static str {
		match self {
			RecordQuality::High => "high",
			RecordQuality::Medium => "medium",
			RecordQuality::Low => "low",
			RecordQuality::Corrupted => "corrupted",
		}
	}
}

impl fmt::Display for RecordQuality {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// A raw, system-specific record as supplied by an external data source.
///
/// The payload under `data` is opaque to everything except the mapping layer;
/// only `data.type` is inspected to select a transformation mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
	pub id: String,
	pub source_id: String,
	pub source_type: SourceSystem,
	pub data: Value,
	pub quality: RecordQuality,
}

impl RawRecord {
	pub fn new(
		id: impl Into<String>,
		source_id: impl Into<String>,
		source_type: SourceSystem,
		data: Value,
		quality: RecordQuality,
	) -> Self {
		Self {
			id: id.into(),
			source_id: source_id.into(),
			source_type,
			data,
			quality,
		}
	}

	/// The declared kind of the payload (`data.type`), when present.
	pub fn entity_kind(&self) -> Option<&str> {
		self.data.get("type").and_then(|v| v.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn source_system_roundtrip() {
		for system in SourceSystem::ALL {
			let parsed: SourceSystem = system.as_str().parse().unwrap();
			assert_eq!(system, parsed);
		}
	}

	#[test]
	fn whitelists_are_disjoint_from_origin() {
		assert!(SourceSystem::Calendar.allows(EntityType::Event));
		assert!(SourceSystem::Calendar.allows(EntityType::Task));
		assert!(!SourceSystem::Calendar.allows(EntityType::Kpi));
		assert!(SourceSystem::V2.allows(EntityType::Project));
		assert!(SourceSystem::V2.allows(EntityType::Recommendation));
		assert!(SourceSystem::Buildup.allows(EntityType::Kpi));
		assert!(!SourceSystem::Buildup.allows(EntityType::Event));
	}

	#[test]
	fn entity_kind_reads_payload_type() {
		let record = RawRecord::new(
			"r-1",
			"ext-1",
			SourceSystem::V2,
			json!({"type": "project", "name": "Atlas"}),
			RecordQuality::High,
		);
		assert_eq!(record.entity_kind(), Some("project"));
	}
}
