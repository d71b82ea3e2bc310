use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::entity::{EntityType, UnifiedEntity};
use super::record::SourceSystem;

/// Kind of transition detected for a unified entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
	Create,
	Update,
	Delete,
	Restore,
}

impl ChangeOperation {
	pub fn as_str(&self) -> &'static str {
		match self {
			ChangeOperation::Create => "create",
			ChangeOperation::Update => "update",
			ChangeOperation::Delete => "delete",
			ChangeOperation::Restore => "restore",
		}
	}

	/// Scheduling weight contributed by the operation kind.
	pub fn priority_weight(&self) -> u8 {
		match self {
			ChangeOperation::Create => 2,
			ChangeOperation::Delete => 3,
			ChangeOperation::Update => 1,
			ChangeOperation::Restore => 2,
		}
	}
}

impl fmt::Display for ChangeOperation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

impl std::str::FromStr for ChangeOperation {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"create" => Ok(ChangeOperation::Create),
			"update" => Ok(ChangeOperation::Update),
			"delete" => Ok(ChangeOperation::Delete),
			"restore" => Ok(ChangeOperation::Restore),
			_ => Err(format!("unknown change operation: {s}")),
		}
	}
}

/// A detected create/update/delete/restore transition for a unified entity.
///
/// Created exactly once per detected transition and immutable afterwards:
/// there are intentionally no mutators on this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
	pub id: Uuid,
	pub entity_id: String,
	pub entity_type: EntityType,
	pub source_system: SourceSystem,
	pub operation: ChangeOperation,
	pub timestamp: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub previous_version: Option<UnifiedEntity>,
	pub current_version: UnifiedEntity,
	/// Dotted paths of fields that differ between the two versions.
	pub changed_fields: Vec<String>,
	/// Systems this change fans out to, already filtered by whitelist.
	pub target_systems: Vec<SourceSystem>,
	/// Scheduling priority in 1..=10.
	pub priority: u8,
}

impl ChangeEvent {
	pub fn new(
		entity: &UnifiedEntity,
		operation: ChangeOperation,
		previous_version: Option<UnifiedEntity>,
		changed_fields: Vec<String>,
		target_systems: Vec<SourceSystem>,
		priority: u8,
	) -> Self {
		Self {
			id: Uuid::new_v4(),
			entity_id: entity.id.clone(),
			entity_type: entity.entity_type,
			source_system: entity.source.source_type,
			operation,
			timestamp: Utc::now(),
			previous_version,
			current_version: entity.clone(),
			changed_fields,
			target_systems,
			priority: priority.clamp(1, 10),
		}
	}
}
