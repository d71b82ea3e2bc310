use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::entity::{EntityType, UnifiedEntity};

/// Kind of disagreement detected between the proposed and existing
/// target-side version of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
	/// A critical field carries divergent values on the two sides.
	Field,
	/// Both sides were updated by different actors close together in time.
	Version,
	/// A delete would strand entities that depend on the target.
	Dependency,
	/// The proposed write violates a domain rule (status regression,
	/// outsized KPI swing).
	BusinessRule,
}

impl ConflictType {
	pub fn as_str(&self) -> &'static str {
		match self {
			ConflictType::Field => "field",
			ConflictType::Version => "version",
			ConflictType::Dependency => "dependency",
			ConflictType::BusinessRule => "business_rule",
		}
	}
}

impl fmt::Display for ConflictType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// How a conflict is (or must be) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
	SourceWins,
	TargetWins,
	LatestWins,
	MergeFields,
	Custom,
	Manual,
}

impl ResolutionStrategy {
	pub fn as_str(&self) -> &'static str {
		match self {
			ResolutionStrategy::SourceWins => "source_wins",
			ResolutionStrategy::TargetWins => "target_wins",
			ResolutionStrategy::LatestWins => "latest_wins",
			ResolutionStrategy::MergeFields => "merge_fields",
			ResolutionStrategy::Custom => "custom",
			ResolutionStrategy::Manual => "manual",
		}
	}

	/// Manual conflicts are never auto-resolved; they escalate.
	pub fn is_automatic(&self) -> bool {
		!matches!(self, ResolutionStrategy::Manual)
	}
}

impl fmt::Display for ResolutionStrategy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

impl std::str::FromStr for ResolutionStrategy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"source_wins" => Ok(ResolutionStrategy::SourceWins),
			"target_wins" => Ok(ResolutionStrategy::TargetWins),
			"latest_wins" => Ok(ResolutionStrategy::LatestWins),
			"merge_fields" => Ok(ResolutionStrategy::MergeFields),
			"custom" => Ok(ResolutionStrategy::Custom),
			"manual" => Ok(ResolutionStrategy::Manual),
			_ => Err(format!("unknown resolution strategy: {s}")),
		}
	}
}

/// Where a conflict stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
	Pending,
	Resolved,
	Escalated,
}

impl ResolutionStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			ResolutionStatus::Pending => "pending",
			ResolutionStatus::Resolved => "resolved",
			ResolutionStatus::Escalated => "escalated",
		}
	}
}

impl fmt::Display for ResolutionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// One field on which the two sides disagree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictedField {
	pub field: String,
	pub source_value: Value,
	pub target_value: Value,
	pub source_modified: DateTime<Utc>,
	pub target_modified: DateTime<Utc>,
}

/// A detected disagreement between the proposed and existing target-side
/// version of an entity during sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConflict {
	pub id: Uuid,
	pub operation_id: Uuid,
	pub entity_id: String,
	pub entity_type: EntityType,
	pub conflict_type: ConflictType,
	pub conflicted_fields: Vec<ConflictedField>,
	pub resolution_strategy: ResolutionStrategy,
	pub resolution_status: ResolutionStatus,
	/// Escalation priority in 1..=10; business-rule and dependency
	/// conflicts rank above ordinary field conflicts.
	pub priority: u8,
	pub detected_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resolved_at: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resolved_by: Option<String>,
	/// The entity that resolution decided should be written, when automatic
	/// or manual resolution has produced one.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resolved_entity: Option<UnifiedEntity>,
}

impl SyncConflict {
	pub fn new(
		operation_id: Uuid,
		entity_id: impl Into<String>,
		entity_type: EntityType,
		conflict_type: ConflictType,
		conflicted_fields: Vec<ConflictedField>,
		resolution_strategy: ResolutionStrategy,
		priority: u8,
	) -> Self {
		Self {
			id: Uuid::new_v4(),
			operation_id,
			entity_id: entity_id.into(),
			entity_type,
			conflict_type,
			conflicted_fields,
			resolution_strategy,
			resolution_status: ResolutionStatus::Pending,
			priority: priority.clamp(1, 10),
			detected_at: Utc::now(),
			resolved_at: None,
			resolved_by: None,
			resolved_entity: None,
		}
	}

	pub fn mark_resolved(&mut self, entity: UnifiedEntity, resolved_by: impl Into<String>) {
		self.resolution_status = ResolutionStatus::Resolved;
		self.resolved_entity = Some(entity);
		self.resolved_by = Some(resolved_by.into());
		self.resolved_at = Some(Utc::now());
	}

	pub fn mark_escalated(&mut self) {
		self.resolution_status = ResolutionStatus::Escalated;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strategy_automation() {
		assert!(ResolutionStrategy::LatestWins.is_automatic());
		assert!(ResolutionStrategy::MergeFields.is_automatic());
		assert!(!ResolutionStrategy::Manual.is_automatic());
	}

	#[test]
	fn strategy_roundtrip() {
		for strategy in [
			ResolutionStrategy::SourceWins,
			ResolutionStrategy::TargetWins,
			ResolutionStrategy::LatestWins,
			ResolutionStrategy::MergeFields,
			ResolutionStrategy::Custom,
			ResolutionStrategy::Manual,
		] {
			let parsed: ResolutionStrategy = strategy.as_str().parse().unwrap();
			assert_eq!(strategy, parsed);
		}
	}
}
