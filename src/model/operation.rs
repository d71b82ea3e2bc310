use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use super::Severity;
use super::change::ChangeOperation;
use super::entity::{EntityType, UnifiedEntity};
use super::record::SourceSystem;

/// Lifecycle status of a sync operation.
///
/// `pending -> processing -> {completed | failed | conflicted}`; a failed
/// operation with retries remaining re-enters `pending` after backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
	Pending,
	Processing,
	Completed,
	Failed,
	Conflicted,
	Cancelled,
}

impl OperationStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			OperationStatus::Pending => "pending",
			OperationStatus::Processing => "processing",
			OperationStatus::Completed => "completed",
			OperationStatus::Failed => "failed",
			OperationStatus::Conflicted => "conflicted",
			OperationStatus::Cancelled => "cancelled",
		}
	}

	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			OperationStatus::Completed
				| OperationStatus::Failed
				| OperationStatus::Conflicted
				| OperationStatus::Cancelled
		)
	}
}

impl fmt::Display for OperationStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// Broad classification of a sync failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
	Network,
	Validation,
	Conflict,
	System,
	Permission,
}

impl SyncErrorKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			SyncErrorKind::Network => "network",
			SyncErrorKind::Validation => "validation",
			SyncErrorKind::Conflict => "conflict",
			SyncErrorKind::System => "system",
			SyncErrorKind::Permission => "permission",
		}
	}
}

impl fmt::Display for SyncErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// A classified failure raised while executing a sync operation.
///
/// `recoverable` reflects the error code alone; whether a retry actually
/// happens also depends on the retry policy and remaining attempts.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code} ({kind}): {message}")]
pub struct SyncError {
	pub code: String,
	pub kind: SyncErrorKind,
	pub message: String,
	pub severity: Severity,
	pub recoverable: bool,
}

impl SyncError {
	pub fn new(
		code: impl Into<String>,
		kind: SyncErrorKind,
		message: impl Into<String>,
	) -> Self {
		Self {
			code: code.into(),
			kind,
			message: message.into(),
			severity: Severity::Error,
			recoverable: false,
		}
	}

	pub fn with_severity(mut self, severity: Severity) -> Self {
		self.severity = severity;
		self
	}

	pub fn recoverable(mut self) -> Self {
		self.recoverable = true;
		self
	}

	/// Writes targeting an entity type outside the system's whitelist.
	pub fn unsupported_entity(system: SourceSystem, entity_type: EntityType) -> Self {
		Self::new(
			"UNSUPPORTED_ENTITY",
			SyncErrorKind::Validation,
			format!("target system {system} does not accept {entity_type} entities"),
		)
	}

	pub fn timeout(target: SourceSystem) -> Self {
		Self::new(
			"NETWORK_TIMEOUT",
			SyncErrorKind::Network,
			format!("write to {target} timed out"),
		)
		.recoverable()
	}
}

/// A unit of work propagating one change event to one target system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
	pub id: Uuid,
	pub change_event_id: Uuid,
	pub entity_id: String,
	pub entity_type: EntityType,
	pub source_system: SourceSystem,
	pub target_system: SourceSystem,
	pub operation: ChangeOperation,
	pub source_entity: UnifiedEntity,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub target_entity: Option<UnifiedEntity>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expected_target_state: Option<UnifiedEntity>,
	pub status: OperationStatus,
	/// Scheduling priority inherited from the originating change event.
	pub priority: u8,
	pub attempts: u32,
	pub max_attempts: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_error: Option<SyncError>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub started_at: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub completed_at: Option<DateTime<Utc>>,
}

impl SyncOperation {
	pub fn new(
		change_event_id: Uuid,
		target_system: SourceSystem,
		operation: ChangeOperation,
		source_entity: UnifiedEntity,
		priority: u8,
		max_attempts: u32,
	) -> Self {
		let now = Utc::now();
		Self {
			id: Uuid::new_v4(),
			change_event_id,
			entity_id: source_entity.id.clone(),
			entity_type: source_entity.entity_type,
			source_system: source_entity.source.source_type,
			target_system,
			operation,
			source_entity,
			target_entity: None,
			expected_target_state: None,
			status: OperationStatus::Pending,
			priority: priority.clamp(1, 10),
			attempts: 0,
			max_attempts,
			last_error: None,
			created_at: now,
			updated_at: now,
			started_at: None,
			completed_at: None,
		}
	}

	/// Key under which duplicate pending operations are suppressed.
	pub fn dedup_key(&self) -> (String, SourceSystem, ChangeOperation) {
		(self.entity_id.clone(), self.target_system, self.operation)
	}

	pub fn mark_processing(&mut self) {
		self.status = OperationStatus::Processing;
		self.started_at = Some(Utc::now());
		self.updated_at = Utc::now();
	}

	pub fn mark_completed(&mut self) {
		self.status = OperationStatus::Completed;
		self.completed_at = Some(Utc::now());
		self.updated_at = Utc::now();
	}

	pub fn mark_failed(&mut self, error: SyncError) {
		self.status = OperationStatus::Failed;
		self.last_error = Some(error);
		self.completed_at = Some(Utc::now());
		self.updated_at = Utc::now();
	}

	pub fn mark_conflicted(&mut self) {
		self.status = OperationStatus::Conflicted;
		self.updated_at = Utc::now();
	}

	pub fn mark_cancelled(&mut self) {
		self.status = OperationStatus::Cancelled;
		self.updated_at = Utc::now();
	}

	/// Back to pending without an error, e.g. after manual conflict
	/// resolution re-enqueues the operation.
	pub fn mark_pending(&mut self) {
		self.status = OperationStatus::Pending;
		self.updated_at = Utc::now();
	}

	/// Return to the queue after a recoverable failure.
	pub fn mark_retrying(&mut self, error: SyncError) {
		self.status = OperationStatus::Pending;
		self.last_error = Some(error);
		self.updated_at = Utc::now();
	}

	pub fn retries_remaining(&self) -> bool {
		self.attempts < self.max_attempts
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn terminal_statuses() {
		assert!(OperationStatus::Completed.is_terminal());
		assert!(OperationStatus::Conflicted.is_terminal());
		assert!(OperationStatus::Cancelled.is_terminal());
		assert!(!OperationStatus::Pending.is_terminal());
		assert!(!OperationStatus::Processing.is_terminal());
	}

	#[test]
	fn sync_error_builders() {
		let err = SyncError::new("RATE_LIMITED", SyncErrorKind::System, "slow down")
			.with_severity(Severity::Warning)
			.recoverable();
		assert!(err.recoverable);
		assert_eq!(err.severity, Severity::Warning);
		assert_eq!(err.to_string(), "RATE_LIMITED (system): slow down");
	}
}
