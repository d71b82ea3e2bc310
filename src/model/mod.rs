pub mod change;
pub mod conflict;
pub mod entity;
pub mod operation;
pub mod record;

pub use change::{ChangeEvent, ChangeOperation};
pub use conflict::{
	ConflictType, ConflictedField, ResolutionStatus, ResolutionStrategy, SyncConflict,
};
pub use entity::{EntityPriority, EntityStatus, EntityType, Provenance, UnifiedEntity};
pub use operation::{OperationStatus, SyncError, SyncErrorKind, SyncOperation};
pub use record::{RawRecord, RecordQuality, SourceSystem};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity attached to validation findings and sync errors.
///
/// Warnings never block an operation on their own; errors and criticals do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
	Warning,
	Error,
	Critical,
}

impl Severity {
	pub fn as_str(&self) -> &'static str {
		match self {
			Severity::Warning => "warning",
			Severity::Error => "error",
			Severity::Critical => "critical",
		}
	}

	/// Whether a finding of this severity fails the surrounding operation.
	pub fn is_blocking(&self) -> bool {
		matches!(self, Severity::Error | Severity::Critical)
	}
}

impl fmt::Display for Severity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}
