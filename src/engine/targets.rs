use async_trait::async_trait;
use log::debug;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{Mutex, RwLock};

use crate::model::{
	ChangeOperation, EntityStatus, SourceSystem, SyncError, SyncOperation, UnifiedEntity,
};

/// Adapter boundary to one external system of record.
///
/// `apply` must validate the operation's entity type against the system's
/// whitelist and fail fast with `UNSUPPORTED_ENTITY` before attempting the
/// write. These calls are the engine's only suspension points.
#[async_trait]
pub trait TargetSystemHandler: Send + Sync {
	fn system(&self) -> SourceSystem;

	/// Current target-side version of an entity, if one exists.
	async fn fetch(&self, entity_id: &str) -> Result<Option<UnifiedEntity>, SyncError>;

	/// Perform the system-specific write for an operation.
	async fn apply(&self, operation: &SyncOperation) -> Result<(), SyncError>;
}

/// Whitelist gate shared by handler implementations.
pub fn ensure_supported(
	system: SourceSystem,
	entity_type: crate::model::EntityType,
) -> Result<(), SyncError> {
	if system.allows(entity_type) {
		Ok(())
	} else {
		Err(SyncError::unsupported_entity(system, entity_type))
	}
}

/// In-memory target system: backs local runs and integration tests, and is
/// wired exactly like a production adapter. Failures can be injected to
/// exercise the retry path.
pub struct InMemoryTargetSystem {
	system: SourceSystem,
	entities: RwLock<HashMap<String, UnifiedEntity>>,
	fail_queue: Mutex<VecDeque<SyncError>>,
}

impl InMemoryTargetSystem {
	pub fn new(system: SourceSystem) -> Self {
		Self {
			system,
			entities: RwLock::new(HashMap::new()),
			fail_queue: Mutex::new(VecDeque::new()),
		}
	}

	/// Pre-populate the target side with an existing entity version.
	pub async fn seed(&self, entity: UnifiedEntity) {
		self.entities.write().await.insert(entity.id.clone(), entity);
	}

	/// The next `apply` call will fail with this error instead of writing.
	pub async fn inject_failure(&self, error: SyncError) {
		self.fail_queue.lock().await.push_back(error);
	}

	pub async fn get(&self, entity_id: &str) -> Option<UnifiedEntity> {
		self.entities.read().await.get(entity_id).cloned()
	}

	pub async fn len(&self) -> usize {
		self.entities.read().await.len()
	}
}

#[async_trait]
impl TargetSystemHandler for InMemoryTargetSystem {
	fn system(&self) -> SourceSystem {
		self.system
	}

	async fn fetch(&self, entity_id: &str) -> Result<Option<UnifiedEntity>, SyncError> {
		Ok(self.entities.read().await.get(entity_id).cloned())
	}

	async fn apply(&self, operation: &SyncOperation) -> Result<(), SyncError> {
		ensure_supported(self.system, operation.entity_type)?;

		if let Some(error) = self.fail_queue.lock().await.pop_front() {
			return Err(error);
		}

		let desired = operation
			.expected_target_state
			.clone()
			.unwrap_or_else(|| operation.source_entity.clone());

		let mut entities = self.entities.write().await;
		match operation.operation {
			ChangeOperation::Create
			| ChangeOperation::Update
			| ChangeOperation::Restore => {
				entities.insert(desired.id.clone(), desired);
			}
			ChangeOperation::Delete => {
				// Soft delete: the target keeps an archived copy.
				match entities.get_mut(&operation.entity_id) {
					Some(existing) => {
						existing.status = EntityStatus::Archived;
						existing.updated_at = desired.updated_at;
					}
					None => {
						entities.insert(desired.id.clone(), desired);
					}
				}
			}
		}

		debug!(
			"{} applied {} for {}",
			self.system, operation.operation, operation.entity_id
		);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{
		EntityPriority, EntityType, Provenance, SyncErrorKind,
	};
	use chrono::Utc;
	use serde_json::{Map, json};
	use uuid::Uuid;

	fn entity(id: &str, entity_type: EntityType) -> UnifiedEntity {
		let now = Utc::now();
		UnifiedEntity {
			id: id.to_string(),
			entity_type,
			title: "Atlas".to_string(),
			description: None,
			status: EntityStatus::Active,
			priority: EntityPriority::Medium,
			created_at: now,
			updated_at: now,
			created_by: None,
			updated_by: None,
			tags: Vec::new(),
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

	fn operation(entity: UnifiedEntity, target: SourceSystem, op: ChangeOperation) -> SyncOperation {
		SyncOperation::new(Uuid::new_v4(), target, op, entity, 5, 3)
	}

	#[tokio::test]
	async fn whitelist_is_enforced() {
		let calendar = InMemoryTargetSystem::new(SourceSystem::Calendar);
		let op = operation(
			entity("k1", EntityType::Kpi),
			SourceSystem::Calendar,
			ChangeOperation::Create,
		);
		let err = calendar.apply(&op).await.unwrap_err();
		assert_eq!(err.code, "UNSUPPORTED_ENTITY");
		assert_eq!(err.kind, SyncErrorKind::Validation);
		assert!(!err.recoverable);
	}

	#[tokio::test]
	async fn create_then_delete_archives() {
		let buildup = InMemoryTargetSystem::new(SourceSystem::Buildup);
		let subject = entity("p1", EntityType::Project);

		buildup
			.apply(&operation(
				subject.clone(),
				SourceSystem::Buildup,
				ChangeOperation::Create,
			))
			.await
			.unwrap();
		assert_eq!(buildup.get("p1").await.unwrap().status, EntityStatus::Active);

		buildup
			.apply(&operation(
				subject,
				SourceSystem::Buildup,
				ChangeOperation::Delete,
			))
			.await
			.unwrap();
		assert_eq!(
			buildup.get("p1").await.unwrap().status,
			EntityStatus::Archived
		);
	}

	#[tokio::test]
	async fn injected_failures_surface_once() {
		let v2 = InMemoryTargetSystem::new(SourceSystem::V2);
		v2.inject_failure(
			SyncError::new("TARGET_UNAVAILABLE", SyncErrorKind::Network, "down").recoverable(),
		)
		.await;

		let op = operation(
			entity("p1", EntityType::Project),
			SourceSystem::V2,
			ChangeOperation::Create,
		);
		assert!(v2.apply(&op).await.is_err());
		assert!(v2.apply(&op).await.is_ok());
	}
}
