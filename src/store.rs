use log::debug;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard};

use crate::model::{EntityType, SourceSystem, UnifiedEntity};

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("entity {id}: source system is immutable ({existing} -> {attempted})")]
	SourceSystemChanged {
		id: String,
		existing: SourceSystem,
		attempted: SourceSystem,
	},
}

/// Shared in-memory store of unified entities, keyed by entity id.
///
/// The store is the single writer boundary for entity state: the
/// transformation engine upserts, the change detector and conflict resolver
/// read. Upserts enforce the two entity invariants (immutable source system,
/// monotonically non-decreasing `updated_at`).
#[derive(Default)]
pub struct EntityStore {
	entities: RwLock<HashMap<String, UnifiedEntity>>,
}

impl EntityStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert or update an entity, returning the stored copy.
	pub async fn upsert(&self, mut entity: UnifiedEntity) -> Result<UnifiedEntity, StoreError> {
		let mut entities = self.entities.write().await;
		if let Some(existing) = entities.get(&entity.id) {
			if existing.source.source_type != entity.source.source_type {
				return Err(StoreError::SourceSystemChanged {
					id: entity.id,
					existing: existing.source.source_type,
					attempted: entity.source.source_type,
				});
			}
			// updated_at never moves backwards for a given id.
			if entity.updated_at < existing.updated_at {
				debug!(
					"clamping updated_at for {} to preserve monotonicity",
					entity.id
				);
				entity.updated_at = existing.updated_at;
			}
			entity.source.version = existing.source.version + 1;
		}
		entities.insert(entity.id.clone(), entity.clone());
		Ok(entity)
	}

	pub async fn get(&self, id: &str) -> Option<UnifiedEntity> {
		self.entities.read().await.get(id).cloned()
	}

	pub async fn remove(&self, id: &str) -> Option<UnifiedEntity> {
		self.entities.write().await.remove(id)
	}

	pub async fn all(&self) -> Vec<UnifiedEntity> {
		self.entities.read().await.values().cloned().collect()
	}

	/// Entities originating from one source system.
	pub async fn for_source(&self, source: SourceSystem) -> Vec<UnifiedEntity> {
		self.entities
			.read()
			.await
			.values()
			.filter(|e| e.source.source_type == source)
			.cloned()
			.collect()
	}

	pub async fn for_type(&self, entity_type: EntityType) -> Vec<UnifiedEntity> {
		self.entities
			.read()
			.await
			.values()
			.filter(|e| e.entity_type == entity_type)
			.cloned()
			.collect()
	}

	/// Ids of entities that list `id` among their dependencies.
	pub async fn dependents_of(&self, id: &str) -> Vec<String> {
		self.entities
			.read()
			.await
			.values()
			.filter(|e| {
				e.metadata
					.get("dependencies")
					.and_then(|deps| deps.as_array())
					.is_some_and(|deps| deps.iter().any(|d| d.as_str() == Some(id)))
			})
			.map(|e| e.id.clone())
			.collect()
	}

	/// Read guard over the raw map, for building transform contexts without
	/// cloning the whole store.
	pub async fn read(&self) -> RwLockReadGuard<'_, HashMap<String, UnifiedEntity>> {
		self.entities.read().await
	}

	pub async fn len(&self) -> usize {
		self.entities.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.entities.read().await.is_empty()
	}
}
