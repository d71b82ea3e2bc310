use chrono::Duration;
use log::{debug, info, warn};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::{ConflictSettings, EntityTypeSettings};
use crate::events::{EventBus, SyncEvent};
use crate::mapping::path;
use crate::model::{
	ChangeOperation, ConflictType, ConflictedField, EntityType, ResolutionStrategy,
	SyncConflict, SyncOperation, UnifiedEntity,
};
use crate::observability::MetricsRegistry;
use crate::store::EntityStore;

/// Fields whose divergence always counts as a conflict.
const CRITICAL_FIELDS: [&str; 7] = [
	"status",
	"priority",
	"title",
	"progress",
	"scores",
	"kpiImpact",
	"expectedResults",
];

/// Status regressions a sync operation may never apply automatically,
/// read as (current target status, proposed source status).
const ILLEGAL_TRANSITIONS: [(crate::model::EntityStatus, crate::model::EntityStatus); 3] = [
	(
		crate::model::EntityStatus::Completed,
		crate::model::EntityStatus::Draft,
	),
	(
		crate::model::EntityStatus::Cancelled,
		crate::model::EntityStatus::Active,
	),
	(
		crate::model::EntityStatus::Archived,
		crate::model::EntityStatus::Active,
	),
];

/// Escalation priorities per detection pass.
const FIELD_CONFLICT_PRIORITY: u8 = 5;
const VERSION_CONFLICT_PRIORITY: u8 = 6;
const KPI_SWING_PRIORITY: u8 = 7;
const STATUS_REGRESSION_PRIORITY: u8 = 8;
const DEPENDENCY_PRIORITY: u8 = 9;

type CustomResolverFn =
	dyn Fn(&SyncConflict, &UnifiedEntity, &UnifiedEntity) -> Option<UnifiedEntity> + Send + Sync;

/// Detects conflicts between the proposed and existing target-side version
/// of an entity and, where policy allows, resolves them automatically.
pub struct ConflictResolver {
	settings: ConflictSettings,
	store: Arc<EntityStore>,
	bus: EventBus,
	metrics: Arc<MetricsRegistry>,
	/// Per-entity-type strategy overrides, replacing the built-in table.
	strategy_rules: RwLock<HashMap<EntityType, ResolutionStrategy>>,
	custom_resolvers: RwLock<HashMap<EntityType, Arc<CustomResolverFn>>>,
	/// Configured per-type settings; their critical fields extend the
	/// built-in set.
	type_settings: HashMap<String, EntityTypeSettings>,
}

impl ConflictResolver {
	pub fn new(
		settings: ConflictSettings,
		store: Arc<EntityStore>,
		bus: EventBus,
		metrics: Arc<MetricsRegistry>,
	) -> Self {
		Self {
			settings,
			store,
			bus,
			metrics,
			strategy_rules: RwLock::new(HashMap::new()),
			custom_resolvers: RwLock::new(HashMap::new()),
			type_settings: HashMap::new(),
		}
	}

	pub fn with_entity_type_settings(
		mut self,
		type_settings: HashMap<String, EntityTypeSettings>,
	) -> Self {
		self.type_settings = type_settings;
		self
	}

	/// The critical field set for a type: the built-in list plus any
	/// configured additions.
	fn critical_fields(&self, entity_type: EntityType) -> Vec<String> {
		let mut fields: Vec<String> = CRITICAL_FIELDS.iter().map(|f| f.to_string()).collect();
		if let Some(settings) = self.type_settings.get(entity_type.as_str()) {
			for field in &settings.critical_fields {
				if !fields.contains(field) {
					fields.push(field.clone());
				}
			}
		}
		fields
	}

	/// Override the default strategy for an entity type.
	pub fn register_rule(&self, entity_type: EntityType, strategy: ResolutionStrategy) {
		self.strategy_rules
			.write()
			.expect("strategy rules lock poisoned")
			.insert(entity_type, strategy);
	}

	/// Register the resolver backing the `custom` strategy for a type.
	pub fn register_custom_resolver<F>(&self, entity_type: EntityType, resolver: F)
	where
		F: Fn(&SyncConflict, &UnifiedEntity, &UnifiedEntity) -> Option<UnifiedEntity>
			+ Send
			+ Sync
			+ 'static,
	{
		self.custom_resolvers
			.write()
			.expect("custom resolvers lock poisoned")
			.insert(entity_type, Arc::new(resolver));
	}

	/// The strategy applied to ordinary (non-forced) conflicts of a type.
	pub fn default_strategy(&self, entity_type: EntityType) -> ResolutionStrategy {
		if let Some(strategy) = self
			.strategy_rules
			.read()
			.expect("strategy rules lock poisoned")
			.get(&entity_type)
		{
			return *strategy;
		}
		match entity_type {
			EntityType::Kpi | EntityType::Task => ResolutionStrategy::LatestWins,
			EntityType::Project => ResolutionStrategy::MergeFields,
			EntityType::Event | EntityType::Recommendation => ResolutionStrategy::SourceWins,
			_ => self.settings.default_strategy,
		}
	}

	/// Run the three detection passes against a prospective operation and
	/// concatenate the results. Create operations have no prior target
	/// version, so nothing to conflict with.
	pub async fn detect_conflicts(&self, operation: &SyncOperation) -> Vec<SyncConflict> {
		if operation.operation == ChangeOperation::Create {
			return Vec::new();
		}

		let mut conflicts = Vec::new();
		if let Some(target) = &operation.target_entity {
			conflicts.extend(self.detect_basic(operation, target));
			conflicts.extend(self.detect_business_rules(operation, target));
		}
		conflicts.extend(self.detect_dependencies(operation).await);

		for conflict in &conflicts {
			self.metrics.conflicts_detected_total.inc();
			self.bus.publish(
				"resolver",
				SyncEvent::ConflictDetected {
					conflict_id: conflict.id,
					operation_id: operation.id,
					entity_id: conflict.entity_id.clone(),
					conflict_type: conflict.conflict_type,
					strategy: conflict.resolution_strategy,
				},
			);
		}
		conflicts
	}

	/// Version and critical-field comparison.
	fn detect_basic(
		&self,
		operation: &SyncOperation,
		target: &UnifiedEntity,
	) -> Vec<SyncConflict> {
		let source = &operation.source_entity;
		let mut conflicts = Vec::new();

		// Version conflict: both sides touched by different actors within
		// the configured window.
		let gap = (source.updated_at - target.updated_at).abs();
		let concurrent = gap <= Duration::milliseconds(self.settings.time_threshold_ms);
		let different_actors = match (&source.updated_by, &target.updated_by) {
			(Some(a), Some(b)) => a != b,
			_ => false,
		};
		if concurrent && different_actors {
			debug!(
				"version conflict on {}: concurrent updates {}ms apart",
				source.id,
				gap.num_milliseconds()
			);
			conflicts.push(SyncConflict::new(
				operation.id,
				source.id.clone(),
				source.entity_type,
				ConflictType::Version,
				Vec::new(),
				self.default_strategy(source.entity_type),
				VERSION_CONFLICT_PRIORITY,
			));
		}

		// Field conflicts over the critical set.
		let mut fields = Vec::new();
		for field in self.critical_fields(source.entity_type) {
			let source_value = source.field_value(&field);
			let target_value = target.field_value(&field);
			let (Some(sv), Some(tv)) = (source_value, target_value) else {
				continue;
			};
			if sv == tv {
				continue;
			}
			if is_tolerated_numeric_drift(&field, &sv, &tv, self.settings.numeric_tolerance) {
				continue;
			}
			fields.push(ConflictedField {
				field,
				source_value: sv,
				target_value: tv,
				source_modified: source.updated_at,
				target_modified: target.updated_at,
			});
		}
		if !fields.is_empty() {
			conflicts.push(SyncConflict::new(
				operation.id,
				source.id.clone(),
				source.entity_type,
				ConflictType::Field,
				fields,
				self.default_strategy(source.entity_type),
				FIELD_CONFLICT_PRIORITY,
			));
		}

		conflicts
	}

	/// Domain rules: status regressions and outsized KPI swings are always
	/// manual, regardless of the per-type strategy table.
	fn detect_business_rules(
		&self,
		operation: &SyncOperation,
		target: &UnifiedEntity,
	) -> Vec<SyncConflict> {
		let source = &operation.source_entity;
		let mut conflicts = Vec::new();

		if ILLEGAL_TRANSITIONS.contains(&(target.status, source.status)) {
			warn!(
				"illegal status transition {} -> {} proposed for {}",
				target.status, source.status, source.id
			);
			conflicts.push(SyncConflict::new(
				operation.id,
				source.id.clone(),
				source.entity_type,
				ConflictType::BusinessRule,
				vec![ConflictedField {
					field: "status".to_string(),
					source_value: json!(source.status),
					target_value: json!(target.status),
					source_modified: source.updated_at,
					target_modified: target.updated_at,
				}],
				ResolutionStrategy::Manual,
				STATUS_REGRESSION_PRIORITY,
			));
		}

		let swings = kpi_swings(source, target, self.settings.kpi_delta_threshold);
		if !swings.is_empty() {
			warn!(
				"KPI swing above {} detected for {} on {:?}",
				self.settings.kpi_delta_threshold,
				source.id,
				swings.iter().map(|f| f.field.as_str()).collect::<Vec<_>>()
			);
			conflicts.push(SyncConflict::new(
				operation.id,
				source.id.clone(),
				source.entity_type,
				ConflictType::BusinessRule,
				swings,
				ResolutionStrategy::Manual,
				KPI_SWING_PRIORITY,
			));
		}

		conflicts
	}

	/// Deletes are held back while other entities still depend on the
	/// target.
	async fn detect_dependencies(&self, operation: &SyncOperation) -> Vec<SyncConflict> {
		if operation.operation != ChangeOperation::Delete {
			return Vec::new();
		}
		let dependents = self.store.dependents_of(&operation.entity_id).await;
		if dependents.is_empty() {
			return Vec::new();
		}

		warn!(
			"delete of {} blocked: {} dependent entities",
			operation.entity_id,
			dependents.len()
		);
		vec![SyncConflict::new(
			operation.id,
			operation.entity_id.clone(),
			operation.entity_type,
			ConflictType::Dependency,
			dependents
				.into_iter()
				.map(|dependent| ConflictedField {
					field: "dependencies".to_string(),
					source_value: json!(operation.entity_id),
					target_value: json!(dependent),
					source_modified: operation.source_entity.updated_at,
					target_modified: operation.source_entity.updated_at,
				})
				.collect(),
			ResolutionStrategy::Manual,
			DEPENDENCY_PRIORITY,
		)]
	}

	/// Attempt to resolve every conflict in the batch. Returns true only if
	/// all of them resolved; a single manual conflict leaves the batch (and
	/// the calling operation) unresolved.
	pub fn resolve_conflicts(
		&self,
		operation: &mut SyncOperation,
		conflicts: &mut [SyncConflict],
	) -> bool {
		let mut all_resolved = true;

		for conflict in conflicts.iter_mut() {
			let target = operation.target_entity.clone();
			match self.resolve_one(conflict, &operation.source_entity, target.as_ref()) {
				Some(resolved) => {
					info!(
						"conflict {} on {} resolved via {}",
						conflict.id, conflict.entity_id, conflict.resolution_strategy
					);
					self.metrics.conflicts_resolved_total.inc();
					self.bus.publish(
						"resolver",
						SyncEvent::ConflictResolved {
							conflict_id: conflict.id,
							operation_id: operation.id,
							entity_id: conflict.entity_id.clone(),
							strategy: conflict.resolution_strategy,
						},
					);
					conflict.mark_resolved(resolved.clone(), "auto");
					// The resolved entity becomes the payload the operation
					// will write.
					operation.source_entity = resolved;
				}
				None => {
					self.metrics.conflicts_escalated_total.inc();
					conflict.mark_escalated();
					all_resolved = false;
				}
			}
		}

		all_resolved
	}

	fn resolve_one(
		&self,
		conflict: &SyncConflict,
		source: &UnifiedEntity,
		target: Option<&UnifiedEntity>,
	) -> Option<UnifiedEntity> {
		match conflict.resolution_strategy {
			ResolutionStrategy::Manual => None,
			ResolutionStrategy::SourceWins => Some(source.clone()),
			ResolutionStrategy::TargetWins => {
				Some(target.cloned().unwrap_or_else(|| source.clone()))
			}
			ResolutionStrategy::LatestWins => Some(latest_wins(conflict, source, target)),
			ResolutionStrategy::MergeFields => Some(merge_fields(conflict, source, target)),
			ResolutionStrategy::Custom => {
				let resolver = self
					.custom_resolvers
					.read()
					.expect("custom resolvers lock poisoned")
					.get(&conflict.entity_type)
					.cloned();
				match (resolver, target) {
					(Some(custom), Some(target_entity)) => {
						custom(conflict, source, target_entity)
							.or_else(|| Some(latest_wins(conflict, source, target)))
					}
					_ => Some(latest_wins(conflict, source, target)),
				}
			}
		}
	}

	/// Close a conflict by hand, supplying the entity that should win.
	pub fn resolve_manually(
		&self,
		conflict: &mut SyncConflict,
		winner: UnifiedEntity,
		resolved_by: &str,
	) {
		self.metrics.conflicts_resolved_total.inc();
		self.bus.publish(
			"resolver",
			SyncEvent::ConflictResolved {
				conflict_id: conflict.id,
				operation_id: conflict.operation_id,
				entity_id: conflict.entity_id.clone(),
				strategy: conflict.resolution_strategy,
			},
		);
		conflict.mark_resolved(winner, resolved_by);
	}
}

/// Whether a numeric divergence on a score/progress field stays inside the
/// configured tolerance.
fn is_tolerated_numeric_drift(field: &str, source: &Value, target: &Value, tolerance: f64) -> bool {
	if !(field.contains("score") || field.contains("progress")) {
		return false;
	}
	match (source.as_f64(), target.as_f64()) {
		(Some(a), Some(b)) => (a - b).abs() <= tolerance,
		_ => false,
	}
}

/// KPI axes whose values moved more than the configured delta.
fn kpi_swings(source: &UnifiedEntity, target: &UnifiedEntity, threshold: f64) -> Vec<ConflictedField> {
	let (Some(source_scores), Some(target_scores)) = (
		source.field_value("scores").and_then(|v| v.as_object().cloned()),
		target.field_value("scores").and_then(|v| v.as_object().cloned()),
	) else {
		return Vec::new();
	};

	let mut swings = Vec::new();
	for (axis, source_value) in &source_scores {
		let (Some(a), Some(b)) = (
			source_value.as_f64(),
			target_scores.get(axis).and_then(Value::as_f64),
		) else {
			continue;
		};
		if (a - b).abs() > threshold {
			swings.push(ConflictedField {
				field: format!("scores.{axis}"),
				source_value: json!(a),
				target_value: json!(b),
				source_modified: source.updated_at,
				target_modified: target.updated_at,
			});
		}
	}
	swings
}

/// Per conflicted field, take the side with the strictly newer modification
/// stamp; ties favor the source. Without field detail the newer entity wins
/// wholesale.
fn latest_wins(
	conflict: &SyncConflict,
	source: &UnifiedEntity,
	target: Option<&UnifiedEntity>,
) -> UnifiedEntity {
	let Some(target) = target else {
		return source.clone();
	};

	if conflict.conflicted_fields.is_empty() {
		return if target.updated_at > source.updated_at {
			target.clone()
		} else {
			source.clone()
		};
	}

	let mut value = source.to_value();
	for field in &conflict.conflicted_fields {
		if field.target_modified > field.source_modified {
			path::set(&mut value, &field.field, field.target_value.clone());
		}
	}
	rebuild(value, source)
}

/// Field-wise merge: arrays union, objects shallow-merge with source
/// precedence, numeric score/progress fields average, everything else keeps
/// the source value.
fn merge_fields(
	conflict: &SyncConflict,
	source: &UnifiedEntity,
	target: Option<&UnifiedEntity>,
) -> UnifiedEntity {
	let Some(_target) = target else {
		return source.clone();
	};

	let mut value = source.to_value();
	for field in &conflict.conflicted_fields {
		let merged = merge_value(&field.field, &field.source_value, &field.target_value);
		path::set(&mut value, &field.field, merged);
	}
	rebuild(value, source)
}

fn merge_value(field: &str, source: &Value, target: &Value) -> Value {
	match (source, target) {
		(Value::Array(a), Value::Array(b)) => {
			let mut merged = a.clone();
			for item in b {
				if !merged.contains(item) {
					merged.push(item.clone());
				}
			}
			Value::Array(merged)
		}
		(Value::Object(a), Value::Object(b)) => {
			// Source keys take precedence on collision.
			let mut merged: Map<String, Value> = b.clone();
			for (key, item) in a {
				merged.insert(key.clone(), item.clone());
			}
			Value::Object(merged)
		}
		(sa, ta) if field.contains("score") || field.contains("progress") => {
			match (sa.as_f64(), ta.as_f64()) {
				(Some(a), Some(b)) => json!(((a + b) / 2.0).round()),
				_ => source.clone(),
			}
		}
		_ => source.clone(),
	}
}

/// Deserialize a merged JSON value back into an entity, falling back to the
/// source side if the merge produced an unusable shape.
fn rebuild(value: Value, source: &UnifiedEntity) -> UnifiedEntity {
	match serde_json::from_value::<UnifiedEntity>(value) {
		Ok(entity) => entity,
		Err(e) => {
			warn!("merged entity for {} is malformed, keeping source: {e}", source.id);
			source.clone()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{
		EntityPriority, EntityStatus, Provenance, ResolutionStatus, SourceSystem,
	};
	use chrono::Utc;
	use uuid::Uuid;

	fn entity(id: &str, entity_type: EntityType, status: EntityStatus) -> UnifiedEntity {
		let now = Utc::now();
		UnifiedEntity {
			id: id.to_string(),
			entity_type,
			title: "Atlas".to_string(),
			description: None,
			status,
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

	fn operation(source: UnifiedEntity, target: Option<UnifiedEntity>, op: ChangeOperation) -> SyncOperation {
		let mut operation = SyncOperation::new(
			Uuid::new_v4(),
			SourceSystem::Buildup,
			op,
			source,
			5,
			3,
		);
		operation.target_entity = target;
		operation
	}

	fn resolver() -> ConflictResolver {
		ConflictResolver::new(
			ConflictSettings::default(),
			Arc::new(EntityStore::new()),
			EventBus::new(64),
			Arc::new(MetricsRegistry::new()),
		)
	}

	#[tokio::test]
	async fn create_operations_never_conflict() {
		let resolver = resolver();
		let source = entity("e1", EntityType::Project, EntityStatus::Draft);
		let target = entity("e1", EntityType::Project, EntityStatus::Completed);
		let op = operation(source, Some(target), ChangeOperation::Create);
		assert!(resolver.detect_conflicts(&op).await.is_empty());
	}

	#[tokio::test]
	async fn completed_to_draft_is_a_manual_business_rule_conflict() {
		let resolver = resolver();
		let source = entity("e1", EntityType::Project, EntityStatus::Draft);
		let target = entity("e1", EntityType::Project, EntityStatus::Completed);
		let op = operation(source, Some(target), ChangeOperation::Update);

		let conflicts = resolver.detect_conflicts(&op).await;
		let rule = conflicts
			.iter()
			.find(|c| c.conflict_type == ConflictType::BusinessRule)
			.expect("business rule conflict");
		assert_eq!(rule.resolution_strategy, ResolutionStrategy::Manual);
		assert_eq!(rule.priority, 8);

		let mut op = op;
		let mut conflicts = conflicts;
		assert!(!resolver.resolve_conflicts(&mut op, &mut conflicts));
		assert!(
			conflicts
				.iter()
				.any(|c| c.resolution_status == ResolutionStatus::Escalated)
		);
	}

	#[tokio::test]
	async fn numeric_drift_within_tolerance_is_ignored() {
		let resolver = resolver();
		let mut source = entity("e1", EntityType::Task, EntityStatus::Active);
		source.extra.insert("progress".to_string(), json!(50));
		let mut target = entity("e1", EntityType::Task, EntityStatus::Active);
		target.extra.insert("progress".to_string(), json!(54));

		let op = operation(source.clone(), Some(target), ChangeOperation::Update);
		let conflicts = resolver.detect_conflicts(&op).await;
		assert!(
			conflicts.is_empty(),
			"4-unit drift is inside the 5-unit tolerance: {conflicts:?}"
		);

		let mut far_target = entity("e1", EntityType::Task, EntityStatus::Active);
		far_target.extra.insert("progress".to_string(), json!(60));
		let op = operation(source, Some(far_target), ChangeOperation::Update);
		let conflicts = resolver.detect_conflicts(&op).await;
		assert_eq!(conflicts.len(), 1);
		assert_eq!(conflicts[0].conflict_type, ConflictType::Field);
	}

	#[tokio::test]
	async fn kpi_swing_above_threshold_goes_manual() {
		let resolver = resolver();
		let mut source = entity("k1", EntityType::Kpi, EntityStatus::Active);
		source
			.extra
			.insert("scores".to_string(), json!({"quality": 90.0}));
		let mut target = entity("k1", EntityType::Kpi, EntityStatus::Active);
		target
			.extra
			.insert("scores".to_string(), json!({"quality": 40.0}));

		let op = operation(source, Some(target), ChangeOperation::Update);
		let conflicts = resolver.detect_conflicts(&op).await;
		let swing = conflicts
			.iter()
			.find(|c| c.priority == 7)
			.expect("kpi swing conflict");
		assert_eq!(swing.resolution_strategy, ResolutionStrategy::Manual);
		assert_eq!(swing.conflicted_fields[0].field, "scores.quality");
	}

	#[tokio::test]
	async fn delete_with_dependents_is_escalated() {
		let store = Arc::new(EntityStore::new());
		let base = entity("base", EntityType::Project, EntityStatus::Active);
		store.upsert(base.clone()).await.unwrap();
		let mut child = entity("child", EntityType::Task, EntityStatus::Active);
		child
			.metadata
			.insert("dependencies".to_string(), json!(["base"]));
		store.upsert(child).await.unwrap();

		let resolver = ConflictResolver::new(
			ConflictSettings::default(),
			store,
			EventBus::new(64),
			Arc::new(MetricsRegistry::new()),
		);

		let op = operation(base, None, ChangeOperation::Delete);
		let conflicts = resolver.detect_conflicts(&op).await;
		assert_eq!(conflicts.len(), 1);
		assert_eq!(conflicts[0].conflict_type, ConflictType::Dependency);
		assert_eq!(conflicts[0].priority, 9);
		assert_eq!(conflicts[0].resolution_strategy, ResolutionStrategy::Manual);
	}

	#[tokio::test]
	async fn version_conflict_requires_distinct_actors_in_window() {
		let resolver = resolver();
		let mut source = entity("e1", EntityType::Event, EntityStatus::Active);
		source.updated_by = Some("alice".to_string());
		let mut target = entity("e1", EntityType::Event, EntityStatus::Active);
		target.updated_by = Some("bob".to_string());

		let op = operation(source.clone(), Some(target.clone()), ChangeOperation::Update);
		let conflicts = resolver.detect_conflicts(&op).await;
		assert!(
			conflicts
				.iter()
				.any(|c| c.conflict_type == ConflictType::Version)
		);

		// Same actor on both sides is not a version conflict.
		target.updated_by = Some("alice".to_string());
		let op = operation(source, Some(target), ChangeOperation::Update);
		let conflicts = resolver.detect_conflicts(&op).await;
		assert!(
			!conflicts
				.iter()
				.any(|c| c.conflict_type == ConflictType::Version)
		);
	}

	#[test]
	fn latest_wins_picks_newer_per_field_with_source_tie_break() {
		let now = Utc::now();
		let source = entity("e1", EntityType::Task, EntityStatus::Active);
		let target = entity("e1", EntityType::Task, EntityStatus::Completed);

		let mut conflict = SyncConflict::new(
			Uuid::new_v4(),
			"e1",
			EntityType::Task,
			ConflictType::Field,
			vec![
				ConflictedField {
					field: "title".to_string(),
					source_value: json!("Atlas"),
					target_value: json!("Atlas (target)"),
					source_modified: now,
					target_modified: now + Duration::seconds(5),
				},
				ConflictedField {
					field: "status".to_string(),
					source_value: json!("active"),
					target_value: json!("completed"),
					source_modified: now,
					target_modified: now,
				},
			],
			ResolutionStrategy::LatestWins,
			5,
		);

		let resolved = latest_wins(&conflict, &source, Some(&target));
		// Target is newer on title, so its value lands; the status tie
		// keeps the source side.
		assert_eq!(resolved.title, "Atlas (target)");
		assert_eq!(resolved.status, EntityStatus::Active);

		// Strictly newer source keeps everything.
		for field in &mut conflict.conflicted_fields {
			field.source_modified = now + Duration::seconds(10);
		}
		let resolved = latest_wins(&conflict, &source, Some(&target));
		assert_eq!(resolved.title, "Atlas");
	}

	#[test]
	fn merge_fields_combines_arrays_objects_and_numbers() {
		assert_eq!(
			merge_value("tags", &json!(["a", "b"]), &json!(["b", "c"])),
			json!(["a", "b", "c"])
		);
		assert_eq!(
			merge_value(
				"kpiImpact",
				&json!({"x": 1, "shared": "source"}),
				&json!({"y": 2, "shared": "target"})
			),
			json!({"x": 1, "y": 2, "shared": "source"})
		);
		assert_eq!(merge_value("progress", &json!(40), &json!(61)), json!(51.0));
		assert_eq!(merge_value("title", &json!("a"), &json!("b")), json!("a"));
	}

	#[tokio::test]
	async fn resolution_rewrites_the_operation_payload() {
		let resolver = resolver();
		let mut source = entity("e1", EntityType::Project, EntityStatus::Active);
		source.tags = vec!["core".to_string()];
		let mut target = entity("e1", EntityType::Project, EntityStatus::Active);
		target.tags = vec!["infra".to_string()];
		target.title = "Atlas (remote)".to_string();

		let mut op = operation(source, Some(target), ChangeOperation::Update);
		let mut conflicts = resolver.detect_conflicts(&op).await;
		assert!(!conflicts.is_empty());

		// Projects default to merge_fields.
		assert!(resolver.resolve_conflicts(&mut op, &mut conflicts));
		assert!(
			conflicts
				.iter()
				.all(|c| c.resolution_status == ResolutionStatus::Resolved)
		);
		assert_eq!(op.source_entity.title, "Atlas");
	}

	#[tokio::test]
	async fn configured_critical_fields_extend_the_builtin_set() {
		let mut type_settings = HashMap::new();
		type_settings.insert(
			"task".to_string(),
			EntityTypeSettings {
				critical_fields: vec!["metadata.due_at".to_string()],
				..EntityTypeSettings::default()
			},
		);
		let resolver = resolver().with_entity_type_settings(type_settings);

		let mut source = entity("t1", EntityType::Task, EntityStatus::Active);
		source
			.metadata
			.insert("due_at".to_string(), json!("2026-08-20"));
		let mut target = entity("t1", EntityType::Task, EntityStatus::Active);
		target
			.metadata
			.insert("due_at".to_string(), json!("2026-09-01"));

		let op = operation(source, Some(target), ChangeOperation::Update);
		let conflicts = resolver.detect_conflicts(&op).await;
		assert_eq!(conflicts.len(), 1);
		assert_eq!(conflicts[0].conflicted_fields[0].field, "metadata.due_at");
	}

	#[test]
	fn strategy_table_defaults_and_overrides() {
		let resolver = resolver();
		assert_eq!(
			resolver.default_strategy(EntityType::Kpi),
			ResolutionStrategy::LatestWins
		);
		assert_eq!(
			resolver.default_strategy(EntityType::Project),
			ResolutionStrategy::MergeFields
		);
		assert_eq!(
			resolver.default_strategy(EntityType::Event),
			ResolutionStrategy::SourceWins
		);

		resolver.register_rule(EntityType::Project, ResolutionStrategy::TargetWins);
		assert_eq!(
			resolver.default_strategy(EntityType::Project),
			ResolutionStrategy::TargetWins
		);
	}

	#[test]
	fn custom_strategy_falls_back_to_latest_wins() {
		let resolver = resolver();
		let source = entity("e1", EntityType::Milestone, EntityStatus::Active);
		let mut target = entity("e1", EntityType::Milestone, EntityStatus::Active);
		target.title = "Newer".to_string();
		target.updated_at = source.updated_at + Duration::seconds(30);

		let conflict = SyncConflict::new(
			Uuid::new_v4(),
			"e1",
			EntityType::Milestone,
			ConflictType::Version,
			Vec::new(),
			ResolutionStrategy::Custom,
			5,
		);

		// No custom resolver registered: latest_wins picks the newer target.
		let resolved = resolver.resolve_one(&conflict, &source, Some(&target)).unwrap();
		assert_eq!(resolved.title, "Newer");

		resolver.register_custom_resolver(EntityType::Milestone, |_, source, _| {
			let mut chosen = source.clone();
			chosen.title = "Custom".to_string();
			Some(chosen)
		});
		let resolved = resolver.resolve_one(&conflict, &source, Some(&target)).unwrap();
		assert_eq!(resolved.title, "Custom");
	}
}
