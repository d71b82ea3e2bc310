use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::{Duration, Instant, interval};

use crate::config::{DetectionSettings, SchedulingStrategy};
use crate::events::{EventBus, SyncEvent};
use crate::model::{
	ChangeEvent, ChangeOperation, EntityType, SourceSystem, UnifiedEntity,
};
use crate::observability::MetricsRegistry;
use crate::store::EntityStore;

/// Substrings marking a changed field as critical for scheduling purposes.
const CRITICAL_FIELD_MARKERS: [&str; 4] = ["status", "priority", "scores", "progress"];

/// Last known shape of an entity, kept to classify transitions and to
/// populate `previous_version` on emitted events.
#[derive(Debug, Clone)]
struct EntitySnapshot {
	checksum: String,
	last_modified: DateTime<Utc>,
	version: u64,
	entity: UnifiedEntity,
}

/// JSON view of an entity with volatile bookkeeping fields stripped, so a
/// re-transform of identical content hashes identically.
fn content_value(entity: &UnifiedEntity) -> Value {
	let mut value = entity.to_value();
	if let Some(map) = value.as_object_mut() {
		map.remove("updated_at");
		if let Some(source) = map.get_mut("source").and_then(Value::as_object_mut) {
			source.remove("transformed_at");
			source.remove("version");
		}
	}
	value
}

/// SHA-256 content checksum over the canonical JSON of an entity.
pub fn checksum(entity: &UnifiedEntity) -> String {
	let canonical = serde_json::to_string(&content_value(entity)).unwrap_or_default();
	let digest = Sha256::digest(canonical.as_bytes());
	format!("{digest:x}")
}

/// Dotted paths of fields that differ between two JSON values. Objects are
/// walked recursively; arrays and scalars compare as a whole.
pub fn diff_fields(old: &Value, new: &Value) -> Vec<String> {
	let mut out = Vec::new();
	walk_diff("", old, new, &mut out);
	out.sort();
	out
}

fn walk_diff(prefix: &str, old: &Value, new: &Value, out: &mut Vec<String>) {
	match (old, new) {
		(Value::Object(old_map), Value::Object(new_map)) => {
			let mut keys: Vec<&String> = old_map.keys().chain(new_map.keys()).collect();
			keys.sort();
			keys.dedup();
			for key in keys {
				let path = if prefix.is_empty() {
					key.clone()
				} else {
					format!("{prefix}.{key}")
				};
				match (old_map.get(key), new_map.get(key)) {
					(Some(a), Some(b)) => walk_diff(&path, a, b, out),
					(None, Some(_)) | (Some(_), None) => out.push(path),
					(None, None) => {}
				}
			}
		}
		(a, b) => {
			if a != b {
				out.push(prefix.to_string());
			}
		}
	}
}

/// Scheduling priority of a change, in 1..=10.
fn priority_for(
	operation: ChangeOperation,
	entity_type: EntityType,
	changed_fields: &[String],
) -> u8 {
	let mut priority: i32 = 5;
	priority += i32::from(operation.priority_weight());
	priority += match entity_type {
		EntityType::Kpi => 2,
		EntityType::Project | EntityType::Recommendation => 1,
		_ => 0,
	};
	let critical = changed_fields.iter().any(|field| {
		CRITICAL_FIELD_MARKERS
			.iter()
			.any(|marker| field.contains(marker))
	});
	if critical {
		priority += 2;
	}
	priority.clamp(1, 10) as u8
}

/// Target systems a change fans out to: every system except the originator,
/// filtered by each system's entity-type whitelist.
fn fan_out(entity: &UnifiedEntity) -> Vec<SourceSystem> {
	SourceSystem::ALL
		.into_iter()
		.filter(|system| *system != entity.source.source_type)
		.filter(|system| system.allows(entity.entity_type))
		.collect()
}

/// Diffs the unified-entity population against a prior snapshot and emits
/// change events, with per-(entity, operation) deduplication and buffered
/// downstream delivery.
pub struct ChangeDetector {
	store: Arc<EntityStore>,
	bus: EventBus,
	metrics: Arc<MetricsRegistry>,
	settings: DetectionSettings,
	snapshots: RwLock<HashMap<String, EntitySnapshot>>,
	/// Sliding dedup record: last emit instant per (entity, operation).
	recent: Mutex<HashMap<(String, ChangeOperation), Instant>>,
	buffer: Mutex<Vec<ChangeEvent>>,
	last_flush: Mutex<Instant>,
	downstream: mpsc::Sender<ChangeEvent>,
}

impl ChangeDetector {
	pub fn new(
		store: Arc<EntityStore>,
		bus: EventBus,
		metrics: Arc<MetricsRegistry>,
		settings: DetectionSettings,
		downstream: mpsc::Sender<ChangeEvent>,
	) -> Self {
		Self {
			store,
			bus,
			metrics,
			settings,
			snapshots: RwLock::new(HashMap::new()),
			recent: Mutex::new(HashMap::new()),
			buffer: Mutex::new(Vec::new()),
			last_flush: Mutex::new(Instant::now()),
			downstream,
		}
	}

	fn snapshot_key(entity: &UnifiedEntity) -> String {
		format!(
			"{}:{}:{}",
			entity.source.source_type, entity.entity_type, entity.id
		)
	}

	/// Compare one entity against its snapshot. Emits at most one event and
	/// refreshes the snapshot when a transition is detected.
	pub async fn detect_entity_changes(&self, entity: &UnifiedEntity) -> Option<ChangeEvent> {
		let key = Self::snapshot_key(entity);
		let current_checksum = checksum(entity);

		let (operation, previous, changed_fields, version) = {
			let snapshots = self.snapshots.read().await;
			match snapshots.get(&key) {
				None => (ChangeOperation::Create, None, Vec::new(), 1),
				Some(snapshot) if snapshot.checksum == current_checksum => return None,
				Some(snapshot) => {
					let was_archived = snapshot.entity.status.is_archived();
					let is_archived = entity.status.is_archived();
					let operation = if !was_archived && is_archived {
						ChangeOperation::Delete
					} else if was_archived && !is_archived {
						ChangeOperation::Restore
					} else {
						ChangeOperation::Update
					};
					let changed = diff_fields(
						&content_value(&snapshot.entity),
						&content_value(entity),
					);
					(
						operation,
						Some(snapshot.entity.clone()),
						changed,
						snapshot.version + 1,
					)
				}
			}
		};

		// Deduplication window: a repeat of the same (entity, operation)
		// inside the window is dropped without touching the snapshot, so the
		// transition is picked up again once the window has passed.
		let window = Duration::from_millis(self.settings.dedup_window_ms);
		{
			let mut recent = self.recent.lock().await;
			let dedup_key = (entity.id.clone(), operation);
			if let Some(last) = recent.get(&dedup_key) {
				if last.elapsed() < window {
					self.metrics.changes_deduplicated_total.inc();
					debug!(
						"dropping duplicate {} change for {} inside dedup window",
						operation, entity.id
					);
					return None;
				}
			}
			recent.insert(dedup_key, Instant::now());
			recent.retain(|_, seen| seen.elapsed() < window);
		}

		self.snapshots.write().await.insert(
			key,
			EntitySnapshot {
				checksum: current_checksum,
				last_modified: entity.updated_at,
				version,
				entity: entity.clone(),
			},
		);

		let targets = fan_out(entity);
		let priority = priority_for(operation, entity.entity_type, &changed_fields);
		let event = ChangeEvent::new(
			entity,
			operation,
			previous,
			changed_fields,
			targets,
			priority,
		);

		self.metrics.changes_detected_total.inc();
		self.bus.publish(
			"detector",
			SyncEvent::ChangeDetected {
				change_event_id: event.id,
				entity_id: event.entity_id.clone(),
				entity_type: event.entity_type,
				operation: event.operation,
				priority: event.priority,
				target_systems: event.target_systems.clone(),
			},
		);

		Some(event)
	}

	/// Detect changes across every entity of one source system, returning
	/// the events directly (the buffered path is not involved).
	pub async fn scan_source(&self, source: SourceSystem) -> Vec<ChangeEvent> {
		let mut events = Vec::new();
		for entity in self.store.for_source(source).await {
			if let Some(event) = self.detect_entity_changes(&entity).await {
				events.push(event);
			}
		}
		events
	}

	/// Detect changes across the whole store, buffering events for the
	/// flush-driven downstream delivery.
	pub async fn scan_all(&self) {
		let entities = self.store.all().await;
		for entity in entities {
			if let Some(event) = self.detect_entity_changes(&entity).await {
				self.buffer_event(event).await;
			}
		}
	}

	/// Detect changes for one entity id, buffering any resulting event.
	pub async fn scan_entity(&self, entity_id: &str) {
		if let Some(entity) = self.store.get(entity_id).await {
			if let Some(event) = self.detect_entity_changes(&entity).await {
				self.buffer_event(event).await;
			}
		}
	}

	async fn buffer_event(&self, event: ChangeEvent) {
		let should_flush = {
			let mut buffer = self.buffer.lock().await;
			buffer.push(event);
			self.metrics.change_buffer_length.set(buffer.len() as i64);
			buffer.len() >= self.settings.batch_size
		};
		if should_flush {
			self.flush().await;
		}
	}

	/// Publish every buffered event downstream, then clear the buffer.
	pub async fn flush(&self) {
		let drained: Vec<ChangeEvent> = {
			let mut buffer = self.buffer.lock().await;
			buffer.drain(..).collect()
		};
		*self.last_flush.lock().await = Instant::now();
		self.metrics.change_buffer_length.set(0);

		if drained.is_empty() {
			return;
		}
		self.metrics.change_buffer_flushes_total.inc();
		debug!("flushing {} buffered change events", drained.len());

		for event in drained {
			if self.downstream.send(event).await.is_err() {
				warn!("change event receiver dropped; discarding buffered events");
				return;
			}
		}
	}

	/// Number of snapshots currently held.
	pub async fn snapshot_count(&self) -> usize {
		self.snapshots.read().await.len()
	}

	/// Version counter and last-modified stamp recorded for an entity, if a
	/// snapshot exists.
	pub async fn snapshot_meta(&self, entity: &UnifiedEntity) -> Option<(u64, DateTime<Utc>)> {
		let key = Self::snapshot_key(entity);
		self.snapshots
			.read()
			.await
			.get(&key)
			.map(|snapshot| (snapshot.version, snapshot.last_modified))
	}

	/// Run the detection loop. Polls the whole store on the configured
	/// interval (batch/hybrid), reacts to transformation-completed signals
	/// (realtime/hybrid), and flushes the buffer when the flush interval has
	/// elapsed since the last flush.
	pub fn spawn(self: Arc<Self>, strategy: SchedulingStrategy) -> tokio::task::JoinHandle<()> {
		let detector = self;
		tokio::spawn(async move {
			let mut poll = interval(Duration::from_millis(detector.settings.poll_interval_ms));
			let mut flush_check =
				interval(Duration::from_millis(detector.settings.flush_interval_ms.max(100)));
			let mut signals = detector.bus.subscribe();

			loop {
				tokio::select! {
					_ = poll.tick() => {
						if strategy.polls() {
							detector.scan_all().await;
						}
					}
					_ = flush_check.tick() => {
						let elapsed = detector.last_flush.lock().await.elapsed();
						let due = elapsed
							>= Duration::from_millis(detector.settings.flush_interval_ms);
						if due {
							detector.flush().await;
						}
					}
					received = signals.recv() => {
						match received {
							Ok(envelope) => {
								if strategy.reacts() {
									if let SyncEvent::TransformCompleted { entity_id, .. } =
										envelope.event
									{
										detector.scan_entity(&entity_id).await;
									}
								}
							}
							Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
								warn!("detector lagged {missed} events behind the bus");
							}
							Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
						}
					}
				}
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{EntityPriority, EntityStatus, Provenance, RecordQuality};
	use serde_json::{Map, json};

	fn entity(id: &str, status: EntityStatus) -> UnifiedEntity {
		let now = Utc::now();
		UnifiedEntity {
			id: id.to_string(),
			entity_type: EntityType::Project,
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

	fn detector(settings: DetectionSettings) -> (Arc<ChangeDetector>, mpsc::Receiver<ChangeEvent>) {
		let (tx, rx) = mpsc::channel(128);
		let detector = Arc::new(ChangeDetector::new(
			Arc::new(EntityStore::new()),
			EventBus::new(64),
			Arc::new(MetricsRegistry::new()),
			settings,
			tx,
		));
		(detector, rx)
	}

	#[tokio::test]
	async fn first_sighting_is_a_create() {
		let (detector, _rx) = detector(DetectionSettings::default());
		let event = detector
			.detect_entity_changes(&entity("e1", EntityStatus::Active))
			.await
			.unwrap();
		assert_eq!(event.operation, ChangeOperation::Create);
		assert!(event.previous_version.is_none());
		assert_eq!(detector.snapshot_count().await, 1);
	}

	#[tokio::test]
	async fn unchanged_checksum_emits_nothing() {
		let (detector, _rx) = detector(DetectionSettings::default());
		let subject = entity("e1", EntityStatus::Active);
		assert!(detector.detect_entity_changes(&subject).await.is_some());

		// Same content with only the volatile update stamp moved.
		let mut same = subject.clone();
		same.updated_at = Utc::now();
		assert!(detector.detect_entity_changes(&same).await.is_none());

		let (version, last_modified) = detector.snapshot_meta(&subject).await.unwrap();
		assert_eq!(version, 1);
		assert_eq!(last_modified, subject.updated_at);
	}

	#[tokio::test]
	async fn archive_classifies_as_delete_and_back_as_restore() {
		let (detector, _rx) = detector(DetectionSettings {
			dedup_window_ms: 0,
			..DetectionSettings::default()
		});
		let active = entity("e1", EntityStatus::Active);
		detector.detect_entity_changes(&active).await.unwrap();

		let mut archived = active.clone();
		archived.status = EntityStatus::Archived;
		let delete = detector.detect_entity_changes(&archived).await.unwrap();
		assert_eq!(delete.operation, ChangeOperation::Delete);
		assert!(delete.changed_fields.contains(&"status".to_string()));

		let restored = entity("e1", EntityStatus::Active);
		let restore = detector.detect_entity_changes(&restored).await.unwrap();
		assert_eq!(restore.operation, ChangeOperation::Restore);
	}

	#[tokio::test]
	async fn duplicate_within_window_is_dropped() {
		let (detector, _rx) = detector(DetectionSettings::default());
		let first = entity("e1", EntityStatus::Active);
		assert!(detector.detect_entity_changes(&first).await.is_some());

		// A content change arriving immediately would be another event for
		// the same (entity, operation) pair; the window drops it.
		let mut changed = first.clone();
		changed.title = "Atlas 2".to_string();
		changed.status = EntityStatus::Draft;
		let update = detector.detect_entity_changes(&changed).await;
		assert!(update.is_some(), "different operation kind is not a duplicate");

		let mut changed_again = changed.clone();
		changed_again.title = "Atlas 3".to_string();
		assert!(
			detector.detect_entity_changes(&changed_again).await.is_none(),
			"second update inside the window must be dropped"
		);
	}

	#[tokio::test]
	async fn fan_out_excludes_origin_and_respects_whitelists() {
		let subject = entity("e1", EntityStatus::Active);
		// Project from v2 goes only to buildup (calendar takes no projects).
		assert_eq!(fan_out(&subject), vec![SourceSystem::Buildup]);

		let mut kpi = subject.clone();
		kpi.entity_type = EntityType::Kpi;
		kpi.source.source_type = SourceSystem::Buildup;
		// KPIs are only accepted by buildup, which is the origin.
		assert!(fan_out(&kpi).is_empty());
	}

	#[test]
	fn priority_formula() {
		// Base 5 + delete 3 + kpi 2 + critical field 2 = 12, clamped to 10.
		assert_eq!(
			priority_for(ChangeOperation::Delete, EntityType::Kpi, &["status".to_string()]),
			10
		);
		// Base 5 + update 1 = 6 for a plain task field change.
		assert_eq!(
			priority_for(ChangeOperation::Update, EntityType::Task, &["notes".to_string()]),
			6
		);
		// Critical marker matches on substring.
		assert_eq!(
			priority_for(
				ChangeOperation::Update,
				EntityType::Task,
				&["scores.quality".to_string()]
			),
			8
		);
	}

	#[test]
	fn diff_walks_nested_objects() {
		let old = json!({"a": 1, "nested": {"x": 1, "y": 2}, "gone": true});
		let new = json!({"a": 2, "nested": {"x": 1, "y": 3}, "added": 1});
		let fields = diff_fields(&old, &new);
		assert_eq!(fields, vec!["a", "added", "gone", "nested.y"]);
	}

	#[tokio::test]
	async fn checksum_ignores_volatile_fields() {
		let subject = entity("e1", EntityStatus::Active);
		let mut later = subject.clone();
		later.updated_at = Utc::now() + chrono::Duration::seconds(30);
		later.source.transformed_at = later.updated_at;
		later.source.version = 7;
		assert_eq!(checksum(&subject), checksum(&later));

		let mut renamed = subject.clone();
		renamed.title = "Borealis".to_string();
		assert_ne!(checksum(&subject), checksum(&renamed));
	}

	#[tokio::test]
	async fn buffer_flushes_at_batch_size() {
		let (tx, mut rx) = mpsc::channel(128);
		let store = Arc::new(EntityStore::new());
		let detector = ChangeDetector::new(
			store,
			EventBus::new(64),
			Arc::new(MetricsRegistry::new()),
			DetectionSettings {
				batch_size: 2,
				..DetectionSettings::default()
			},
			tx,
		);

		let first = detector
			.detect_entity_changes(&entity("e1", EntityStatus::Active))
			.await
			.unwrap();
		detector.buffer_event(first).await;
		assert!(rx.try_recv().is_err(), "below batch size, nothing flushes");

		let second = detector
			.detect_entity_changes(&entity("e2", EntityStatus::Active))
			.await
			.unwrap();
		detector.buffer_event(second).await;

		assert!(rx.recv().await.is_some());
		assert!(rx.recv().await.is_some());
	}
}
