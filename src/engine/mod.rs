pub mod queue;
pub mod retry;
pub mod source;
pub mod targets;

pub use queue::OperationQueue;
pub use retry::RetryPolicy;
pub use source::{DataSource, StaticDataSource};
pub use targets::{InMemoryTargetSystem, TargetSystemHandler, ensure_supported};

use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::Settings;
use crate::detect::ChangeDetector;
use crate::events::{EventBus, SyncEvent};
use crate::model::{
	ChangeEvent, ChangeOperation, EntityStatus, OperationStatus, ResolutionStatus,
	SourceSystem, SyncConflict, SyncError, SyncErrorKind, SyncOperation, UnifiedEntity,
};
use crate::observability::MetricsRegistry;
use crate::resolve::ConflictResolver;
use crate::state::SyncStateManager;

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("sync engine is not running")]
	NotStarted,

	#[error("sync engine is already running")]
	AlreadyRunning,

	#[error("unknown operation {0}")]
	UnknownOperation(Uuid),

	#[error("unknown conflict {0}")]
	UnknownConflict(Uuid),

	#[error("operation {0} is not awaiting manual resolution")]
	NotConflicted(Uuid),

	#[error("a pending operation already exists for this entity and target")]
	DuplicatePending,
}

/// Which side a manual resolution picks.
pub enum ManualWinner {
	Source,
	Target,
	Entity(Box<UnifiedEntity>),
}

/// Orchestrator: consumes change events, creates sync operations, runs them
/// through conflict checking, dispatches to target-system handlers, and
/// manages retries and the priority queue.
pub struct SyncEngine {
	settings: Settings,
	retry: RetryPolicy,
	detector: Arc<ChangeDetector>,
	resolver: Arc<ConflictResolver>,
	state: Arc<SyncStateManager>,
	bus: EventBus,
	metrics: Arc<MetricsRegistry>,
	handlers: std::sync::RwLock<HashMap<SourceSystem, Arc<dyn TargetSystemHandler>>>,
	operations: RwLock<HashMap<Uuid, SyncOperation>>,
	conflicts: RwLock<HashMap<Uuid, SyncConflict>>,
	queue: Mutex<OperationQueue>,
	/// Duplicate-suppression keys for operations that are pending or in
	/// flight.
	pending_keys: Mutex<HashSet<(String, SourceSystem, ChangeOperation)>>,
	retry_schedule: Mutex<Vec<(Instant, Uuid)>>,
	in_flight: AtomicUsize,
	running: AtomicBool,
	change_rx: std::sync::Mutex<Option<mpsc::Receiver<ChangeEvent>>>,
	tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SyncEngine {
	pub fn new(
		settings: Settings,
		detector: Arc<ChangeDetector>,
		resolver: Arc<ConflictResolver>,
		state: Arc<SyncStateManager>,
		bus: EventBus,
		metrics: Arc<MetricsRegistry>,
		change_rx: mpsc::Receiver<ChangeEvent>,
	) -> Self {
		let retry = RetryPolicy::new(settings.retry.clone());
		Self {
			settings,
			retry,
			detector,
			resolver,
			state,
			bus,
			metrics,
			handlers: std::sync::RwLock::new(HashMap::new()),
			operations: RwLock::new(HashMap::new()),
			conflicts: RwLock::new(HashMap::new()),
			queue: Mutex::new(OperationQueue::new()),
			pending_keys: Mutex::new(HashSet::new()),
			retry_schedule: Mutex::new(Vec::new()),
			in_flight: AtomicUsize::new(0),
			running: AtomicBool::new(false),
			change_rx: std::sync::Mutex::new(Some(change_rx)),
			tasks: std::sync::Mutex::new(Vec::new()),
		}
	}

	pub fn register_handler(&self, handler: Arc<dyn TargetSystemHandler>) {
		let system = handler.system();
		self.handlers
			.write()
			.expect("handlers lock poisoned")
			.insert(system, handler);
		debug!("target handler registered for {system}");
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	/// Begin consuming change events and draining the queue on the periodic
	/// tick, bounded by the concurrency cap.
	pub fn start(self: Arc<Self>) -> Result<(), EngineError> {
		if self.running.swap(true, Ordering::SeqCst) {
			return Err(EngineError::AlreadyRunning);
		}
		info!(
			"sync engine started (max {} concurrent operations, {}ms tick)",
			self.settings.sync.max_concurrent_operations, self.settings.sync.tick_interval_ms
		);

		let mut spawned = Vec::new();

		if let Some(mut rx) = self
			.change_rx
			.lock()
			.expect("change receiver lock poisoned")
			.take()
		{
			let engine = Arc::clone(&self);
			spawned.push(tokio::spawn(async move {
				while let Some(event) = rx.recv().await {
					if !engine.is_running() {
						break;
					}
					engine.create_operations_for(&event, None).await;
				}
			}));
		}

		let engine = Arc::clone(&self);
		spawned.push(tokio::spawn(async move {
			let mut tick = tokio::time::interval(Duration::from_millis(
				engine.settings.sync.tick_interval_ms.max(10),
			));
			loop {
				tick.tick().await;
				if !engine.is_running() {
					break;
				}
				engine.promote_due_retries().await;
				Arc::clone(&engine).drain_queue().await;
			}
		}));

		self.tasks
			.lock()
			.expect("tasks lock poisoned")
			.extend(spawned);
		Ok(())
	}

	/// Disable new dequeues, wait up to the stop timeout for in-flight
	/// operations, then force-stop. An operation still processing at the
	/// timeout is left in that state.
	pub async fn stop(&self) {
		if !self.running.swap(false, Ordering::SeqCst) {
			return;
		}
		info!("sync engine stopping, draining in-flight operations");

		let deadline = Instant::now() + Duration::from_millis(self.settings.sync.stop_timeout_ms);
		while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
			tokio::time::sleep(Duration::from_millis(50)).await;
		}

		let abandoned = self.in_flight.load(Ordering::SeqCst);
		if abandoned > 0 {
			warn!(
				"stop timeout reached with {abandoned} operations still processing; \
				 they remain in the processing state"
			);
		}
		for task in self.tasks.lock().expect("tasks lock poisoned").drain(..) {
			task.abort();
		}
		self.bus.publish(
			"engine",
			SyncEvent::SyncStopped {
				abandoned_in_flight: abandoned,
			},
		);
	}

	/// Synchronously run change detection for one source, create operations
	/// for the detected changes, and return their ids.
	pub async fn trigger_sync(
		&self,
		source: SourceSystem,
		target: Option<SourceSystem>,
		entity_id: Option<&str>,
	) -> Result<Vec<Uuid>, EngineError> {
		if !self.is_running() {
			return Err(EngineError::NotStarted);
		}
		info!(
			"sync triggered for {source} (target {:?}, entity {:?})",
			target, entity_id
		);

		let events = self.detector.scan_source(source).await;
		let mut created = Vec::new();
		for event in events {
			if entity_id.is_some_and(|id| id != event.entity_id) {
				continue;
			}
			created.extend(self.create_operations_for(&event, target).await);
		}
		Ok(created)
	}

	/// Create one operation per (change event, target system) pair, subject
	/// to per-system configuration and duplicate suppression.
	pub async fn create_operations_for(
		&self,
		event: &ChangeEvent,
		only_target: Option<SourceSystem>,
	) -> Vec<Uuid> {
		let mut created = Vec::new();

		for target in &event.target_systems {
			let target = *target;
			if only_target.is_some_and(|t| t != target) {
				continue;
			}
			let system_settings = self.settings.system(target);
			if !system_settings.enabled || !system_settings.accepts(event.entity_type) {
				continue;
			}
			let handler = self
				.handlers
				.read()
				.expect("handlers lock poisoned")
				.get(&target)
				.cloned();
			let Some(handler) = handler else {
				warn!("no handler registered for {target}, skipping fan-out");
				continue;
			};

			let target_entity = match handler.fetch(&event.entity_id).await {
				Ok(found) => found,
				Err(e) => {
					warn!("fetching {} from {target} failed: {e}", event.entity_id);
					None
				}
			};

			let mut operation = SyncOperation::new(
				event.id,
				target,
				event.operation,
				event.current_version.clone(),
				event.priority,
				self.retry.max_attempts(),
			);
			operation.expected_target_state = Some(expected_state(
				event.operation,
				&event.current_version,
				target_entity.as_ref(),
			));
			operation.target_entity = target_entity;

			if let Some(id) = self.enqueue_operation(operation).await {
				created.push(id);
			}
		}

		created
	}

	/// Enqueue an operation unless a pending one already exists for the
	/// same (entity, target, operation) key.
	async fn enqueue_operation(&self, operation: SyncOperation) -> Option<Uuid> {
		let key = operation.dedup_key();
		{
			let mut keys = self.pending_keys.lock().await;
			if keys.contains(&key) {
				debug!(
					"suppressing duplicate {} for {} -> {}",
					operation.operation, operation.entity_id, operation.target_system
				);
				self.metrics.sync_duplicates_suppressed_total.inc();
				return None;
			}
			keys.insert(key);
		}

		let id = operation.id;
		let priority = operation.priority;
		let target = operation.target_system;
		self.operations.write().await.insert(id, operation);
		let depth = {
			let mut queue = self.queue.lock().await;
			queue.push(id, priority);
			queue.len()
		};
		self.metrics.sync_operations_total.inc();
		self.metrics.sync_queue_depth.set(depth as i64);
		self.state.record_enqueued(target);
		Some(id)
	}

	/// Move retries whose backoff has elapsed back into the queue.
	async fn promote_due_retries(&self) {
		let due: Vec<Uuid> = {
			let mut schedule = self.retry_schedule.lock().await;
			let now = Instant::now();
			let (ready, later): (Vec<_>, Vec<_>) =
				schedule.drain(..).partition(|(when, _)| *when <= now);
			*schedule = later;
			ready.into_iter().map(|(_, id)| id).collect()
		};

		for id in due {
			let priority = self
				.operations
				.read()
				.await
				.get(&id)
				.map(|op| op.priority)
				.unwrap_or(5);
			let mut queue = self.queue.lock().await;
			queue.push(id, priority);
			self.metrics.sync_queue_depth.set(queue.len() as i64);
		}
	}

	/// Dequeue and launch operations up to the concurrency cap.
	async fn drain_queue(self: Arc<Self>) {
		loop {
			if !self.is_running() {
				break;
			}
			if self.in_flight.load(Ordering::SeqCst)
				>= self.settings.sync.max_concurrent_operations
			{
				break;
			}
			let popped = {
				let mut queue = self.queue.lock().await;
				let popped = queue.pop();
				self.metrics.sync_queue_depth.set(queue.len() as i64);
				popped
			};
			let Some(operation_id) = popped else { break };

			let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
			self.metrics.sync_in_flight.set(in_flight as i64);

			let engine = Arc::clone(&self);
			tokio::spawn(async move {
				engine.execute_operation(operation_id).await;
				let in_flight = engine.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
				engine.metrics.sync_in_flight.set(in_flight as i64);
			});
		}
	}

	async fn store_operation(&self, operation: &SyncOperation) {
		self.operations
			.write()
			.await
			.insert(operation.id, operation.clone());
	}

	async fn release_key(&self, operation: &SyncOperation) {
		self.pending_keys.lock().await.remove(&operation.dedup_key());
	}

	/// Run one operation through conflict checking and dispatch.
	async fn execute_operation(&self, operation_id: Uuid) {
		let mut operation = {
			let mut operations = self.operations.write().await;
			let Some(stored) = operations.get_mut(&operation_id) else {
				warn!("operation {operation_id} vanished before execution");
				return;
			};
			if stored.status != OperationStatus::Pending {
				debug!(
					"skipping operation {operation_id} in state {}",
					stored.status
				);
				return;
			}
			stored.mark_processing();
			stored.clone()
		};

		let target = operation.target_system;
		self.state.record_started(target);
		self.bus.publish(
			"engine",
			SyncEvent::SyncStarted {
				operation_id,
				entity_id: operation.entity_id.clone(),
				target_system: target,
			},
		);
		let exec_started = std::time::Instant::now();

		// Conflict gate.
		let mut conflicts = self.resolver.detect_conflicts(&operation).await;
		if !conflicts.is_empty() {
			self.state.record_conflicts_detected(conflicts.len() as u64);
			let resolved_all = self.resolver.resolve_conflicts(&mut operation, &mut conflicts);
			let resolved = conflicts
				.iter()
				.filter(|c| c.resolution_status == ResolutionStatus::Resolved)
				.count();
			for _ in 0..resolved {
				self.state.record_conflict_resolved();
			}
			{
				let mut map = self.conflicts.write().await;
				for conflict in &conflicts {
					map.insert(conflict.id, conflict.clone());
				}
			}
			if !resolved_all {
				warn!(
					"operation {operation_id} conflicted; awaiting manual resolution or a fresh change"
				);
				operation.mark_conflicted();
				self.store_operation(&operation).await;
				self.release_key(&operation).await;
				self.state.record_conflicted(target);
				return;
			}
			// Resolution rewrote the payload; the expected target state must
			// follow it.
			operation.expected_target_state = Some(expected_state(
				operation.operation,
				&operation.source_entity,
				operation.target_entity.as_ref(),
			));
		}

		// Dispatch to the target adapter, bounded by the default timeout.
		let handler = self
			.handlers
			.read()
			.expect("handlers lock poisoned")
			.get(&target)
			.cloned();
		let outcome = match handler {
			None => Err(SyncError::new(
				"NO_HANDLER",
				SyncErrorKind::System,
				format!("no handler registered for {target}"),
			)),
			Some(handler) => {
				let timeout = Duration::from_millis(self.settings.sync.default_timeout_ms);
				match tokio::time::timeout(timeout, handler.apply(&operation)).await {
					Ok(result) => result,
					Err(_) => Err(SyncError::timeout(target)),
				}
			}
		};

		match outcome {
			Ok(()) => {
				operation.mark_completed();
				self.store_operation(&operation).await;
				self.release_key(&operation).await;

				let latency_ms = exec_started.elapsed().as_millis() as f64;
				self.state.record_completed(target, latency_ms);
				self.metrics.sync_completed_total.inc();
				self.metrics.sync_latency_ms.observe(latency_ms);
				self.bus.publish(
					"engine",
					SyncEvent::SyncCompleted {
						operation_id,
						entity_id: operation.entity_id.clone(),
						target_system: target,
						duration_ms: latency_ms as u64,
					},
				);
			}
			Err(sync_error) => self.handle_failure(operation, sync_error).await,
		}
	}

	/// Classify a dispatch failure and either schedule a retry or fail the
	/// operation permanently. Only this operation's state is affected.
	async fn handle_failure(&self, mut operation: SyncOperation, mut sync_error: SyncError) {
		operation.attempts += 1;
		let target = operation.target_system;
		let will_retry =
			self.retry.is_retryable(&sync_error) && operation.retries_remaining();
		// The recoverable flag reported outward reflects the remaining
		// budget, not just the error code.
		sync_error.recoverable = will_retry;

		self.bus.publish(
			"engine",
			SyncEvent::SyncFailed {
				operation_id: operation.id,
				entity_id: operation.entity_id.clone(),
				target_system: target,
				code: sync_error.code.clone(),
				will_retry,
			},
		);

		if will_retry {
			let delay = self.retry.delay_for_attempt(operation.attempts);
			warn!(
				"operation {} failed with {} (attempt {}/{}), retrying in {:?}",
				operation.id, sync_error.code, operation.attempts, operation.max_attempts, delay
			);
			operation.mark_retrying(sync_error);
			self.store_operation(&operation).await;
			self.state.record_requeued(target);
			self.metrics.sync_retries_total.inc();
			self.retry_schedule
				.lock()
				.await
				.push((Instant::now() + delay, operation.id));
		} else {
			error!(
				"operation {} failed permanently with {} after {} attempts",
				operation.id, sync_error.code, operation.attempts
			);
			operation.mark_failed(sync_error);
			self.store_operation(&operation).await;
			self.release_key(&operation).await;
			self.state.record_failed(target);
			self.metrics.sync_failed_total.inc();
		}
	}

	/// Close an escalated conflict by hand and, once no escalated conflicts
	/// remain for the operation, re-enqueue it with the chosen payload.
	pub async fn resolve_manually(
		&self,
		operation_id: Uuid,
		conflict_id: Uuid,
		winner: ManualWinner,
		resolved_by: &str,
	) -> Result<(), EngineError> {
		let mut operation = self
			.operations
			.read()
			.await
			.get(&operation_id)
			.cloned()
			.ok_or(EngineError::UnknownOperation(operation_id))?;
		if operation.status != OperationStatus::Conflicted {
			return Err(EngineError::NotConflicted(operation_id));
		}
		let mut conflict = self
			.conflicts
			.read()
			.await
			.get(&conflict_id)
			.cloned()
			.ok_or(EngineError::UnknownConflict(conflict_id))?;

		let chosen = match winner {
			ManualWinner::Source => operation.source_entity.clone(),
			ManualWinner::Target => operation
				.target_entity
				.clone()
				.unwrap_or_else(|| operation.source_entity.clone()),
			ManualWinner::Entity(entity) => *entity,
		};

		self.resolver
			.resolve_manually(&mut conflict, chosen.clone(), resolved_by);
		self.state.record_conflict_resolved();
		self.conflicts.write().await.insert(conflict.id, conflict);

		let unresolved_left = self
			.conflicts
			.read()
			.await
			.values()
			.filter(|c| {
				c.operation_id == operation_id
					&& c.resolution_status == ResolutionStatus::Escalated
			})
			.count();
		if unresolved_left > 0 {
			info!(
				"operation {operation_id} still has {unresolved_left} escalated conflicts"
			);
			return Ok(());
		}

		operation.source_entity = chosen;
		operation.expected_target_state = Some(expected_state(
			operation.operation,
			&operation.source_entity,
			operation.target_entity.as_ref(),
		));
		operation.mark_pending();
		let priority = operation.priority;
		let target = operation.target_system;
		let key = operation.dedup_key();
		{
			let mut keys = self.pending_keys.lock().await;
			if keys.contains(&key) {
				return Err(EngineError::DuplicatePending);
			}
			keys.insert(key);
		}
		self.store_operation(&operation).await;
		self.queue.lock().await.push(operation_id, priority);
		self.state.record_enqueued(target);
		info!("operation {operation_id} re-enqueued after manual resolution");
		Ok(())
	}

	pub async fn operation(&self, id: Uuid) -> Option<SyncOperation> {
		self.operations.read().await.get(&id).cloned()
	}

	pub async fn operations_snapshot(&self) -> Vec<SyncOperation> {
		self.operations.read().await.values().cloned().collect()
	}

	pub async fn conflicts_snapshot(&self) -> Vec<SyncConflict> {
		self.conflicts.read().await.values().cloned().collect()
	}

	pub async fn queue_depth(&self) -> usize {
		self.queue.lock().await.len()
	}

	pub fn state_manager(&self) -> Arc<SyncStateManager> {
		Arc::clone(&self.state)
	}
}

/// The state the target side is expected to be in after the operation
/// applies, by operation-type rule.
fn expected_state(
	operation: ChangeOperation,
	source: &UnifiedEntity,
	target: Option<&UnifiedEntity>,
) -> UnifiedEntity {
	match operation {
		ChangeOperation::Create => {
			// The target-side copy is a synthetic clone of the source; its
			// provenance records that it did not originate there.
			let mut expected = source.clone();
			expected.source.source_id = format!("synthetic:{}", source.source.source_id);
			expected
		}
		ChangeOperation::Update | ChangeOperation::Restore => match target {
			Some(existing) => {
				let mut merged = existing.to_value();
				let overlay = source.to_value();
				if let (Some(base), Some(fields)) =
					(merged.as_object_mut(), overlay.as_object())
				{
					for (key, value) in fields {
						base.insert(key.clone(), value.clone());
					}
				}
				let mut expected = serde_json::from_value::<UnifiedEntity>(merged)
					.unwrap_or_else(|_| source.clone());
				expected.updated_at = Utc::now().max(expected.updated_at);
				expected
			}
			None => {
				let mut expected = source.clone();
				expected.touch(None);
				expected
			}
		},
		ChangeOperation::Delete => {
			let mut expected = target.cloned().unwrap_or_else(|| source.clone());
			expected.status = EntityStatus::Archived;
			expected.touch(None);
			expected
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::DetectionSettings;
	use crate::model::{EntityPriority, EntityType, Provenance};
	use crate::store::EntityStore;
	use serde_json::{Map, json};

	fn entity(id: &str, entity_type: EntityType, source: SourceSystem) -> UnifiedEntity {
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
				source_type: source,
				original_data: json!({}),
				transformed_at: now,
				version: 1,
			},
			extra: Map::new(),
		}
	}

	fn build_engine(store: Arc<EntityStore>) -> Arc<SyncEngine> {
		let bus = EventBus::new(256);
		let metrics = Arc::new(MetricsRegistry::new());
		let settings = Settings::default();
		let (tx, rx) = mpsc::channel(64);
		let detector = Arc::new(ChangeDetector::new(
			Arc::clone(&store),
			bus.clone(),
			Arc::clone(&metrics),
			DetectionSettings::default(),
			tx,
		));
		let resolver = Arc::new(ConflictResolver::new(
			settings.conflict.clone(),
			Arc::clone(&store),
			bus.clone(),
			Arc::clone(&metrics),
		));
		let state = Arc::new(SyncStateManager::new(
			settings.state.clone(),
			Arc::clone(&metrics),
		));
		Arc::new(SyncEngine::new(
			settings,
			detector,
			resolver,
			state,
			bus,
			metrics,
			rx,
		))
	}

	fn change_event(entity: &UnifiedEntity) -> ChangeEvent {
		ChangeEvent::new(
			entity,
			ChangeOperation::Update,
			None,
			vec!["title".to_string()],
			vec![SourceSystem::Buildup],
			7,
		)
	}

	#[tokio::test]
	async fn duplicate_enqueue_is_suppressed() {
		let store = Arc::new(EntityStore::new());
		let engine = build_engine(store);
		engine.register_handler(Arc::new(InMemoryTargetSystem::new(SourceSystem::Buildup)));

		let subject = entity("p1", EntityType::Project, SourceSystem::V2);
		let event = change_event(&subject);

		let first = engine.create_operations_for(&event, None).await;
		assert_eq!(first.len(), 1);

		// Identical (entity, target, operation) while the first is pending.
		let second = engine.create_operations_for(&change_event(&subject), None).await;
		assert!(second.is_empty());
		assert_eq!(engine.queue_depth().await, 1);
	}

	#[tokio::test]
	async fn trigger_before_start_is_refused() {
		let store = Arc::new(EntityStore::new());
		let engine = build_engine(store);
		let result = engine.trigger_sync(SourceSystem::V2, None, None).await;
		assert!(matches!(result, Err(EngineError::NotStarted)));
	}

	#[tokio::test]
	async fn disabled_system_receives_nothing() {
		let store = Arc::new(EntityStore::new());
		let mut settings = Settings::default();
		settings
			.systems
			.get_mut(SourceSystem::Buildup.as_str())
			.unwrap()
			.enabled = false;

		let bus = EventBus::new(64);
		let metrics = Arc::new(MetricsRegistry::new());
		let (tx, rx) = mpsc::channel(16);
		let detector = Arc::new(ChangeDetector::new(
			Arc::clone(&store),
			bus.clone(),
			Arc::clone(&metrics),
			DetectionSettings::default(),
			tx,
		));
		let resolver = Arc::new(ConflictResolver::new(
			settings.conflict.clone(),
			Arc::clone(&store),
			bus.clone(),
			Arc::clone(&metrics),
		));
		let state = Arc::new(SyncStateManager::new(
			settings.state.clone(),
			Arc::clone(&metrics),
		));
		let engine = Arc::new(SyncEngine::new(
			settings, detector, resolver, state, bus, metrics, rx,
		));
		engine.register_handler(Arc::new(InMemoryTargetSystem::new(SourceSystem::Buildup)));

		let subject = entity("p1", EntityType::Project, SourceSystem::V2);
		let created = engine.create_operations_for(&change_event(&subject), None).await;
		assert!(created.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn end_to_end_execution_completes_an_operation() {
		let store = Arc::new(EntityStore::new());
		let engine = build_engine(Arc::clone(&store));
		let buildup = Arc::new(InMemoryTargetSystem::new(SourceSystem::Buildup));
		engine.register_handler(Arc::clone(&buildup) as Arc<dyn TargetSystemHandler>);
		Arc::clone(&engine).start().unwrap();

		let subject = entity("p1", EntityType::Project, SourceSystem::V2);
		store.upsert(subject.clone()).await.unwrap();

		let created = engine
			.trigger_sync(SourceSystem::V2, None, None)
			.await
			.unwrap();
		assert_eq!(created.len(), 1);

		// Let the tick loop pick the operation up and run it.
		for _ in 0..50 {
			tokio::time::sleep(Duration::from_millis(20)).await;
			if let Some(op) = engine.operation(created[0]).await {
				if op.status == OperationStatus::Completed {
					break;
				}
			}
		}

		let op = engine.operation(created[0]).await.unwrap();
		assert_eq!(op.status, OperationStatus::Completed);
		assert!(buildup.get("p1").await.is_some());

		engine.stop().await;
	}

	#[tokio::test(start_paused = true)]
	async fn recoverable_failures_retry_until_the_budget_runs_out() {
		let store = Arc::new(EntityStore::new());
		let engine = build_engine(Arc::clone(&store));
		let buildup = Arc::new(InMemoryTargetSystem::new(SourceSystem::Buildup));
		for _ in 0..3 {
			buildup
				.inject_failure(
					SyncError::new("TARGET_UNAVAILABLE", SyncErrorKind::Network, "down")
						.recoverable(),
				)
				.await;
		}
		engine.register_handler(Arc::clone(&buildup) as Arc<dyn TargetSystemHandler>);
		Arc::clone(&engine).start().unwrap();

		let subject = entity("p1", EntityType::Project, SourceSystem::V2);
		store.upsert(subject).await.unwrap();
		let created = engine
			.trigger_sync(SourceSystem::V2, None, None)
			.await
			.unwrap();
		assert_eq!(created.len(), 1);

		for _ in 0..600 {
			tokio::time::sleep(Duration::from_millis(100)).await;
			if let Some(op) = engine.operation(created[0]).await {
				if op.status.is_terminal() {
					break;
				}
			}
		}

		let op = engine.operation(created[0]).await.unwrap();
		// Three injected failures against a budget of three attempts.
		assert_eq!(op.status, OperationStatus::Failed);
		assert_eq!(op.attempts, 3);

		engine.stop().await;
	}

	#[test]
	fn expected_state_rules() {
		let source = entity("p1", EntityType::Project, SourceSystem::V2);

		let created = expected_state(ChangeOperation::Create, &source, None);
		assert!(created.source.source_id.starts_with("synthetic:"));

		let mut target = source.clone();
		target.title = "Remote title".to_string();
		target
			.extra
			.insert("remote_only".to_string(), json!(true));
		let updated = expected_state(ChangeOperation::Update, &source, Some(&target));
		// Source fields win; target-only fields survive the shallow merge.
		assert_eq!(updated.title, "Atlas");
		assert_eq!(updated.extra.get("remote_only"), Some(&json!(true)));
		assert!(updated.updated_at >= source.updated_at);

		let deleted = expected_state(ChangeOperation::Delete, &source, Some(&target));
		assert_eq!(deleted.status, EntityStatus::Archived);
	}
}
