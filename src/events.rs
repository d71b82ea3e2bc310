use chrono::{DateTime, Utc};
use log::trace;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{
	ChangeOperation, ConflictType, EntityType, ResolutionStrategy, SourceSystem,
};

/// Every externally observable occurrence in the hub, as a closed sum type.
///
/// External monitoring may depend on this envelope and nothing else; the
/// serialized `type` tags are the stable contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SyncEvent {
	#[serde(rename = "transform:started")]
	TransformStarted { record_id: String, source: SourceSystem },

	#[serde(rename = "transform:completed")]
	TransformCompleted {
		record_id: String,
		entity_id: String,
		entity_type: EntityType,
		quality_score: u8,
	},

	#[serde(rename = "transform:failed")]
	TransformFailed { record_id: String, code: String },

	#[serde(rename = "transform:batch_completed")]
	TransformBatchCompleted {
		total: usize,
		succeeded: usize,
		failed: usize,
		duration_ms: u64,
	},

	#[serde(rename = "sync:change_detected")]
	ChangeDetected {
		change_event_id: Uuid,
		entity_id: String,
		entity_type: EntityType,
		operation: ChangeOperation,
		priority: u8,
		target_systems: Vec<SourceSystem>,
	},

	#[serde(rename = "sync:started")]
	SyncStarted {
		operation_id: Uuid,
		entity_id: String,
		target_system: SourceSystem,
	},

	#[serde(rename = "sync:completed")]
	SyncCompleted {
		operation_id: Uuid,
		entity_id: String,
		target_system: SourceSystem,
		duration_ms: u64,
	},

	#[serde(rename = "sync:failed")]
	SyncFailed {
		operation_id: Uuid,
		entity_id: String,
		target_system: SourceSystem,
		code: String,
		will_retry: bool,
	},

	#[serde(rename = "sync:conflict_detected")]
	ConflictDetected {
		conflict_id: Uuid,
		operation_id: Uuid,
		entity_id: String,
		conflict_type: ConflictType,
		strategy: ResolutionStrategy,
	},

	#[serde(rename = "sync:conflict_resolved")]
	ConflictResolved {
		conflict_id: Uuid,
		operation_id: Uuid,
		entity_id: String,
		strategy: ResolutionStrategy,
	},

	#[serde(rename = "sync:stopped")]
	SyncStopped { abandoned_in_flight: usize },
}

impl SyncEvent {
	/// The serialized tag, for log lines and metrics labels.
	pub fn kind(&self) -> &'static str {
		match self {
			SyncEvent::TransformStarted { .. } => "transform:started",
			SyncEvent::TransformCompleted { .. } => "transform:completed",
			SyncEvent::TransformFailed { .. } => "transform:failed",
			SyncEvent::TransformBatchCompleted { .. } => "transform:batch_completed",
			SyncEvent::ChangeDetected { .. } => "sync:change_detected",
			SyncEvent::SyncStarted { .. } => "sync:started",
			SyncEvent::SyncCompleted { .. } => "sync:completed",
			SyncEvent::SyncFailed { .. } => "sync:failed",
			SyncEvent::ConflictDetected { .. } => "sync:conflict_detected",
			SyncEvent::ConflictResolved { .. } => "sync:conflict_resolved",
			SyncEvent::SyncStopped { .. } => "sync:stopped",
		}
	}
}

/// Envelope carried on the bus: identity, emitting component, and payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
	pub id: Uuid,
	pub source: String,
	pub timestamp: DateTime<Utc>,
	#[serde(flatten)]
	pub event: SyncEvent,
}

/// Broadcast bus for sync events. Cloning is cheap; every subscriber gets
/// every event published after it subscribed. Lagging subscribers lose the
/// oldest events rather than blocking publishers.
#[derive(Clone)]
pub struct EventBus {
	tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity);
		Self { tx }
	}

	pub fn publish(&self, source: &str, event: SyncEvent) {
		let envelope = EventEnvelope {
			id: Uuid::new_v4(),
			source: source.to_string(),
			timestamp: Utc::now(),
			event,
		};
		trace!("event {} from {}", envelope.event.kind(), source);
		// Send fails only when no subscriber exists, which is fine.
		let _ = self.tx.send(envelope);
	}

	pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
		self.tx.subscribe()
	}

	pub fn subscriber_count(&self) -> usize {
		self.tx.receiver_count()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(1024)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn subscribers_receive_published_events() {
		let bus = EventBus::new(16);
		let mut rx = bus.subscribe();

		bus.publish(
			"transformer",
			SyncEvent::TransformFailed {
				record_id: "r-1".to_string(),
				code: "NO_MAPPING_FOUND".to_string(),
			},
		);

		let envelope = rx.recv().await.unwrap();
		assert_eq!(envelope.source, "transformer");
		assert_eq!(envelope.event.kind(), "transform:failed");
	}

	#[test]
	fn envelope_serializes_with_type_tag() {
		let bus = EventBus::new(4);
		let mut rx = bus.subscribe();
		bus.publish("engine", SyncEvent::SyncStopped { abandoned_in_flight: 2 });

		let envelope = rx.try_recv().unwrap();
		let json = serde_json::to_value(&envelope).unwrap();
		assert_eq!(json["type"], "sync:stopped");
		assert_eq!(json["data"]["abandoned_in_flight"], 2);
		assert!(json["timestamp"].is_string());
	}

	#[test]
	fn publish_without_subscribers_is_silent() {
		let bus = EventBus::new(4);
		bus.publish("engine", SyncEvent::SyncStopped { abandoned_in_flight: 0 });
		assert_eq!(bus.subscriber_count(), 0);
	}
}
