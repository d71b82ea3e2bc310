pub mod batch;

pub use batch::{BatchCounts, BatchOutcome, BatchSummary, QualityBuckets};

use chrono::Utc;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Instant;
use url::Url;
use uuid::Uuid;

use crate::events::{EventBus, SyncEvent};
use crate::mapping::{
	MappingRegistry, TransformContext, TransformationMapping, ValidationKind, ValidationRule,
	path, transforms,
};
use crate::model::{RawRecord, RecordQuality, Severity, UnifiedEntity};
use crate::observability::MetricsRegistry;
use crate::store::EntityStore;

static EMAIL_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex compiles"));

/// One finding produced while transforming a record.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransformationIssue {
	pub code: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub field: Option<String>,
	pub message: String,
	pub severity: Severity,
}

impl TransformationIssue {
	fn new(
		code: &str,
		field: Option<String>,
		message: impl Into<String>,
		severity: Severity,
	) -> Self {
		Self {
			code: code.to_string(),
			field,
			message: message.into(),
			severity,
		}
	}
}

/// Outcome of transforming one raw record. Failures are in-band; this API
/// never propagates an error for a bad record.
#[derive(Debug, Clone)]
pub struct TransformationResult {
	pub record_id: String,
	pub success: bool,
	pub entity: Option<UnifiedEntity>,
	pub errors: Vec<TransformationIssue>,
	pub warnings: Vec<TransformationIssue>,
	pub quality_score: u8,
	pub duration_ms: u64,
}

impl TransformationResult {
	pub fn issues(&self) -> impl Iterator<Item = &TransformationIssue> {
		self.errors.iter().chain(self.warnings.iter())
	}
}

/// Turns raw records into unified entities using the mapping registry, and
/// scores the quality of what it produced.
pub struct TransformationEngine {
	registry: Arc<MappingRegistry>,
	store: Arc<EntityStore>,
	bus: EventBus,
	metrics: Arc<MetricsRegistry>,
	/// Static reference data made available to post-processors.
	reference: Map<String, Value>,
	/// Records transformed concurrently per batch chunk.
	batch_concurrency: usize,
}

impl TransformationEngine {
	pub fn new(
		registry: Arc<MappingRegistry>,
		store: Arc<EntityStore>,
		bus: EventBus,
		metrics: Arc<MetricsRegistry>,
	) -> Self {
		Self {
			registry,
			store,
			bus,
			metrics,
			reference: Map::new(),
			batch_concurrency: 5,
		}
	}

	pub fn with_reference(mut self, reference: Map<String, Value>) -> Self {
		self.reference = reference;
		self
	}

	pub fn with_batch_concurrency(mut self, concurrency: usize) -> Self {
		self.batch_concurrency = concurrency.max(1);
		self
	}

	pub fn store(&self) -> Arc<EntityStore> {
		Arc::clone(&self.store)
	}

	/// Transform one raw record into a unified entity.
	pub async fn transform(
		&self,
		record: &RawRecord,
		user_id: Option<&str>,
	) -> TransformationResult {
		let started = Instant::now();
		self.metrics.transform_requests_total.inc();
		self.bus.publish(
			"transformer",
			SyncEvent::TransformStarted {
				record_id: record.id.clone(),
				source: record.source_type,
			},
		);

		let mut errors: Vec<TransformationIssue> = Vec::new();
		let mut warnings: Vec<TransformationIssue> = Vec::new();

		let entity = match self
			.transform_inner(record, user_id, &mut errors, &mut warnings)
			.await
		{
			Ok(entity) => entity,
			Err(e) => {
				// Unexpected failures are caught and surfaced in-band, never
				// thrown past this API.
				errors.push(TransformationIssue::new(
					"TRANSFORM_FAILED",
					None,
					format!("unexpected transformation failure: {e:#}"),
					Severity::Critical,
				));
				None
			}
		};

		self.finish(record, entity, errors, warnings, started).await
	}

	async fn finish(
		&self,
		record: &RawRecord,
		entity: Option<Value>,
		mut errors: Vec<TransformationIssue>,
		warnings: Vec<TransformationIssue>,
		started: Instant,
	) -> TransformationResult {
		let quality_score = {
			let all: Vec<&TransformationIssue> = errors.iter().chain(warnings.iter()).collect();
			score_quality(&all, entity.as_ref(), record)
		};

		let success = !errors
			.iter()
			.chain(warnings.iter())
			.any(|issue| issue.severity.is_blocking());

		// Only a clean transform reaches the entity store.
		let mut stored = None;
		if success {
			if let Some(value) = entity {
				match serde_json::from_value::<UnifiedEntity>(value) {
					Ok(parsed) => match self.store.upsert(parsed).await {
						Ok(kept) => stored = Some(kept),
						Err(e) => errors.push(TransformationIssue::new(
							"STORE_REJECTED",
							None,
							e.to_string(),
							Severity::Critical,
						)),
					},
					Err(e) => errors.push(TransformationIssue::new(
						"INVALID_ENTITY_SHAPE",
						None,
						format!("mapped output does not form a unified entity: {e}"),
						Severity::Critical,
					)),
				}
			}
		}
		let success = success && stored.is_some();

		let duration_ms = started.elapsed().as_millis() as u64;
		self.metrics
			.transform_duration_seconds
			.observe(started.elapsed().as_secs_f64());

		if success {
			if !warnings.is_empty() {
				self.metrics.transform_warnings_total.inc();
			}
			let entity_ref = stored.as_ref().expect("stored entity on success");
			debug!(
				"transformed record {} into {} {} (quality {})",
				record.id, entity_ref.entity_type, entity_ref.id, quality_score
			);
			self.bus.publish(
				"transformer",
				SyncEvent::TransformCompleted {
					record_id: record.id.clone(),
					entity_id: entity_ref.id.clone(),
					entity_type: entity_ref.entity_type,
					quality_score,
				},
			);
		} else {
			self.metrics.transform_failures_total.inc();
			let code = errors
				.first()
				.or_else(|| warnings.first())
				.map(|issue| issue.code.clone())
				.unwrap_or_else(|| "UNKNOWN".to_string());
			warn!("transformation of record {} failed: {}", record.id, code);
			self.bus.publish(
				"transformer",
				SyncEvent::TransformFailed {
					record_id: record.id.clone(),
					code,
				},
			);
		}

		TransformationResult {
			record_id: record.id.clone(),
			success,
			entity: stored,
			errors,
			warnings,
			quality_score,
			duration_ms,
		}
	}

	async fn transform_inner(
		&self,
		record: &RawRecord,
		user_id: Option<&str>,
		errors: &mut Vec<TransformationIssue>,
		warnings: &mut Vec<TransformationIssue>,
	) -> anyhow::Result<Option<Value>> {
		// 1. Resolve the mapping from (source system, payload type).
		let Some(kind) = record.entity_kind().map(str::to_string) else {
			errors.push(TransformationIssue::new(
				"NO_MAPPING_FOUND",
				Some("data.type".to_string()),
				format!("record {} carries no payload type", record.id),
				Severity::Error,
			));
			return Ok(None);
		};

		let Some(mapping) = self
			.registry
			.find_best_mapping(record.source_type, &kind, None)
		else {
			errors.push(TransformationIssue::new(
				"NO_MAPPING_FOUND",
				None,
				format!(
					"no mapping registered for {}/{}",
					record.source_type, kind
				),
				Severity::Error,
			));
			return Ok(None);
		};

		// 2. Preconditions. A failed condition is a warning-severity skip,
		// but the transform as a whole does not succeed.
		for condition in &mapping.conditions {
			if !condition.evaluate(&record.data) {
				warnings.push(TransformationIssue::new(
					"CONDITIONS_NOT_MET",
					Some(condition.field.clone()),
					format!(
						"mapping {} precondition on {} not satisfied",
						mapping.id, condition.field
					),
					Severity::Warning,
				));
				return Ok(None);
			}
		}

		// 3. Base entity with defaults.
		let now = Utc::now();
		let mut entity = json!({
			"id": Uuid::new_v4().to_string(),
			"type": mapping.target_entity_type,
			"title": "",
			"status": "draft",
			"priority": "medium",
			"created_at": now,
			"updated_at": now,
			"created_by": user_id,
			"updated_by": user_id,
			"tags": [],
			"metadata": {},
			"source": {
				"source_id": record.source_id,
				"source_type": record.source_type,
				"original_data": record.data,
				"transformed_at": now,
				"version": 1,
			},
		});

		// 4. Field mappings, in declared order.
		self.apply_field_mappings(&mapping, record, &mut entity, errors, warnings);

		// 5. Post-processors, ascending priority. The store read guard is
		// released before the entity is written back.
		{
			let entities = self.store.read().await;
			let ctx = TransformContext {
				record,
				entities: &entities,
				reference: &self.reference,
				now,
				user_id,
			};
			for processor in mapping.ordered_post_processors() {
				match processor.apply(entity.clone(), &ctx) {
					Ok(updated) => entity = updated,
					Err(e) => errors.push(TransformationIssue::new(
						"POST_PROCESSOR_FAILED",
						None,
						format!("post-processor {} failed: {e:#}", processor.name),
						Severity::Error,
					)),
				}
			}
		}

		// 6. Validation rules.
		for rule in &mapping.validation_rules {
			if let Some(issue) = validate_rule(rule, &entity) {
				if issue.severity.is_blocking() {
					errors.push(issue);
				} else {
					warnings.push(issue);
				}
			}
		}

		Ok(Some(entity))
	}

	fn apply_field_mappings(
		&self,
		mapping: &TransformationMapping,
		record: &RawRecord,
		entity: &mut Value,
		errors: &mut Vec<TransformationIssue>,
		warnings: &mut Vec<TransformationIssue>,
	) {
		for field in &mapping.field_mappings {
			let mut value = path::get(&record.data, &field.source_path)
				.filter(|v| !v.is_null())
				.cloned()
				.or_else(|| field.default_value.clone());

			let Some(raw) = value.take() else {
				if field.required {
					errors.push(TransformationIssue::new(
						"REQUIRED_FIELD_MISSING",
						Some(field.source_path.clone()),
						format!(
							"required source field {} is absent and has no default",
							field.source_path
						),
						Severity::Error,
					));
				}
				continue;
			};

			let written = match field.transform {
				Some(kind) => match transforms::apply(kind, raw.clone()) {
					Ok(transformed) => transformed,
					Err(e) => {
						// Keep the untransformed value rather than dropping
						// the field entirely.
						warnings.push(TransformationIssue::new(
							"TRANSFORM_APPLY_FAILED",
							Some(field.source_path.clone()),
							e.to_string(),
							Severity::Warning,
						));
						raw
					}
				},
				None => raw,
			};

			path::set(entity, &field.target_path, written);
		}
	}
}

/// Evaluate one validation rule against the entity under construction.
/// Returns a finding when the rule is violated.
fn validate_rule(rule: &ValidationRule, entity: &Value) -> Option<TransformationIssue> {
	let value = path::get(entity, &rule.field);
	let issue = |code: &str, message: String| {
		Some(TransformationIssue::new(
			code,
			Some(rule.field.clone()),
			message,
			rule.severity,
		))
	};

	match &rule.kind {
		ValidationKind::Required => {
			let empty = match value {
				None | Some(Value::Null) => true,
				Some(Value::String(s)) => s.trim().is_empty(),
				Some(Value::Array(items)) => items.is_empty(),
				_ => false,
			};
			if empty {
				return issue(
					"VALIDATION_REQUIRED",
					format!("field {} is required", rule.field),
				);
			}
		}
		ValidationKind::Email => {
			if let Some(s) = value.and_then(Value::as_str) {
				if !EMAIL_RE.is_match(s) {
					return issue(
						"VALIDATION_EMAIL",
						format!("field {} is not a valid email address", rule.field),
					);
				}
			}
		}
		ValidationKind::Url => {
			if let Some(s) = value.and_then(Value::as_str) {
				if Url::parse(s).is_err() {
					return issue(
						"VALIDATION_URL",
						format!("field {} is not a valid URL", rule.field),
					);
				}
			}
		}
		ValidationKind::DateRange { min, max } => {
			if let Some(s) = value.and_then(Value::as_str) {
				match chrono::DateTime::parse_from_rfc3339(s) {
					Ok(parsed) => {
						let parsed = parsed.with_timezone(&Utc);
						if min.is_some_and(|m| parsed < m) || max.is_some_and(|m| parsed > m) {
							return issue(
								"VALIDATION_DATE_RANGE",
								format!("field {} is outside the allowed date range", rule.field),
							);
						}
					}
					Err(_) => {
						return issue(
							"VALIDATION_DATE_RANGE",
							format!("field {} is not a parseable timestamp", rule.field),
						);
					}
				}
			}
		}
		ValidationKind::NumberRange { min, max } => {
			if let Some(n) = value.and_then(Value::as_f64) {
				if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
					return issue(
						"VALIDATION_NUMBER_RANGE",
						format!("field {} is outside the allowed range", rule.field),
					);
				}
			}
		}
	}
	None
}

/// Data-quality score for a transformation outcome, clamped to 0..=100.
fn score_quality(
	issues: &[&TransformationIssue],
	entity: Option<&Value>,
	record: &RawRecord,
) -> u8 {
	let mut score: i32 = 100;

	for issue in issues {
		score -= match issue.severity {
			Severity::Critical => 30,
			Severity::Error => 15,
			Severity::Warning => 5,
		};
	}

	let title_missing = entity
		.and_then(|e| e.get("title"))
		.and_then(Value::as_str)
		.map(|t| t.trim().is_empty())
		.unwrap_or(true);
	if title_missing {
		score -= 20;
	}

	score -= match record.quality {
		RecordQuality::Low => 10,
		RecordQuality::Corrupted => 25,
		_ => 0,
	};

	let no_tags = entity
		.and_then(|e| e.get("tags"))
		.and_then(Value::as_array)
		.map(|tags| tags.is_empty())
		.unwrap_or(true);
	if no_tags {
		score -= 5;
	}

	score.clamp(0, 100) as u8
}
