pub mod defaults;
pub mod path;
pub mod transforms;

pub use transforms::{KPI_AXES, TransformKind};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::model::{EntityType, RawRecord, Severity, SourceSystem, UnifiedEntity};

/// Declarative rule copying one source field into the unified entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
	/// Dotted path into the raw record's `data` payload.
	pub source_path: String,
	/// Dotted path into the unified entity under construction.
	pub target_path: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub transform: Option<TransformKind>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub default_value: Option<Value>,
	#[serde(default)]
	pub required: bool,
}

impl FieldMapping {
	pub fn new(source_path: impl Into<String>, target_path: impl Into<String>) -> Self {
		Self {
			source_path: source_path.into(),
			target_path: target_path.into(),
			transform: None,
			default_value: None,
			required: false,
		}
	}

	pub fn with_transform(mut self, transform: TransformKind) -> Self {
		self.transform = Some(transform);
		self
	}

	pub fn with_default(mut self, value: Value) -> Self {
		self.default_value = Some(value);
		self
	}

	pub fn required(mut self) -> Self {
		self.required = true;
		self
	}
}

/// Comparison applied by a mapping precondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
	Equals,
	Contains,
	GreaterThan,
	LessThan,
	Exists,
}

/// Precondition a raw record must satisfy before a mapping applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingCondition {
	/// Dotted path into the raw record's `data` payload.
	pub field: String,
	pub op: ConditionOp,
	#[serde(default)]
	pub value: Value,
}

impl MappingCondition {
	pub fn new(field: impl Into<String>, op: ConditionOp, value: Value) -> Self {
		Self {
			field: field.into(),
			op,
			value,
		}
	}

	pub fn exists(field: impl Into<String>) -> Self {
		Self::new(field, ConditionOp::Exists, Value::Null)
	}

	/// Evaluate against a record payload. Missing fields satisfy nothing.
	pub fn evaluate(&self, data: &Value) -> bool {
		let actual = path::get(data, &self.field);
		match self.op {
			ConditionOp::Exists => actual.is_some_and(|v| !v.is_null()),
			ConditionOp::Equals => actual == Some(&self.value),
			ConditionOp::Contains => match (actual, &self.value) {
				(Some(Value::String(s)), Value::String(needle)) => s.contains(needle),
				(Some(Value::Array(items)), needle) => items.contains(needle),
				_ => false,
			},
			ConditionOp::GreaterThan => match (actual.and_then(Value::as_f64), self.value.as_f64()) {
				(Some(a), Some(b)) => a > b,
				_ => false,
			},
			ConditionOp::LessThan => match (actual.and_then(Value::as_f64), self.value.as_f64()) {
				(Some(a), Some(b)) => a < b,
				_ => false,
			},
		}
	}
}

/// Validation applied to the finished entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ValidationKind {
	Required,
	Email,
	Url,
	DateRange {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		min: Option<DateTime<Utc>>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		max: Option<DateTime<Utc>>,
	},
	NumberRange {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		min: Option<f64>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		max: Option<f64>,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRule {
	/// Dotted path into the unified entity.
	pub field: String,
	#[serde(flatten)]
	pub kind: ValidationKind,
	pub severity: Severity,
}

impl ValidationRule {
	pub fn required(field: impl Into<String>) -> Self {
		Self {
			field: field.into(),
			kind: ValidationKind::Required,
			severity: Severity::Error,
		}
	}

	pub fn email(field: impl Into<String>) -> Self {
		Self {
			field: field.into(),
			kind: ValidationKind::Email,
			severity: Severity::Warning,
		}
	}

	pub fn url(field: impl Into<String>) -> Self {
		Self {
			field: field.into(),
			kind: ValidationKind::Url,
			severity: Severity::Warning,
		}
	}

	pub fn number_range(field: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
		Self {
			field: field.into(),
			kind: ValidationKind::NumberRange { min, max },
			severity: Severity::Error,
		}
	}

	pub fn date_range(
		field: impl Into<String>,
		min: Option<DateTime<Utc>>,
		max: Option<DateTime<Utc>>,
	) -> Self {
		Self {
			field: field.into(),
			kind: ValidationKind::DateRange { min, max },
			severity: Severity::Error,
		}
	}

	pub fn with_severity(mut self, severity: Severity) -> Self {
		self.severity = severity;
		self
	}
}

/// Read-only context handed to post-processors.
pub struct TransformContext<'a> {
	pub record: &'a RawRecord,
	/// Current view of the unified entity store.
	pub entities: &'a HashMap<String, UnifiedEntity>,
	/// Static reference data shared across transformations.
	pub reference: &'a Map<String, Value>,
	pub now: DateTime<Utc>,
	pub user_id: Option<&'a str>,
}

type PostProcessorFn =
	dyn Fn(Value, &TransformContext<'_>) -> anyhow::Result<Value> + Send + Sync;

/// A named, priority-ordered pure function run over the entity after field
/// mapping. Lower priority runs first.
#[derive(Clone)]
pub struct PostProcessor {
	pub name: String,
	pub priority: i32,
	func: Arc<PostProcessorFn>,
}

impl PostProcessor {
	pub fn new<F>(name: impl Into<String>, priority: i32, func: F) -> Self
	where
		F: Fn(Value, &TransformContext<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
	{
		Self {
			name: name.into(),
			priority,
			func: Arc::new(func),
		}
	}

	pub fn apply(&self, entity: Value, ctx: &TransformContext<'_>) -> anyhow::Result<Value> {
		(self.func)(entity, ctx)
	}
}

impl fmt::Debug for PostProcessor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PostProcessor")
			.field("name", &self.name)
			.field("priority", &self.priority)
			.finish()
	}
}

/// How a raw record of (source system, source entity type) becomes a unified
/// entity of the target type. Immutable once registered.
#[derive(Debug, Clone)]
pub struct TransformationMapping {
	pub id: String,
	pub source_type: SourceSystem,
	pub source_entity_type: String,
	pub target_entity_type: EntityType,
	pub field_mappings: Vec<FieldMapping>,
	pub conditions: Vec<MappingCondition>,
	pub post_processors: Vec<PostProcessor>,
	pub validation_rules: Vec<ValidationRule>,
}

impl TransformationMapping {
	pub fn new(
		id: impl Into<String>,
		source_type: SourceSystem,
		source_entity_type: impl Into<String>,
		target_entity_type: EntityType,
	) -> Self {
		Self {
			id: id.into(),
			source_type,
			source_entity_type: source_entity_type.into(),
			target_entity_type,
			field_mappings: Vec::new(),
			conditions: Vec::new(),
			post_processors: Vec::new(),
			validation_rules: Vec::new(),
		}
	}

	pub fn with_field(mut self, field: FieldMapping) -> Self {
		self.field_mappings.push(field);
		self
	}

	pub fn with_condition(mut self, condition: MappingCondition) -> Self {
		self.conditions.push(condition);
		self
	}

	pub fn with_post_processor(mut self, processor: PostProcessor) -> Self {
		self.post_processors.push(processor);
		self
	}

	pub fn with_validation(mut self, rule: ValidationRule) -> Self {
		self.validation_rules.push(rule);
		self
	}

	/// Post-processors in ascending priority order.
	pub fn ordered_post_processors(&self) -> Vec<&PostProcessor> {
		let mut processors: Vec<&PostProcessor> = self.post_processors.iter().collect();
		processors.sort_by_key(|p| p.priority);
		processors
	}
}

/// Problems found while registering a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingValidationError {
	#[error("mapping id must not be empty")]
	MissingId,

	#[error("mapping {id} has an empty source entity type")]
	MissingSourceEntityType { id: String },

	#[error("mapping {id} declares no field mappings")]
	NoFieldMappings { id: String },

	#[error("mapping {id}: field mapping #{index} is missing a source path")]
	MissingSourcePath { id: String, index: usize },

	#[error("mapping {id}: field mapping #{index} is missing a target path")]
	MissingTargetPath { id: String, index: usize },
}

#[derive(Default)]
struct RegistryInner {
	by_id: HashMap<String, Arc<TransformationMapping>>,
	/// Mapping ids per (source system, source entity type), in registration
	/// order. Registration order is the lookup tie-break, so callers needing
	/// priority register in priority order.
	by_source: HashMap<(SourceSystem, String), Vec<String>>,
}

/// Holds the transformation rules and answers best-mapping lookups.
#[derive(Default)]
pub struct MappingRegistry {
	inner: RwLock<RegistryInner>,
}

impl MappingRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	fn validate(mapping: &TransformationMapping) -> Vec<MappingValidationError> {
		let mut errors = Vec::new();
		if mapping.id.trim().is_empty() {
			errors.push(MappingValidationError::MissingId);
		}
		let id = mapping.id.clone();
		if mapping.source_entity_type.trim().is_empty() {
			errors.push(MappingValidationError::MissingSourceEntityType { id: id.clone() });
		}
		if mapping.field_mappings.is_empty() {
			errors.push(MappingValidationError::NoFieldMappings { id: id.clone() });
		}
		for (index, field) in mapping.field_mappings.iter().enumerate() {
			if field.source_path.trim().is_empty() {
				errors.push(MappingValidationError::MissingSourcePath {
					id: id.clone(),
					index,
				});
			}
			if field.target_path.trim().is_empty() {
				errors.push(MappingValidationError::MissingTargetPath {
					id: id.clone(),
					index,
				});
			}
		}
		errors
	}

	/// Register a mapping. A duplicate id overwrites the previous mapping
	/// with a warning rather than failing.
	pub fn register(
		&self,
		mapping: TransformationMapping,
	) -> Result<(), Vec<MappingValidationError>> {
		let errors = Self::validate(&mapping);
		if !errors.is_empty() {
			return Err(errors);
		}

		let mut inner = self.inner.write().expect("registry lock poisoned");
		let key = (mapping.source_type, mapping.source_entity_type.clone());

		if let Some(previous) = inner.by_id.remove(&mapping.id) {
			warn!(
				"mapping {} re-registered, replacing previous definition for {}/{}",
				mapping.id, previous.source_type, previous.source_entity_type
			);
			let old_key = (previous.source_type, previous.source_entity_type.clone());
			if let Some(ids) = inner.by_source.get_mut(&old_key) {
				ids.retain(|id| id != &mapping.id);
			}
		}

		inner
			.by_source
			.entry(key)
			.or_default()
			.push(mapping.id.clone());
		debug!(
			"registered mapping {} ({}/{} -> {})",
			mapping.id, mapping.source_type, mapping.source_entity_type, mapping.target_entity_type
		);
		inner.by_id.insert(mapping.id.clone(), Arc::new(mapping));
		Ok(())
	}

	/// Find the mapping for a (source system, source entity type) pair.
	///
	/// With a target type, only a mapping matching all three keys is
	/// returned. Without one, the first registered mapping for the pair
	/// wins.
	pub fn find_best_mapping(
		&self,
		source_type: SourceSystem,
		source_entity_type: &str,
		target_entity_type: Option<EntityType>,
	) -> Option<Arc<TransformationMapping>> {
		let inner = self.inner.read().expect("registry lock poisoned");
		let ids = inner
			.by_source
			.get(&(source_type, source_entity_type.to_string()))?;

		for id in ids {
			let mapping = inner.by_id.get(id)?;
			match target_entity_type {
				Some(target) if mapping.target_entity_type != target => continue,
				_ => return Some(Arc::clone(mapping)),
			}
		}
		None
	}

	pub fn get(&self, id: &str) -> Option<Arc<TransformationMapping>> {
		self.inner
			.read()
			.expect("registry lock poisoned")
			.by_id
			.get(id)
			.cloned()
	}

	/// Remove a mapping, updating all secondary indexes in one critical
	/// section.
	pub fn remove(&self, id: &str) -> bool {
		let mut inner = self.inner.write().expect("registry lock poisoned");
		let Some(mapping) = inner.by_id.remove(id) else {
			return false;
		};
		let key = (mapping.source_type, mapping.source_entity_type.clone());
		let now_empty = match inner.by_source.get_mut(&key) {
			Some(ids) => {
				ids.retain(|existing| existing != id);
				ids.is_empty()
			}
			None => false,
		};
		if now_empty {
			inner.by_source.remove(&key);
		}
		true
	}

	/// All mapping ids registered for a source system.
	pub fn mappings_for(&self, source_type: SourceSystem) -> Vec<String> {
		let inner = self.inner.read().expect("registry lock poisoned");
		let mut ids: Vec<String> = inner
			.by_source
			.iter()
			.filter(|((system, _), _)| *system == source_type)
			.flat_map(|(_, ids)| ids.iter().cloned())
			.collect();
		ids.sort();
		ids
	}

	pub fn len(&self) -> usize {
		self.inner.read().expect("registry lock poisoned").by_id.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
