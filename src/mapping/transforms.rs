use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// KPI axes recognized by `normalize_kpi`; values on any other axis are
/// dropped during normalization.
pub const KPI_AXES: [&str; 5] = [
	"performance",
	"quality",
	"efficiency",
	"satisfaction",
	"growth",
];

/// Bounds every KPI axis value is clamped into.
pub const KPI_AXIS_MIN: f64 = 0.0;
pub const KPI_AXIS_MAX: f64 = 100.0;

/// Named, pure value transforms available to field mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
	Uppercase,
	Lowercase,
	Trim,
	ParseDate,
	ParseNumber,
	SplitString,
	JoinArray,
	GenerateId,
	MapStatus,
	MapPriority,
	ExtractTags,
	NormalizeKpi,
}

impl TransformKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			TransformKind::Uppercase => "uppercase",
			TransformKind::Lowercase => "lowercase",
			TransformKind::Trim => "trim",
			TransformKind::ParseDate => "parse_date",
			TransformKind::ParseNumber => "parse_number",
			TransformKind::SplitString => "split_string",
			TransformKind::JoinArray => "join_array",
			TransformKind::GenerateId => "generate_id",
			TransformKind::MapStatus => "map_status",
			TransformKind::MapPriority => "map_priority",
			TransformKind::ExtractTags => "extract_tags",
			TransformKind::NormalizeKpi => "normalize_kpi",
		}
	}
}

impl fmt::Display for TransformKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

#[derive(Debug, Error)]
pub enum TransformError {
	#[error("transform {transform} expects {expected}, got {actual}")]
	TypeMismatch {
		transform: TransformKind,
		expected: &'static str,
		actual: &'static str,
	},

	#[error("transform {transform} could not parse {value:?}")]
	Unparseable { transform: TransformKind, value: String },
}

fn kind_name(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "boolean",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}

fn expect_string(transform: TransformKind, value: &Value) -> Result<String, TransformError> {
	value
		.as_str()
		.map(str::to_string)
		.ok_or(TransformError::TypeMismatch {
			transform,
			expected: "string",
			actual: kind_name(value),
		})
}

/// Apply a named transform to a value read from the source record.
pub fn apply(kind: TransformKind, value: Value) -> Result<Value, TransformError> {
	match kind {
		TransformKind::Uppercase => {
			Ok(json!(expect_string(kind, &value)?.to_uppercase()))
		}
		TransformKind::Lowercase => {
			Ok(json!(expect_string(kind, &value)?.to_lowercase()))
		}
		TransformKind::Trim => Ok(json!(expect_string(kind, &value)?.trim())),
		TransformKind::ParseDate => parse_date(value),
		TransformKind::ParseNumber => parse_number(value),
		TransformKind::SplitString => split_string(value),
		TransformKind::JoinArray => join_array(value),
		TransformKind::GenerateId => Ok(json!(Uuid::new_v4().to_string())),
		TransformKind::MapStatus => map_status(value),
		TransformKind::MapPriority => map_priority(value),
		TransformKind::ExtractTags => extract_tags(value),
		TransformKind::NormalizeKpi => normalize_kpi(value),
	}
}

/// Accepts RFC 3339 strings, bare dates, and epoch seconds/milliseconds.
/// Always emits an RFC 3339 UTC string.
fn parse_date(value: Value) -> Result<Value, TransformError> {
	let kind = TransformKind::ParseDate;
	match &value {
		Value::String(s) => {
			if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
				return Ok(json!(dt.with_timezone(&Utc).to_rfc3339()));
			}
			if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
				let dt = date.and_hms_opt(0, 0, 0).expect("midnight is valid");
				return Ok(json!(dt.and_utc().to_rfc3339()));
			}
			Err(TransformError::Unparseable {
				transform: kind,
				value: s.clone(),
			})
		}
		Value::Number(n) => {
			let raw = n.as_i64().ok_or(TransformError::Unparseable {
				transform: kind,
				value: n.to_string(),
			})?;
			// Heuristic split between epoch seconds and milliseconds.
			let dt = if raw.abs() >= 100_000_000_000 {
				DateTime::<Utc>::from_timestamp_millis(raw)
			} else {
				DateTime::<Utc>::from_timestamp(raw, 0)
			};
			dt.map(|d| json!(d.to_rfc3339()))
				.ok_or(TransformError::Unparseable {
					transform: kind,
					value: raw.to_string(),
				})
		}
		other => Err(TransformError::TypeMismatch {
			transform: kind,
			expected: "string or number",
			actual: kind_name(other),
		}),
	}
}

fn parse_number(value: Value) -> Result<Value, TransformError> {
	let kind = TransformKind::ParseNumber;
	match &value {
		Value::Number(_) => Ok(value),
		Value::String(s) => {
			let trimmed = s.trim();
			if let Ok(i) = trimmed.parse::<i64>() {
				return Ok(json!(i));
			}
			trimmed
				.parse::<f64>()
				.map(|f| json!(f))
				.map_err(|_| TransformError::Unparseable {
					transform: kind,
					value: s.clone(),
				})
		}
		other => Err(TransformError::TypeMismatch {
			transform: kind,
			expected: "string or number",
			actual: kind_name(other),
		}),
	}
}

fn split_string(value: Value) -> Result<Value, TransformError> {
	let s = expect_string(TransformKind::SplitString, &value)?;
	let parts: Vec<Value> = s
		.split(',')
		.map(str::trim)
		.filter(|p| !p.is_empty())
		.map(|p| json!(p))
		.collect();
	Ok(Value::Array(parts))
}

fn join_array(value: Value) -> Result<Value, TransformError> {
	let kind = TransformKind::JoinArray;
	let items = value.as_array().ok_or(TransformError::TypeMismatch {
		transform: kind,
		expected: "array",
		actual: kind_name(&value),
	})?;
	let parts: Vec<String> = items
		.iter()
		.map(|item| match item {
			Value::String(s) => s.clone(),
			other => other.to_string(),
		})
		.collect();
	Ok(json!(parts.join(",")))
}

/// Map a source-system status label onto the unified status vocabulary.
/// Unknown labels fall back to `draft`.
fn map_status(value: Value) -> Result<Value, TransformError> {
	let s = expect_string(TransformKind::MapStatus, &value)?;
	let mapped = match s.trim().to_lowercase().as_str() {
		"draft" | "new" | "planned" | "todo" | "backlog" | "proposed" => "draft",
		"active" | "open" | "in_progress" | "in-progress" | "started" | "ongoing"
		| "doing" | "confirmed" => "active",
		"completed" | "done" | "closed" | "finished" | "resolved" => "completed",
		"cancelled" | "canceled" | "rejected" | "dropped" | "abandoned" => "cancelled",
		"archived" | "deleted" | "removed" | "inactive" => "archived",
		_ => "draft",
	};
	Ok(json!(mapped))
}

/// Map a source-system priority label or 1..=10 number onto the unified
/// priority vocabulary. Unknown labels fall back to `medium`.
fn map_priority(value: Value) -> Result<Value, TransformError> {
	if let Some(n) = value.as_f64() {
		let mapped = if n >= 9.0 {
			"critical"
		} else if n >= 7.0 {
			"high"
		} else if n >= 4.0 {
			"medium"
		} else {
			"low"
		};
		return Ok(json!(mapped));
	}
	let s = expect_string(TransformKind::MapPriority, &value)?;
	let mapped = match s.trim().to_lowercase().as_str() {
		"low" | "minor" | "trivial" | "p3" | "p4" => "low",
		"high" | "major" | "important" | "p1" => "high",
		"critical" | "urgent" | "blocker" | "p0" => "critical",
		_ => "medium",
	};
	Ok(json!(mapped))
}

/// Pull a tag list out of either a delimited string or an array. Tags are
/// lowercased, stripped of a leading `#`, and deduplicated preserving order.
fn extract_tags(value: Value) -> Result<Value, TransformError> {
	let kind = TransformKind::ExtractTags;
	let raw: Vec<String> = match &value {
		Value::String(s) => s
			.split([',', ' ', ';'])
			.map(str::trim)
			.filter(|t| !t.is_empty())
			.map(str::to_string)
			.collect(),
		Value::Array(items) => items
			.iter()
			.filter_map(|item| item.as_str())
			.map(str::to_string)
			.collect(),
		other => {
			return Err(TransformError::TypeMismatch {
				transform: kind,
				expected: "string or array",
				actual: kind_name(other),
			});
		}
	};

	let mut seen = Vec::new();
	for tag in raw {
		let clean = tag.trim_start_matches('#').to_lowercase();
		if !clean.is_empty() && !seen.contains(&clean) {
			seen.push(clean);
		}
	}
	Ok(json!(seen))
}

/// Clamp each known KPI axis into [0, 100] and drop unknown axes.
fn normalize_kpi(value: Value) -> Result<Value, TransformError> {
	let kind = TransformKind::NormalizeKpi;
	let axes = value.as_object().ok_or(TransformError::TypeMismatch {
		transform: kind,
		expected: "object",
		actual: kind_name(&value),
	})?;

	let mut normalized = Map::new();
	for (axis, axis_value) in axes {
		if !KPI_AXES.contains(&axis.as_str()) {
			continue;
		}
		if let Some(n) = axis_value.as_f64() {
			normalized.insert(axis.clone(), json!(n.clamp(KPI_AXIS_MIN, KPI_AXIS_MAX)));
		}
	}
	Ok(Value::Object(normalized))
}
