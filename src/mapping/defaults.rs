use log::warn;
use serde_json::json;

use super::{
	FieldMapping, MappingCondition, MappingRegistry, PostProcessor, TransformKind,
	TransformationMapping, ValidationRule,
};
use crate::model::{EntityType, Severity, SourceSystem};

/// Register the stock transformation rules for the three systems of record.
/// Registration order doubles as lookup priority, so the canonical mapping
/// for each (system, payload type) pair goes in first.
pub fn register_default_mappings(registry: &MappingRegistry) {
	let mappings = vec![
		v2_project(),
		v2_recommendation(),
		calendar_event(),
		calendar_task(),
		buildup_project(),
		buildup_kpi(),
	];
	for mapping in mappings {
		let id = mapping.id.clone();
		if let Err(errors) = registry.register(mapping) {
			// Stock mappings are built in this file; failing validation here
			// is a programming error worth surfacing loudly.
			warn!("stock mapping {id} rejected: {errors:?}");
		}
	}
}

fn v2_project() -> TransformationMapping {
	TransformationMapping::new("v2-project", SourceSystem::V2, "project", EntityType::Project)
		.with_field(FieldMapping::new("name", "title").required())
		.with_field(FieldMapping::new("summary", "description"))
		.with_field(FieldMapping::new("state", "status").with_transform(TransformKind::MapStatus))
		.with_field(
			FieldMapping::new("priority", "priority")
				.with_transform(TransformKind::MapPriority)
				.with_default(json!("medium")),
		)
		.with_field(FieldMapping::new("labels", "tags").with_transform(TransformKind::ExtractTags))
		.with_field(
			FieldMapping::new("progress", "progress").with_transform(TransformKind::ParseNumber),
		)
		.with_field(FieldMapping::new("url", "metadata.url"))
		.with_field(FieldMapping::new("owner.email", "metadata.owner_email"))
		.with_field(FieldMapping::new("depends_on", "metadata.dependencies"))
		.with_validation(ValidationRule::required("title"))
		.with_validation(ValidationRule::url("metadata.url"))
		.with_validation(ValidationRule::email("metadata.owner_email"))
		.with_validation(ValidationRule::number_range("progress", Some(0.0), Some(100.0)))
}

fn v2_recommendation() -> TransformationMapping {
	TransformationMapping::new(
		"v2-recommendation",
		SourceSystem::V2,
		"recommendation",
		EntityType::Recommendation,
	)
	.with_field(FieldMapping::new("title", "title").required())
	.with_field(FieldMapping::new("summary", "description"))
	.with_field(FieldMapping::new("state", "status").with_transform(TransformKind::MapStatus))
	.with_field(FieldMapping::new("impact", "kpiImpact"))
	.with_field(FieldMapping::new("expected_results", "expectedResults"))
	.with_field(
		FieldMapping::new("confidence", "metadata.confidence")
			.with_transform(TransformKind::ParseNumber),
	)
	.with_field(FieldMapping::new("topics", "tags").with_transform(TransformKind::ExtractTags))
	.with_validation(ValidationRule::required("title"))
	.with_validation(
		ValidationRule::number_range("metadata.confidence", Some(0.0), Some(1.0))
			.with_severity(Severity::Warning),
	)
}

fn calendar_event() -> TransformationMapping {
	TransformationMapping::new(
		"calendar-event",
		SourceSystem::Calendar,
		"event",
		EntityType::Event,
	)
	.with_field(FieldMapping::new("summary", "title").required())
	.with_field(FieldMapping::new("description", "description"))
	.with_field(FieldMapping::new("status", "status").with_transform(TransformKind::MapStatus))
	.with_field(
		FieldMapping::new("starts_at", "metadata.starts_at")
			.with_transform(TransformKind::ParseDate)
			.required(),
	)
	.with_field(
		FieldMapping::new("ends_at", "metadata.ends_at").with_transform(TransformKind::ParseDate),
	)
	.with_field(FieldMapping::new("organizer.email", "metadata.organizer_email"))
	.with_field(FieldMapping::new("attendees", "metadata.attendees"))
	.with_field(FieldMapping::new("categories", "tags").with_transform(TransformKind::ExtractTags))
	.with_validation(ValidationRule::required("title"))
	.with_validation(ValidationRule::email("metadata.organizer_email"))
}

fn calendar_task() -> TransformationMapping {
	TransformationMapping::new(
		"calendar-task",
		SourceSystem::Calendar,
		"task",
		EntityType::Task,
	)
	.with_field(FieldMapping::new("summary", "title").required())
	.with_field(FieldMapping::new("notes", "description"))
	.with_field(FieldMapping::new("state", "status").with_transform(TransformKind::MapStatus))
	.with_field(
		FieldMapping::new("urgency", "priority").with_transform(TransformKind::MapPriority),
	)
	.with_field(
		FieldMapping::new("due_at", "metadata.due_at").with_transform(TransformKind::ParseDate),
	)
	.with_field(
		FieldMapping::new("progress", "progress").with_transform(TransformKind::ParseNumber),
	)
	.with_field(FieldMapping::new("tags", "tags").with_transform(TransformKind::ExtractTags))
	.with_validation(ValidationRule::required("title"))
	.with_validation(ValidationRule::number_range("progress", Some(0.0), Some(100.0)))
}

fn buildup_project() -> TransformationMapping {
	TransformationMapping::new(
		"buildup-project",
		SourceSystem::Buildup,
		"project",
		EntityType::Project,
	)
	.with_field(FieldMapping::new("title", "title").required())
	.with_field(FieldMapping::new("phase", "status").with_transform(TransformKind::MapStatus))
	.with_field(
		FieldMapping::new("completion", "progress").with_transform(TransformKind::ParseNumber),
	)
	.with_field(FieldMapping::new("focus_areas", "tags").with_transform(TransformKind::ExtractTags))
	.with_field(FieldMapping::new("coach.email", "metadata.coach_email"))
	.with_validation(ValidationRule::required("title"))
	.with_validation(ValidationRule::email("metadata.coach_email"))
}

fn buildup_kpi() -> TransformationMapping {
	TransformationMapping::new("buildup-kpi", SourceSystem::Buildup, "kpi", EntityType::Kpi)
		.with_condition(MappingCondition::exists("values"))
		.with_field(FieldMapping::new("name", "title").required())
		.with_field(
			FieldMapping::new("values", "scores").with_transform(TransformKind::NormalizeKpi),
		)
		.with_field(FieldMapping::new("period", "metadata.period"))
		.with_field(
			FieldMapping::new("target", "metadata.target")
				.with_transform(TransformKind::ParseNumber),
		)
		.with_field(FieldMapping::new("themes", "tags").with_transform(TransformKind::ExtractTags))
		.with_validation(ValidationRule::required("title"))
		.with_post_processor(PostProcessor::new("escalate-weak-axes", 10, |mut entity, _ctx| {
			// A KPI with any axis in the bottom quartile is raised to
			// critical so downstream systems surface it first.
			let weak = entity
				.get("scores")
				.and_then(|scores| scores.as_object())
				.is_some_and(|scores| {
					scores.values().filter_map(|v| v.as_f64()).any(|v| v < 25.0)
				});
			if weak {
				if let Some(map) = entity.as_object_mut() {
					map.insert("priority".to_string(), json!("critical"));
				}
			}
			Ok(entity)
		}))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stock_mappings_register_cleanly() {
		let registry = MappingRegistry::new();
		register_default_mappings(&registry);
		assert_eq!(registry.len(), 6);

		for (system, kind, target) in [
			(SourceSystem::V2, "project", EntityType::Project),
			(SourceSystem::V2, "recommendation", EntityType::Recommendation),
			(SourceSystem::Calendar, "event", EntityType::Event),
			(SourceSystem::Calendar, "task", EntityType::Task),
			(SourceSystem::Buildup, "project", EntityType::Project),
			(SourceSystem::Buildup, "kpi", EntityType::Kpi),
		] {
			let mapping = registry
				.find_best_mapping(system, kind, None)
				.unwrap_or_else(|| panic!("missing mapping for {system}/{kind}"));
			assert_eq!(mapping.target_entity_type, target);
		}
	}
}
