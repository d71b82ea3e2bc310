use hostname;
use log::Level;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::model::{EntityType, ResolutionStrategy, SourceSystem};

/// How detection and execution are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
	/// Re-scan everything on a fixed poll interval.
	Batch,
	/// React to transformation-completed signals only.
	Realtime,
	/// Both: poll on the interval and react to signals.
	Hybrid,
}

impl SchedulingStrategy {
	pub fn polls(&self) -> bool {
		matches!(self, SchedulingStrategy::Batch | SchedulingStrategy::Hybrid)
	}

	pub fn reacts(&self) -> bool {
		matches!(self, SchedulingStrategy::Realtime | SchedulingStrategy::Hybrid)
	}
}

/// Direction entities flow for a system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
	Push,
	Pull,
	Bidirectional,
}

/// Orchestrator knobs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
	pub strategy: SchedulingStrategy,
	pub direction: SyncDirection,
	pub max_concurrent_operations: usize,
	pub default_timeout_ms: u64,
	pub tick_interval_ms: u64,
	pub stop_timeout_ms: u64,
}

impl Default for SyncSettings {
	fn default() -> Self {
		Self {
			strategy: SchedulingStrategy::Hybrid,
			direction: SyncDirection::Bidirectional,
			max_concurrent_operations: 5,
			default_timeout_ms: 10_000,
			tick_interval_ms: 100,
			stop_timeout_ms: 5_000,
		}
	}
}

/// Change detector knobs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
	pub poll_interval_ms: u64,
	/// Sliding window within which a repeated (entity, operation) pair is
	/// dropped as a duplicate.
	pub dedup_window_ms: u64,
	pub batch_size: usize,
	pub flush_interval_ms: u64,
}

impl Default for DetectionSettings {
	fn default() -> Self {
		Self {
			poll_interval_ms: 30_000,
			dedup_window_ms: 5_000,
			batch_size: 50,
			flush_interval_ms: 10_000,
		}
	}
}

/// Retry policy applied to recoverable sync failures.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
	pub max_attempts: u32,
	pub base_delay_ms: u64,
	pub max_delay_ms: u64,
	pub backoff_multiplier: f64,
	pub jitter_enabled: bool,
	/// Error codes that may be retried at all.
	pub retryable_errors: Vec<String>,
}

impl Default for RetrySettings {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_delay_ms: 1_000,
			max_delay_ms: 30_000,
			backoff_multiplier: 2.0,
			jitter_enabled: true,
			retryable_errors: vec![
				"NETWORK_TIMEOUT".to_string(),
				"TARGET_UNAVAILABLE".to_string(),
				"RATE_LIMITED".to_string(),
				"SYSTEM_BUSY".to_string(),
			],
		}
	}
}

/// Conflict detection thresholds. The numeric tolerance and KPI delta ceiling
/// are domain-tuned values carried as named knobs rather than inlined magic
/// numbers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConflictSettings {
	pub default_strategy: ResolutionStrategy,
	/// Updates by different actors within this window raise a version
	/// conflict.
	pub time_threshold_ms: i64,
	/// Numeric score/progress fields may drift this far before a field
	/// conflict is raised.
	pub numeric_tolerance: f64,
	/// KPI axis swings above this delta are escalated to manual review.
	pub kpi_delta_threshold: f64,
}

impl Default for ConflictSettings {
	fn default() -> Self {
		Self {
			default_strategy: ResolutionStrategy::LatestWins,
			time_threshold_ms: 5_000,
			numeric_tolerance: 5.0,
			kpi_delta_threshold: 30.0,
		}
	}
}

/// Per-target-system configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
	pub enabled: bool,
	pub direction: SyncDirection,
	/// Relative standing used when reporting; not a scheduling input.
	pub priority: u8,
	/// When non-empty, only these entity types sync to this system.
	pub include_entity_types: Vec<EntityType>,
	pub exclude_entity_types: Vec<EntityType>,
	pub connect_retry_attempts: u32,
	pub connect_retry_delay_ms: u64,
}

impl Default for SystemSettings {
	fn default() -> Self {
		Self {
			enabled: true,
			direction: SyncDirection::Bidirectional,
			priority: 5,
			include_entity_types: Vec::new(),
			exclude_entity_types: Vec::new(),
			connect_retry_attempts: 3,
			connect_retry_delay_ms: 1_000,
		}
	}
}

impl SystemSettings {
	/// Whether this system should receive the given entity type, after
	/// include/exclude filtering.
	pub fn accepts(&self, entity_type: EntityType) -> bool {
		if self.exclude_entity_types.contains(&entity_type) {
			return false;
		}
		self.include_entity_types.is_empty() || self.include_entity_types.contains(&entity_type)
	}
}

/// Per-entity-type configuration.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct EntityTypeSettings {
	pub critical_fields: Vec<String>,
	pub read_only_fields: Vec<String>,
	pub computed_fields: Vec<String>,
	/// Entity ids this type structurally depends on; deletes of those are
	/// escalated.
	pub dependencies: Vec<String>,
}

/// State manager knobs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StateSettings {
	pub snapshot_interval_ms: u64,
	pub snapshot_retention_hours: i64,
}

impl Default for StateSettings {
	fn default() -> Self {
		Self {
			snapshot_interval_ms: 60_000,
			snapshot_retention_hours: 24,
		}
	}
}

/// Runtime configuration for Concordia.
///
/// Values are loaded from (in order): `/etc/concordia/concordia.json`, a
/// `concordia/concordia.json` file in the user config folder (optional), and
/// environment variables prefixed with `CCD_` (e.g. `CCD_PORT`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
	pub host: String,
	pub port: u16,
	pub log_level: Level,
	pub sync: SyncSettings,
	pub detection: DetectionSettings,
	pub retry: RetrySettings,
	pub conflict: ConflictSettings,
	pub state: StateSettings,
	/// Keyed by system name (`v2`, `calendar`, `buildup`).
	pub systems: HashMap<String, SystemSettings>,
	/// Keyed by entity type name.
	pub entity_types: HashMap<String, EntityTypeSettings>,
}

impl Default for Settings {
	fn default() -> Self {
		let host = hostname::get()
			.ok()
			.and_then(|s| s.into_string().ok())
			.unwrap_or_else(|| "127.0.0.1".to_string());

		let mut systems = HashMap::new();
		for system in SourceSystem::ALL {
			systems.insert(system.as_str().to_string(), SystemSettings::default());
		}

		Self {
			host,
			port: 8088,
			log_level: Level::Info,
			sync: SyncSettings::default(),
			detection: DetectionSettings::default(),
			retry: RetrySettings::default(),
			conflict: ConflictSettings::default(),
			state: StateSettings::default(),
			systems,
			entity_types: HashMap::new(),
		}
	}
}

impl Settings {
	/// Configuration for a target system, defaulting when absent.
	pub fn system(&self, system: SourceSystem) -> SystemSettings {
		self.systems
			.get(system.as_str())
			.cloned()
			.unwrap_or_default()
	}

	pub fn entity_type(&self, entity_type: EntityType) -> EntityTypeSettings {
		self.entity_types
			.get(entity_type.as_str())
			.cloned()
			.unwrap_or_default()
	}
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),
}

pub fn load() -> Result<Settings, SettingsError> {
	let mut builder = config::Config::builder()
		.add_source(config::File::with_name("/etc/concordia/concordia.json").required(false));

	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("concordia").join("concordia.json");
		builder = builder.add_source(config::File::from(user_config_path).required(false));
	}

	builder = builder.add_source(config::Environment::with_prefix("CCD").separator("__"));

	let cfg = builder.build()?;
	let mut s: Settings = cfg.try_deserialize()?;

	// Explicitly prefer direct environment variables when present. Some
	// environments (CI, test harnesses) set env vars in ways the `config`
	// crate doesn't map as expected; read the common ones directly so
	// explicit overrides always take effect.
	if let Ok(h) = std::env::var("CCD_HOST") {
		if !h.is_empty() {
			s.host = h;
		}
	}
	if let Ok(p) = std::env::var("CCD_PORT") {
		if let Ok(pn) = p.parse::<u16>() {
			s.port = pn;
		}
	}
	if let Ok(l) = std::env::var("CCD_LOG_LEVEL") {
		if let Ok(parsed) = l.parse::<Level>() {
			s.log_level = parsed;
		}
	}
	if let Ok(m) = std::env::var("CCD_MAX_CONCURRENT_OPERATIONS") {
		if let Ok(parsed) = m.parse::<usize>() {
			s.sync.max_concurrent_operations = parsed;
		}
	}
	if let Ok(p) = std::env::var("CCD_POLL_INTERVAL_MS") {
		if let Ok(parsed) = p.parse::<u64>() {
			s.detection.poll_interval_ms = parsed;
		}
	}
	if let Ok(r) = std::env::var("CCD_RETRY_MAX_ATTEMPTS") {
		if let Ok(parsed) = r.parse::<u32>() {
			s.retry.max_attempts = parsed;
		}
	}

	Ok(s)
}
