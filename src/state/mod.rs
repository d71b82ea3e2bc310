use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::config::StateSettings;
use crate::model::SourceSystem;
use crate::observability::MetricsRegistry;

/// Exponential smoothing factor for per-system latency averages.
const LATENCY_ALPHA: f64 = 0.1;

/// Overall operational standing derived from the health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
	Healthy,
	Degraded,
	Critical,
}

impl HealthStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			HealthStatus::Healthy => "healthy",
			HealthStatus::Degraded => "degraded",
			HealthStatus::Critical => "critical",
		}
	}
}

impl fmt::Display for HealthStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// Mutable per-target-system aggregate. Recomputed, never authored by hand.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSyncState {
	pub system: SourceSystem,
	pub online: bool,
	pub pending: u64,
	pub in_progress: u64,
	pub completed_today: u64,
	pub failed_today: u64,
	/// Exponentially smoothed, in milliseconds.
	pub avg_latency_ms: f64,
	pub throughput_per_min: f64,
	pub error_rate: f64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_sync_at: Option<DateTime<Utc>>,
}

impl SystemSyncState {
	fn new(system: SourceSystem) -> Self {
		Self {
			system,
			online: true,
			pending: 0,
			in_progress: 0,
			completed_today: 0,
			failed_today: 0,
			avg_latency_ms: 0.0,
			throughput_per_min: 0.0,
			error_rate: 0.0,
			last_sync_at: None,
		}
	}

	fn refresh_error_rate(&mut self) {
		let finished = self.completed_today + self.failed_today;
		self.error_rate = if finished == 0 {
			0.0
		} else {
			self.failed_today as f64 / finished as f64
		};
	}
}

/// Global counters across all systems.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatistics {
	pub total_operations: u64,
	pub completed: u64,
	pub failed: u64,
	pub conflicts_detected: u64,
	pub conflicts_resolved: u64,
	pub success_rate: f64,
	pub avg_processing_ms: f64,
}

impl SyncStatistics {
	fn refresh_success_rate(&mut self) {
		let finished = self.completed + self.failed;
		self.success_rate = if finished == 0 {
			1.0
		} else {
			self.completed as f64 / finished as f64
		};
	}
}

/// Composite health view.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
	pub score: u8,
	pub status: HealthStatus,
	pub offline_systems: Vec<SourceSystem>,
	pub error_rate: f64,
	pub backlog: u64,
	pub avg_latency_ms: f64,
}

/// Point-in-time capture of the full sync state.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
	pub taken_at: DateTime<Utc>,
	pub systems: Vec<SystemSyncState>,
	pub statistics: SyncStatistics,
	pub health: HealthReport,
}

struct StateInner {
	systems: HashMap<SourceSystem, SystemSyncState>,
	statistics: SyncStatistics,
	/// Completion stamps inside the rolling throughput window, per system.
	completions: HashMap<SourceSystem, VecDeque<DateTime<Utc>>>,
	snapshots: Vec<StateSnapshot>,
}

/// Aggregates per-system and global statistics and scores overall health.
pub struct SyncStateManager {
	inner: RwLock<StateInner>,
	settings: StateSettings,
	metrics: Arc<MetricsRegistry>,
}

impl SyncStateManager {
	pub fn new(settings: StateSettings, metrics: Arc<MetricsRegistry>) -> Self {
		let mut systems = HashMap::new();
		let mut completions = HashMap::new();
		for system in SourceSystem::ALL {
			systems.insert(system, SystemSyncState::new(system));
			completions.insert(system, VecDeque::new());
		}
		Self {
			inner: RwLock::new(StateInner {
				systems,
				statistics: SyncStatistics {
					success_rate: 1.0,
					..SyncStatistics::default()
				},
				completions,
				snapshots: Vec::new(),
			}),
			settings,
			metrics,
		}
	}

	fn with_system<F>(&self, system: SourceSystem, apply: F)
	where
		F: FnOnce(&mut SystemSyncState, &mut SyncStatistics),
	{
		let mut inner = self.inner.write().expect("state lock poisoned");
		let StateInner {
			systems,
			statistics,
			..
		} = &mut *inner;
		let state = systems
			.entry(system)
			.or_insert_with(|| SystemSyncState::new(system));
		apply(state, statistics);
	}

	pub fn record_enqueued(&self, system: SourceSystem) {
		self.with_system(system, |state, stats| {
			state.pending += 1;
			stats.total_operations += 1;
		});
	}

	/// An enqueue that was suppressed or dropped before execution.
	pub fn record_dequeued(&self, system: SourceSystem) {
		self.with_system(system, |state, _| {
			state.pending = state.pending.saturating_sub(1);
		});
	}

	pub fn record_started(&self, system: SourceSystem) {
		self.with_system(system, |state, _| {
			state.pending = state.pending.saturating_sub(1);
			state.in_progress += 1;
		});
	}

	pub fn record_completed(&self, system: SourceSystem, latency_ms: f64) {
		let now = Utc::now();
		{
			let mut inner = self.inner.write().expect("state lock poisoned");
			let StateInner {
				systems,
				statistics,
				completions,
				..
			} = &mut *inner;
			let state = systems
				.entry(system)
				.or_insert_with(|| SystemSyncState::new(system));

			state.in_progress = state.in_progress.saturating_sub(1);
			state.completed_today += 1;
			state.last_sync_at = Some(now);
			state.avg_latency_ms = if state.completed_today == 1 {
				latency_ms
			} else {
				LATENCY_ALPHA * latency_ms + (1.0 - LATENCY_ALPHA) * state.avg_latency_ms
			};
			state.refresh_error_rate();

			let window = completions.entry(system).or_default();
			window.push_back(now);
			let cutoff = now - Duration::seconds(60);
			while window.front().is_some_and(|stamp| *stamp < cutoff) {
				window.pop_front();
			}
			state.throughput_per_min = window.len() as f64;

			statistics.completed += 1;
			statistics.refresh_success_rate();
			let n = statistics.completed as f64;
			statistics.avg_processing_ms =
				(statistics.avg_processing_ms * (n - 1.0) + latency_ms) / n;
		}
		debug!("{} completed a sync in {latency_ms:.0}ms", system);
	}

	pub fn record_failed(&self, system: SourceSystem) {
		self.with_system(system, |state, stats| {
			state.in_progress = state.in_progress.saturating_sub(1);
			state.failed_today += 1;
			state.refresh_error_rate();
			stats.failed += 1;
			stats.refresh_success_rate();
		});
	}

	/// A recoverable failure going back to the queue.
	pub fn record_requeued(&self, system: SourceSystem) {
		self.with_system(system, |state, _| {
			state.in_progress = state.in_progress.saturating_sub(1);
			state.pending += 1;
		});
	}

	pub fn record_conflicted(&self, system: SourceSystem) {
		self.with_system(system, |state, stats| {
			state.in_progress = state.in_progress.saturating_sub(1);
			stats.conflicts_detected += 1;
		});
	}

	pub fn record_conflicts_detected(&self, count: u64) {
		let mut inner = self.inner.write().expect("state lock poisoned");
		inner.statistics.conflicts_detected += count;
	}

	pub fn record_conflict_resolved(&self) {
		let mut inner = self.inner.write().expect("state lock poisoned");
		inner.statistics.conflicts_resolved += 1;
	}

	pub fn set_online(&self, system: SourceSystem, online: bool) {
		if !online {
			info!("{system} marked offline");
		}
		self.with_system(system, |state, _| state.online = online);
	}

	pub fn system_state(&self, system: SourceSystem) -> Option<SystemSyncState> {
		self.inner
			.read()
			.expect("state lock poisoned")
			.systems
			.get(&system)
			.cloned()
	}

	pub fn statistics(&self) -> SyncStatistics {
		self.inner
			.read()
			.expect("state lock poisoned")
			.statistics
			.clone()
	}

	/// Composite health score: start at 100 and deduct for offline systems,
	/// elevated error rate, backlog, and latency; floored at zero.
	pub fn health(&self) -> HealthReport {
		let inner = self.inner.read().expect("state lock poisoned");
		let mut score: i32 = 100;

		let offline_systems: Vec<SourceSystem> = inner
			.systems
			.values()
			.filter(|s| !s.online)
			.map(|s| s.system)
			.collect();
		score -= 20 * offline_systems.len() as i32;

		let finished = inner.statistics.completed + inner.statistics.failed;
		let error_rate = if finished == 0 {
			0.0
		} else {
			inner.statistics.failed as f64 / finished as f64
		};
		if error_rate > 0.10 {
			score -= 30;
		} else if error_rate > 0.05 {
			score -= 15;
		}

		let backlog: u64 = inner
			.systems
			.values()
			.map(|s| s.pending + s.in_progress)
			.sum();
		if backlog > 100 {
			score -= 20;
		} else if backlog > 50 {
			score -= 10;
		}

		let measured: Vec<f64> = inner
			.systems
			.values()
			.filter(|s| s.completed_today > 0)
			.map(|s| s.avg_latency_ms)
			.collect();
		let avg_latency_ms = if measured.is_empty() {
			0.0
		} else {
			measured.iter().sum::<f64>() / measured.len() as f64
		};
		if avg_latency_ms > 5000.0 {
			score -= 15;
		} else if avg_latency_ms > 2000.0 {
			score -= 5;
		}

		let score = score.max(0) as u8;
		let status = if score >= 90 {
			HealthStatus::Healthy
		} else if score >= 70 {
			HealthStatus::Degraded
		} else {
			HealthStatus::Critical
		};

		self.metrics.health_score.set(i64::from(score));

		HealthReport {
			score,
			status,
			offline_systems,
			error_rate,
			backlog,
			avg_latency_ms,
		}
	}

	/// Capture a snapshot of the full state and prune entries past the
	/// retention window.
	pub fn snapshot_now(&self) -> StateSnapshot {
		let health = self.health();
		let mut inner = self.inner.write().expect("state lock poisoned");

		let snapshot = StateSnapshot {
			taken_at: Utc::now(),
			systems: inner.systems.values().cloned().collect(),
			statistics: inner.statistics.clone(),
			health,
		};
		inner.snapshots.push(snapshot.clone());

		let cutoff = Utc::now() - Duration::hours(self.settings.snapshot_retention_hours);
		inner.snapshots.retain(|s| s.taken_at >= cutoff);

		snapshot
	}

	pub fn snapshots(&self) -> Vec<StateSnapshot> {
		self.inner
			.read()
			.expect("state lock poisoned")
			.snapshots
			.clone()
	}

	/// Periodic snapshot capture.
	pub fn spawn_snapshots(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		let manager = self;
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(tokio::time::Duration::from_millis(
				manager.settings.snapshot_interval_ms,
			));
			loop {
				tick.tick().await;
				let snapshot = manager.snapshot_now();
				debug!(
					"state snapshot captured: health {} ({})",
					snapshot.health.score, snapshot.health.status
				);
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn manager() -> SyncStateManager {
		SyncStateManager::new(StateSettings::default(), Arc::new(MetricsRegistry::new()))
	}

	#[test]
	fn pristine_state_is_perfectly_healthy() {
		let manager = manager();
		let report = manager.health();
		assert_eq!(report.score, 100);
		assert_eq!(report.status, HealthStatus::Healthy);
		assert!(report.offline_systems.is_empty());
	}

	#[test]
	fn healthy_after_fast_successes() {
		let manager = manager();
		for _ in 0..10 {
			manager.record_enqueued(SourceSystem::Calendar);
			manager.record_started(SourceSystem::Calendar);
			manager.record_completed(SourceSystem::Calendar, 150.0);
		}
		let report = manager.health();
		assert_eq!(report.score, 100);
		assert_eq!(report.status, HealthStatus::Healthy);
	}

	#[test]
	fn offline_systems_and_errors_deduct() {
		let manager = manager();
		manager.set_online(SourceSystem::V2, false);

		// 2 failures out of 10 finished: 20% error rate.
		for _ in 0..8 {
			manager.record_enqueued(SourceSystem::Calendar);
			manager.record_started(SourceSystem::Calendar);
			manager.record_completed(SourceSystem::Calendar, 100.0);
		}
		for _ in 0..2 {
			manager.record_enqueued(SourceSystem::Calendar);
			manager.record_started(SourceSystem::Calendar);
			manager.record_failed(SourceSystem::Calendar);
		}

		let report = manager.health();
		// 100 - 20 (offline) - 30 (error rate above 10%) = 50.
		assert_eq!(report.score, 50);
		assert_eq!(report.status, HealthStatus::Critical);
		assert_eq!(report.offline_systems, vec![SourceSystem::V2]);
	}

	#[test]
	fn backlog_deductions() {
		let manager = manager();
		for _ in 0..60 {
			manager.record_enqueued(SourceSystem::Buildup);
		}
		// Backlog of 60 sits in the >50 band.
		assert_eq!(manager.health().score, 90);

		for _ in 0..60 {
			manager.record_enqueued(SourceSystem::Buildup);
		}
		// 120 crosses the >100 band.
		assert_eq!(manager.health().score, 80);
	}

	#[test]
	fn latency_smoothing_and_deduction() {
		let manager = manager();
		manager.record_enqueued(SourceSystem::V2);
		manager.record_started(SourceSystem::V2);
		manager.record_completed(SourceSystem::V2, 6000.0);

		let state = manager.system_state(SourceSystem::V2).unwrap();
		assert_eq!(state.avg_latency_ms, 6000.0);

		// 100 - 15 for latency above 5000ms.
		assert_eq!(manager.health().score, 85);

		// Second sample moves the average by one alpha step.
		manager.record_enqueued(SourceSystem::V2);
		manager.record_started(SourceSystem::V2);
		manager.record_completed(SourceSystem::V2, 1000.0);
		let state = manager.system_state(SourceSystem::V2).unwrap();
		assert!((state.avg_latency_ms - 5500.0).abs() < 1e-9);
	}

	#[test]
	fn statistics_track_success_rate() {
		let manager = manager();
		manager.record_enqueued(SourceSystem::V2);
		manager.record_started(SourceSystem::V2);
		manager.record_completed(SourceSystem::V2, 10.0);
		manager.record_enqueued(SourceSystem::V2);
		manager.record_started(SourceSystem::V2);
		manager.record_failed(SourceSystem::V2);

		let stats = manager.statistics();
		assert_eq!(stats.total_operations, 2);
		assert_eq!(stats.completed, 1);
		assert_eq!(stats.failed, 1);
		assert!((stats.success_rate - 0.5).abs() < 1e-9);
	}

	#[test]
	fn snapshots_capture_and_prune() {
		let manager = manager();
		manager.snapshot_now();
		manager.snapshot_now();
		assert_eq!(manager.snapshots().len(), 2);
		// Retention pruning keeps recent snapshots intact.
		assert!(manager.snapshots().iter().all(|s| s.taken_at <= Utc::now()));
	}
}
