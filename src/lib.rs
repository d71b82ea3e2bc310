pub mod config;
pub mod detect;
pub mod engine;
pub mod events;
pub mod http;
pub mod mapping;
pub mod model;
pub mod observability;
pub mod resolve;
pub mod state;
pub mod store;
pub mod transform;

use anyhow::Context;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, interval};

use crate::config::Settings;
use crate::detect::ChangeDetector;
use crate::engine::{DataSource, InMemoryTargetSystem, SyncEngine};
use crate::events::EventBus;
use crate::mapping::MappingRegistry;
use crate::model::SourceSystem;
use crate::observability::MetricsRegistry;
use crate::resolve::ConflictResolver;
use crate::state::SyncStateManager;
use crate::store::EntityStore;
use crate::transform::TransformationEngine;

/// Everything `run` wires together, exposed so embedders and integration
/// tests can drive the hub without the HTTP server or signal handling.
pub struct Hub {
	pub settings: Settings,
	pub bus: EventBus,
	pub metrics: Arc<MetricsRegistry>,
	pub store: Arc<EntityStore>,
	pub registry: Arc<MappingRegistry>,
	pub transformer: Arc<TransformationEngine>,
	pub detector: Arc<ChangeDetector>,
	pub resolver: Arc<ConflictResolver>,
	pub state: Arc<SyncStateManager>,
	pub engine: Arc<SyncEngine>,
}

impl Hub {
	/// Construct every service and wire them together once. No hidden
	/// globals: all components receive their collaborators explicitly.
	pub fn build(settings: Settings) -> Self {
		let bus = EventBus::default();
		let metrics = Arc::new(MetricsRegistry::new());
		let store = Arc::new(EntityStore::new());

		let registry = Arc::new(MappingRegistry::new());
		mapping::defaults::register_default_mappings(&registry);

		let transformer = Arc::new(TransformationEngine::new(
			Arc::clone(&registry),
			Arc::clone(&store),
			bus.clone(),
			Arc::clone(&metrics),
		));

		let (change_tx, change_rx) = mpsc::channel(1024);
		let detector = Arc::new(ChangeDetector::new(
			Arc::clone(&store),
			bus.clone(),
			Arc::clone(&metrics),
			settings.detection.clone(),
			change_tx,
		));

		let resolver = Arc::new(
			ConflictResolver::new(
				settings.conflict.clone(),
				Arc::clone(&store),
				bus.clone(),
				Arc::clone(&metrics),
			)
			.with_entity_type_settings(settings.entity_types.clone()),
		);

		let state = Arc::new(SyncStateManager::new(
			settings.state.clone(),
			Arc::clone(&metrics),
		));

		let engine = Arc::new(SyncEngine::new(
			settings.clone(),
			Arc::clone(&detector),
			Arc::clone(&resolver),
			Arc::clone(&state),
			bus.clone(),
			Arc::clone(&metrics),
			change_rx,
		));

		Self {
			settings,
			bus,
			metrics,
			store,
			registry,
			transformer,
			detector,
			resolver,
			state,
			engine,
		}
	}

	/// Start the engine, the detection loop, and the snapshot loop. The
	/// in-memory adapters back the three target systems.
	pub fn start(&self) -> anyhow::Result<()> {
		for system in SourceSystem::ALL {
			self.engine
				.register_handler(Arc::new(InMemoryTargetSystem::new(system)));
		}
		Arc::clone(&self.engine)
			.start()
			.context("starting sync engine")?;
		Arc::clone(&self.detector).spawn(self.settings.sync.strategy);
		Arc::clone(&self.state).spawn_snapshots();
		Ok(())
	}

	/// Poll the registered data sources on the detection interval, feeding
	/// fetched records through the transformation engine. In hybrid and
	/// realtime modes the detector reacts to each completed transform; in
	/// batch mode its own poll loop picks the entities up.
	pub fn spawn_ingest(
		&self,
		sources: Vec<Arc<dyn DataSource>>,
	) -> tokio::task::JoinHandle<()> {
		let transformer = Arc::clone(&self.transformer);
		let poll_interval = self.settings.detection.poll_interval_ms;
		tokio::spawn(async move {
			let mut tick = interval(Duration::from_millis(poll_interval.max(100)));
			loop {
				tick.tick().await;
				for source in &sources {
					match source.fetch_records().await {
						Ok(records) if records.is_empty() => {}
						Ok(records) => {
							info!(
								"fetched {} records from {}",
								records.len(),
								source.system()
							);
							transformer.transform_batch(&records, None).await;
						}
						Err(e) => {
							warn!("fetching records from {} failed: {e:#}", source.system());
						}
					}
				}
			}
		})
	}
}

/// Run the hub as a service: wire components, start the loops, serve the
/// operational HTTP endpoints, and stop cleanly on ctrl-c.
pub async fn run(settings: Settings, sources: Vec<Arc<dyn DataSource>>) -> anyhow::Result<()> {
	let hub = Hub::build(settings);
	hub.start()?;
	hub.spawn_ingest(sources);

	let app = http::router(http::AppState {
		engine: Arc::clone(&hub.engine),
		state: Arc::clone(&hub.state),
		metrics: Arc::clone(&hub.metrics),
	});

	let addr = format!("{}:{}", hub.settings.host, hub.settings.port);
	let listener = tokio::net::TcpListener::bind(&addr)
		.await
		.with_context(|| format!("binding {addr}"))?;
	info!("concordia listening on http://{addr} (GET /health, GET /metrics, POST /sync/trigger)");

	axum::serve(listener, app)
		.with_graceful_shutdown(async {
			let _ = tokio::signal::ctrl_c().await;
			info!("shutdown signal received");
		})
		.await
		.context("serving http")?;

	hub.engine.stop().await;
	Ok(())
}
