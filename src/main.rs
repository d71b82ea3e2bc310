use clap::{Parser, Subcommand};
use concordia::engine::{DataSource, StaticDataSource};
use concordia::model::{RawRecord, RecordQuality, SourceSystem};
use concordia::observability;
use concordia::{config, run};
use serde_json::json;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "concordia", about = "Concordia - entity reconciliation and synchronization hub")]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Run the hub (default)
	Run,
	/// Load and print the effective configuration, then exit
	CheckConfig,
	/// Run the hub with synthetic in-memory data sources
	Demo {
		/// Records to seed per source system
		#[arg(long, default_value_t = 5)]
		records: usize,
	},
}

/// Build one static data source per system, seeded with plausible records.
async fn demo_sources(records_per_system: usize) -> Vec<Arc<dyn DataSource>> {
	let v2 = StaticDataSource::new(SourceSystem::V2);
	let calendar = StaticDataSource::new(SourceSystem::Calendar);
	let buildup = StaticDataSource::new(SourceSystem::Buildup);

	for i in 0..records_per_system {
		v2.push(RawRecord::new(
			format!("v2-{i}"),
			format!("proj-{i}"),
			SourceSystem::V2,
			json!({
				"type": "project",
				"name": format!("Project {i}"),
				"state": if i % 3 == 0 { "open" } else { "planned" },
				"labels": "demo, seeded",
				"progress": (i * 17 % 100) as f64,
			}),
			RecordQuality::High,
		))
		.await;

		calendar.push(RawRecord::new(
			format!("cal-{i}"),
			format!("evt-{i}"),
			SourceSystem::Calendar,
			json!({
				"type": "event",
				"summary": format!("Review session {i}"),
				"status": "confirmed",
				"starts_at": "2026-08-10T09:00:00Z",
				"ends_at": "2026-08-10T10:00:00Z",
				"categories": "demo",
			}),
			RecordQuality::Medium,
		))
		.await;

		buildup.push(RawRecord::new(
			format!("bld-{i}"),
			format!("kpi-{i}"),
			SourceSystem::Buildup,
			json!({
				"type": "kpi",
				"name": format!("Growth KPI {i}"),
				"values": {
					"performance": (40 + i * 13 % 60) as f64,
					"quality": (55 + i * 7 % 45) as f64,
					"growth": (i * 29 % 110) as f64,
				},
				"period": "2026-Q3",
				"themes": "demo, kpi",
			}),
			RecordQuality::High,
		))
		.await;
	}

	vec![
		Arc::new(v2) as Arc<dyn DataSource>,
		Arc::new(calendar) as Arc<dyn DataSource>,
		Arc::new(buildup) as Arc<dyn DataSource>,
	]
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	let settings = match config::load() {
		Ok(settings) => settings,
		Err(e) => {
			eprintln!("failed to load config, using defaults: {e}");
			config::Settings::default()
		}
	};

	if let Err(e) = observability::init_logging(settings.log_level) {
		eprintln!("failed to initialize logging: {e}");
	}

	match cli.command.unwrap_or(Commands::Run) {
		Commands::CheckConfig => {
			println!("{settings:#?}");
		}
		Commands::Run => {
			if let Err(e) = run(settings, Vec::new()).await {
				eprintln!("concordia exited with error: {e:#}");
				std::process::exit(1);
			}
		}
		Commands::Demo { records } => {
			let sources = demo_sources(records).await;
			if let Err(e) = run(settings, sources).await {
				eprintln!("concordia exited with error: {e:#}");
				std::process::exit(1);
			}
		}
	}
}
