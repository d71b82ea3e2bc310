use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::model::{RawRecord, SourceSystem};

/// Capability interface over a per-system collector. The sync core only ever
/// sees this trait; production connectors and test fixtures are both just
/// implementations of it.
#[async_trait]
pub trait DataSource: Send + Sync {
	fn system(&self) -> SourceSystem;

	/// Pull the current batch of raw records from the system.
	async fn fetch_records(&self) -> anyhow::Result<Vec<RawRecord>>;
}

/// A data source backed by a mutable in-memory record list.
pub struct StaticDataSource {
	system: SourceSystem,
	records: Mutex<Vec<RawRecord>>,
}

impl StaticDataSource {
	pub fn new(system: SourceSystem) -> Self {
		Self {
			system,
			records: Mutex::new(Vec::new()),
		}
	}

	pub async fn push(&self, record: RawRecord) {
		self.records.lock().await.push(record);
	}

	pub async fn set_records(&self, records: Vec<RawRecord>) {
		*self.records.lock().await = records;
	}
}

#[async_trait]
impl DataSource for StaticDataSource {
	fn system(&self) -> SourceSystem {
		self.system
	}

	async fn fetch_records(&self) -> anyhow::Result<Vec<RawRecord>> {
		Ok(self.records.lock().await.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::RecordQuality;
	use serde_json::json;

	#[tokio::test]
	async fn static_source_returns_pushed_records() {
		let source = StaticDataSource::new(SourceSystem::Calendar);
		source
			.push(RawRecord::new(
				"r-1",
				"ext-1",
				SourceSystem::Calendar,
				json!({"type": "event"}),
				RecordQuality::High,
			))
			.await;

		let records = source.fetch_records().await.unwrap();
		assert_eq!(records.len(), 1);
		assert_eq!(source.system(), SourceSystem::Calendar);
	}
}
