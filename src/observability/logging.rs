use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

/// Initialize leveled, colored logging to stdout with timestamps and module
/// targets. Safe to call more than once; later calls are no-ops.
pub fn init_logging(level: log::Level) -> anyhow::Result<()> {
	let colors = ColoredLevelConfig::new()
		.error(Color::Red)
		.warn(Color::Yellow)
		.info(Color::Green)
		.debug(Color::BrightBlack)
		.trace(Color::Magenta);

	let result = fern::Dispatch::new()
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} [{}] {}: {}",
				chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
				colors.color(record.level()),
				record.target(),
				message
			))
		})
		.level(level.to_level_filter())
		// The config crate walks the filesystem at load; keep it quiet.
		.level_for("config", LevelFilter::Warn)
		.chain(std::io::stdout())
		.apply();

	// A second initialization (tests, embedded use) is not an error.
	if let Err(e) = result {
		log::debug!("logging already initialized: {e}");
	}

	Ok(())
}

#[cfg(feature = "unit-tests")]
mod tests {
	#[test]
	fn logging_initialization_is_idempotent() {
		let _ = super::init_logging(log::Level::Info);
		let _ = super::init_logging(log::Level::Debug);
	}
}
