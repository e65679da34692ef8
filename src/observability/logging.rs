use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;
use std::path::Path;
use std::str::FromStr;

/// Parse a level name, falling back to `info` for anything unrecognized.
pub fn parse_level(level: &str) -> LevelFilter {
	LevelFilter::from_str(level.trim()).unwrap_or(LevelFilter::Info)
}

/// Install the global logger: colored lines on stderr, plain lines in
/// `log_file` when one is given.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> anyhow::Result<()> {
	let colors = ColoredLevelConfig::new()
		.error(Color::Red)
		.warn(Color::Yellow)
		.info(Color::Green)
		.debug(Color::Blue)
		.trace(Color::BrightBlack);

	let stderr = fern::Dispatch::new()
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} {:<5} [{}] {}",
				chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
				colors.color(record.level()),
				record.target(),
				message
			))
		})
		.chain(std::io::stderr());

	let mut root = fern::Dispatch::new().level(parse_level(level)).chain(stderr);

	if let Some(path) = log_file {
		let file = fern::Dispatch::new()
			.format(|out, message, record| {
				out.finish(format_args!(
					"{} {:<5} [{}] {}",
					chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
					record.level(),
					record.target(),
					message
				))
			})
			.chain(fern::log_file(path)?);
		root = root.chain(file);
	}

	root.apply()
		.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
	Ok(())
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn parse_level_names() {
		assert_eq!(parse_level("debug"), LevelFilter::Debug);
		assert_eq!(parse_level(" WARN "), LevelFilter::Warn);
		assert_eq!(parse_level("loud"), LevelFilter::Info);
	}

	#[test]
	fn logging_initialization() {
		// A logger can be installed once per process; a second call errors.
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("bifrost.log");
		let _ = init_logging("info", Some(&path));
		assert!(init_logging("info", None).is_err());
	}
}
