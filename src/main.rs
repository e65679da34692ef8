use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vanopticon_bifrost::config;
use vanopticon_bifrost::observability::init_observability;
use vanopticon_bifrost::simulate::{SimulationOptions, simulate};

#[derive(Parser)]
#[command(name = "bifrost", about = "Bifrost - offline-first record synchronization")]
struct Cli {
	/// Load settings from this file instead of the standard locations
	#[arg(long, global = true, env = "BFR_CONFIG")]
	config: Option<PathBuf>,
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Print the effective settings as JSON
	ShowConfig,
	/// Run a scripted sync against the in-process backend
	Simulate {
		/// New local records to push
		#[arg(long, default_value_t = 20)]
		records: usize,
		/// Records edited on both sides before syncing
		#[arg(long, default_value_t = 3)]
		conflicts: usize,
		/// Network failures to inject into record creation
		#[arg(long, default_value_t = 2)]
		failures: u32,
	},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let settings = match &cli.config {
		Some(path) => config::load_from(path)
			.with_context(|| format!("loading settings from {}", path.display()))?,
		None => match config::load() {
			Ok(s) => s,
			Err(e) => {
				eprintln!("Warning: failed to load config, using defaults: {}", e);
				config::Settings::default()
			}
		},
	};

	match cli.command.unwrap_or(Commands::ShowConfig) {
		Commands::ShowConfig => {
			println!("{}", serde_json::to_string_pretty(&settings)?);
		}
		Commands::Simulate {
			records,
			conflicts,
			failures,
		} => {
			let obs = init_observability(settings.log_level.as_str(), settings.log_file.as_deref())?;
			let report = simulate(
				&settings,
				SimulationOptions {
					records,
					conflicts,
					failures,
				},
				obs.metrics,
			)
			.await
			.context("simulation failed")?;

			println!("{}", serde_json::to_string_pretty(&report)?);
			println!("{}", report.metrics);
		}
	}
	Ok(())
}
