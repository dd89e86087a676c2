//! Songchain CLI
//!
//! Command-line front end for the songchain pipeline.

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use songchain::cli::commands;
use songchain::cli::{Cli, Commands};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Songchain v{}", env!("CARGO_PKG_VERSION"));

    let Some(command) = cli.command else {
        println!("Songchain v{}", env!("CARGO_PKG_VERSION"));
        println!("Use --help for available commands");
        return Ok(());
    };

    if let Commands::InitConfig { path } = &command {
        return commands::init_config(path)
            .with_context(|| format!("writing configuration to {}", path.display()));
    }

    let config = commands::load_config(cli.config.as_deref()).context("loading configuration")?;

    match command {
        Commands::Generate {
            song,
            output,
            bit_depth,
            report,
        } => commands::generate(config, cli.synthetic, &song, &output, bit_depth, report.as_deref())
            .context("song generation failed"),
        Commands::Estimate {
            song,
            hardware,
            json,
        } => commands::estimate(&config, &song, hardware.as_deref(), json).context("estimate failed"),
        Commands::Probe { json } => commands::probe(&config, cli.synthetic, json).context("probe failed"),
        Commands::InitConfig { .. } => Ok(()),
    }
}
