use anyhow::Context;
use clap::{Arg, Command};
use common::config::{LoggingConfig, Settings};
use std::process;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "config/songplays.toml";

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config_path: &str) -> anyhow::Result<()> {
    let settings = Settings::new(config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;
    init_tracing(&settings.logging);
    info!(config = config_path, "Starting songplays pipeline");

    let summary = songplays::run_with_settings(&settings)
        .await
        .context("songplays pipeline failed")?;
    info!(
        run_id = %summary.run_id,
        songplays = summary.songplays,
        "Pipeline finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = Command::new("songplays-etl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Builds the songplays star schema from song and event logs")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Sets a custom config file"),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(|s| s.as_str())
        .unwrap_or(DEFAULT_CONFIG);

    if let Err(e) = run(config_path).await {
        eprintln!("songplays-etl error: {:#}", e);
        process::exit(1);
    }
}
