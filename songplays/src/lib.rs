pub mod processor;
pub mod schema;
pub mod storage;
pub mod utils;

use common::Result;
use common::config::Settings;
use processor::{RunSummary, SongplaysProcessor};

/// Runs the complete songplays pipeline with settings loaded from `config_path`
pub async fn run_pipeline(config_path: &str) -> Result<RunSummary> {
    let settings = Settings::new(config_path)?;
    run_with_settings(&settings).await
}

pub async fn run_with_settings(settings: &Settings) -> Result<RunSummary> {
    SongplaysProcessor::new(settings)?.run().await
}
