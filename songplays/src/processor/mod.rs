mod activity;
mod catalog;
mod config;
mod dedup;
mod facts;
mod keys;
mod reader;
mod time;
mod udf;

pub use activity::{enrich_activity, users_table};
pub use catalog::{artists_table, songs_table};
pub use config::build_session_context;
pub use dedup::DedupMetrics;
pub use facts::FactResolver;
pub use keys::{KeyGenerator, MonotonicIdGenerator};
pub use reader::RecordReader;
pub use time::time_table;
pub use udf::register_udfs;

use crate::schema::Dataset;
use crate::storage::{Materialized, PartitionedWriter, StorageLocation, StorageManager};
use common::Result;
use common::config::{PipelineConfig, Settings};
use datafusion::execution::context::SessionContext;
use datafusion::prelude::DataFrame;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Songs and artists as written by this run.
pub struct CatalogOutputs {
    pub songs: Materialized,
    pub artists: Materialized,
}

/// The enriched playback events plus the dimensions derived from them.
pub struct ActivityOutputs {
    pub activity: DataFrame,
    pub users: Materialized,
    pub time: Materialized,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub songs: usize,
    pub artists: usize,
    pub users: usize,
    pub time: usize,
    pub songplays: usize,
}

/// Coordinates the catalog, activity and fact stages of one run
pub struct SongplaysProcessor {
    ctx: SessionContext,
    pipeline: PipelineConfig,
    song_data: StorageLocation,
    log_data: StorageLocation,
    writer: PartitionedWriter,
    key_generator: Arc<dyn KeyGenerator>,
}

impl SongplaysProcessor {
    pub fn new(settings: &Settings) -> Result<Self> {
        let ctx = build_session_context(&settings.pipeline)?;
        let storage = StorageManager::new(settings.storage.clone());

        let input = storage.resolve_input(&settings.paths.input)?;
        let output = storage.resolve_output(&settings.paths.output)?;
        storage.register_object_stores(&ctx)?;

        info!(input = %input, output = %output, "Storage resolved");

        Ok(Self {
            song_data: input.child(&settings.sources.song_data)?,
            log_data: input.child(&settings.sources.log_data)?,
            writer: PartitionedWriter::new(output, settings.pipeline.write_mode),
            pipeline: settings.pipeline.clone(),
            key_generator: Arc::new(MonotonicIdGenerator),
            ctx,
        })
    }

    pub fn run_id(&self) -> &str {
        self.writer.run_id()
    }

    fn reader(&self) -> RecordReader {
        RecordReader::new(self.ctx.clone(), self.pipeline.schema_infer_max_records)
    }

    pub async fn process_song_data(&self) -> Result<CatalogOutputs> {
        let song_data = self.reader().read(Dataset::SongData, &self.song_data).await?;

        let songs = songs_table(&song_data).await?;
        let artists = artists_table(&song_data).await?;

        let (songs, artists) = futures::try_join!(
            self.writer.write(Dataset::Songs, songs),
            self.writer.write(Dataset::Artists, artists),
        )?;

        Ok(CatalogOutputs { songs, artists })
    }

    pub async fn process_log_data(&self) -> Result<ActivityOutputs> {
        let log_data = self.reader().read(Dataset::LogData, &self.log_data).await?;

        let activity = enrich_activity(log_data)?.cache().await?;
        let users = users_table(&activity, self.pipeline.user_dedup).await?;
        let time = time_table(&activity).await?;

        let (users, time) = futures::try_join!(
            self.writer.write(Dataset::Users, users),
            self.writer.write(Dataset::Time, time),
        )?;

        Ok(ActivityOutputs {
            activity,
            users,
            time,
        })
    }

    /// Requires the catalog receipts, so it can only follow `process_song_data`.
    pub async fn process_songplays(
        &self,
        activity: &ActivityOutputs,
        catalog: &CatalogOutputs,
    ) -> Result<Materialized> {
        let resolver = FactResolver::new(
            self.ctx.clone(),
            self.key_generator.clone(),
            self.pipeline.duration_tolerance,
        );
        let songplays = resolver
            .resolve(&activity.activity, &catalog.songs, &catalog.artists)
            .await?;
        self.writer.write(Dataset::Songplays, songplays).await
    }

    pub async fn run(&self) -> Result<RunSummary> {
        info!(run_id = self.run_id(), "Starting songplays run");

        let (catalog, activity) =
            futures::try_join!(self.process_song_data(), self.process_log_data())?;
        let songplays = self.process_songplays(&activity, &catalog).await?;

        let summary = RunSummary {
            run_id: self.run_id().to_string(),
            songs: catalog.songs.rows(),
            artists: catalog.artists.rows(),
            users: activity.users.rows(),
            time: activity.time.rows(),
            songplays: songplays.rows(),
        };
        info!(
            run_id = %summary.run_id,
            songs = summary.songs,
            artists = summary.artists,
            users = summary.users,
            time = summary.time,
            songplays = summary.songplays,
            songplay_partitions = songplays.partitions().len(),
            "Run complete"
        );
        Ok(summary)
    }
}
