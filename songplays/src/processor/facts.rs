use super::keys::KeyGenerator;
use crate::schema::{Dataset, require_columns};
use crate::storage::Materialized;
use arrow::array::ArrayRef;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use common::{Error, Result};
use datafusion::datasource::MemTable;
use datafusion::execution::SendableRecordBatchStream;
use datafusion::execution::context::SessionContext;
use datafusion::logical_expr::JoinType;
use datafusion::prelude::*;
use futures::TryStreamExt;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info};

const FACT_SOURCE_COLUMNS: [&str; 9] = [
    "song",
    "artist",
    "length",
    "userId",
    "level",
    "sessionId",
    "location",
    "userAgent",
    "start_time",
];

/// Resolves song and artist foreign keys for playback events and assigns the
/// surrogate `songplay_id`.
pub struct FactResolver {
    ctx: SessionContext,
    key_generator: Arc<dyn KeyGenerator>,
    duration_tolerance: Option<f64>,
}

impl FactResolver {
    pub fn new(
        ctx: SessionContext,
        key_generator: Arc<dyn KeyGenerator>,
        duration_tolerance: Option<f64>,
    ) -> Self {
        Self {
            ctx,
            key_generator,
            duration_tolerance: duration_tolerance.filter(|tol| *tol > 0.0),
        }
    }

    /// Songs and artists are read back from storage; the receipts prove they
    /// were written by this run before anything is joined.
    pub async fn resolve(
        &self,
        activity: &DataFrame,
        songs: &Materialized,
        artists: &Materialized,
    ) -> Result<DataFrame> {
        let reference = self.reference_set(songs, artists).await?;
        require_columns(activity.schema(), Dataset::LogData, &FACT_SOURCE_COLUMNS)?;

        let plays = activity
            .clone()
            .with_column("play_song", cast(ident("song"), DataType::Utf8))?
            .with_column("play_artist", cast(ident("artist"), DataType::Utf8))?
            .with_column("play_length", cast(ident("length"), DataType::Float64))?;

        let joined = match self.duration_tolerance {
            None => plays.join(
                reference,
                JoinType::Left,
                &["play_song", "play_artist", "play_length"],
                &["ref_title", "ref_name", "ref_duration"],
                None,
            )?,
            Some(tolerance) => plays.join_on(
                reference,
                JoinType::Left,
                [
                    col("play_song").eq(col("ref_title")),
                    col("play_artist").eq(col("ref_name")),
                    (col("play_length") - col("ref_duration")).lt_eq(lit(tolerance)),
                    (col("ref_duration") - col("play_length")).lt_eq(lit(tolerance)),
                ],
            )?,
        };

        let facts = joined.select(vec![
            col("start_time"),
            cast(ident("userId"), DataType::Utf8).alias("user_id"),
            cast(ident("level"), DataType::Utf8).alias("level"),
            col("song_id"),
            col("artist_id"),
            cast(ident("sessionId"), DataType::Int64).alias("session_id"),
            cast(ident("location"), DataType::Utf8).alias("location"),
            cast(ident("userAgent"), DataType::Utf8).alias("user_agent"),
            cast(ident("year"), DataType::Int32).alias("year"),
            cast(ident("month"), DataType::Int32).alias("month"),
        ])?;

        self.assign_keys(facts).await
    }

    /// Songs left-joined to artists, renamed so no column collides with the
    /// activity columns.
    async fn reference_set(&self, songs: &Materialized, artists: &Materialized) -> Result<DataFrame> {
        expect_dataset(songs, Dataset::Songs)?;
        expect_dataset(artists, Dataset::Artists)?;
        songs.verify().await?;
        artists.verify().await?;

        let songs_df = self.read_receipt(songs).await?;
        let artists_df = self
            .read_receipt(artists)
            .await?
            .select(vec![
                col("artist_id").alias("ref_artist_id"),
                col("name").alias("ref_name"),
            ])?;

        let reference = songs_df
            .join(
                artists_df,
                JoinType::Left,
                &["artist_id"],
                &["ref_artist_id"],
                None,
            )?
            .select(vec![
                cast(col("song_id"), DataType::Utf8).alias("song_id"),
                cast(col("artist_id"), DataType::Utf8).alias("artist_id"),
                cast(col("title"), DataType::Utf8).alias("ref_title"),
                cast(col("ref_name"), DataType::Utf8).alias("ref_name"),
                cast(col("duration"), DataType::Float64).alias("ref_duration"),
            ])?;

        debug!(
            songs = songs.rows(),
            song_files = songs.files().len(),
            artists = artists.rows(),
            artist_files = artists.files().len(),
            "Reference set ready"
        );
        Ok(reference)
    }

    /// Reads the files named by the receipt, not everything under its prefix.
    async fn read_receipt(&self, receipt: &Materialized) -> Result<DataFrame> {
        let urls: Vec<String> = receipt
            .file_urls()?
            .into_iter()
            .map(String::from)
            .collect();
        Ok(self
            .ctx
            .read_parquet(urls, ParquetReadOptions::default())
            .await?)
    }

    /// Executes `facts` partition by partition and prepends `songplay_id`.
    async fn assign_keys(&self, facts: DataFrame) -> Result<DataFrame> {
        let logical_schema: SchemaRef = Arc::new(facts.schema().as_arrow().clone());
        let streams = facts.execute_stream_partitioned().await?;
        let input_schema = streams
            .first()
            .map(|stream| stream.schema())
            .unwrap_or(logical_schema);

        let mut fields = vec![Arc::new(Field::new("songplay_id", DataType::Int64, false))];
        fields.extend(input_schema.fields().iter().cloned());
        let output_schema = Arc::new(Schema::new(fields));

        let partitions = try_join_all(streams.into_iter().enumerate().map(|(index, stream)| {
            self.key_partition(index, stream, output_schema.clone())
        }))
        .await?;

        let rows: usize = partitions
            .iter()
            .flat_map(|batches| batches.iter().map(|b| b.num_rows()))
            .sum();
        info!(rows, partitions = partitions.len(), "Assigned songplay keys");

        let table = MemTable::try_new(output_schema, partitions)?;
        Ok(self.ctx.read_table(Arc::new(table))?)
    }

    async fn key_partition(
        &self,
        partition: usize,
        stream: SendableRecordBatchStream,
        schema: SchemaRef,
    ) -> Result<Vec<RecordBatch>> {
        let batches: Vec<RecordBatch> = stream.try_collect().await?;

        let mut offset = 0u64;
        let mut keyed = Vec::with_capacity(batches.len());
        for batch in batches {
            let keys = self
                .key_generator
                .generate(partition, offset, batch.num_rows())?;
            offset += batch.num_rows() as u64;

            let mut columns: Vec<ArrayRef> = vec![Arc::new(keys)];
            columns.extend(batch.columns().iter().cloned());
            keyed.push(RecordBatch::try_new(schema.clone(), columns)?);
        }
        Ok(keyed)
    }
}

fn expect_dataset(receipt: &Materialized, expected: Dataset) -> Result<()> {
    if receipt.dataset() != expected {
        return Err(Error::InvalidInput(format!(
            "expected a {} receipt, got {}",
            expected,
            receipt.dataset()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::activity::enrich_activity;
    use crate::processor::catalog::{artists_table, songs_table};
    use crate::processor::config::build_session_context;
    use crate::processor::keys::MonotonicIdGenerator;
    use crate::schema::{songplays_schema, validate_schema};
    use crate::storage::{PartitionedWriter, StorageManager};
    use arrow::array::{Array, Int64Array, StringArray};
    use common::config::{PipelineConfig, WriteMode};
    use std::collections::HashSet;

    const CATALOG: &str = concat!(
        r#"{"artist_id": "AR5KOSW1187FB35FF4", "artist_latitude": 49.80388, "artist_location": "Dubai UAE", "artist_longitude": 15.47491, "artist_name": "Elena", "duration": 269.58322, "num_songs": 1, "song_id": "SOZCTXZ12AB0182364", "title": "Setanta matins", "year": 0}"#,
        "\n",
        r#"{"artist_id": "ARKFYS91187B98E58F", "artist_latitude": null, "artist_location": "", "artist_longitude": null, "artist_name": "Jeff And Sheri Easter", "duration": 267.7024, "num_songs": 1, "song_id": "SOYMRWW12A6D4FAB14", "title": "The Moon And I (Ordinary Day Album Version)", "year": 0}"#,
        "\n",
    );

    const LOG: &str = concat!(
        r#"{"artist": "Elena", "firstName": "Lily", "gender": "F", "lastName": "Koch", "length": 269.58322, "level": "paid", "location": "Chicago-Naperville-Elgin, IL-IN-WI", "page": "NextSong", "sessionId": 818, "song": "Setanta matins", "ts": 1541121934796, "userAgent": "Mozilla/5.0", "userId": "15"}"#,
        "\n",
        r#"{"artist": "Jeff And Sheri Easter", "firstName": "Lily", "gender": "F", "lastName": "Koch", "length": 267.7034, "level": "paid", "location": "Chicago-Naperville-Elgin, IL-IN-WI", "page": "NextSong", "sessionId": 818, "song": "The Moon And I (Ordinary Day Album Version)", "ts": 1541122241796, "userAgent": "Mozilla/5.0", "userId": "15"}"#,
        "\n",
        r#"{"artist": "Nobody", "firstName": "Lily", "gender": "F", "lastName": "Koch", "length": 100.0, "level": "paid", "location": "Chicago-Naperville-Elgin, IL-IN-WI", "page": "NextSong", "sessionId": 818, "song": "Unknown", "ts": 1541122541796, "userAgent": "Mozilla/5.0", "userId": "15"}"#,
        "\n",
    );

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: SessionContext,
        activity: DataFrame,
        songs: Materialized,
        artists: Materialized,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ctx = build_session_context(&PipelineConfig::default()).unwrap();
        std::fs::write(dir.path().join("songs.json"), CATALOG).unwrap();
        std::fs::write(dir.path().join("events.json"), LOG).unwrap();

        let catalog = ctx
            .read_json(
                dir.path().join("songs.json").to_str().unwrap(),
                NdJsonReadOptions::default(),
            )
            .await
            .unwrap();
        let log = ctx
            .read_json(
                dir.path().join("events.json").to_str().unwrap(),
                NdJsonReadOptions::default(),
            )
            .await
            .unwrap();

        let output = StorageManager::new(None)
            .resolve_output(dir.path().join("out").to_str().unwrap())
            .unwrap();
        let writer = PartitionedWriter::new(output, WriteMode::Overwrite);
        let songs = writer
            .write(Dataset::Songs, songs_table(&catalog).await.unwrap())
            .await
            .unwrap();
        let artists = writer
            .write(Dataset::Artists, artists_table(&catalog).await.unwrap())
            .await
            .unwrap();
        let activity = enrich_activity(log).unwrap().cache().await.unwrap();

        Fixture {
            _dir: dir,
            ctx,
            activity,
            songs,
            artists,
        }
    }

    async fn song_ids(df: DataFrame) -> Vec<Option<String>> {
        let batches = df
            .sort(vec![col("start_time").sort(true, false)])
            .unwrap()
            .collect()
            .await
            .unwrap();
        let batch = arrow::compute::concat_batches(&batches[0].schema(), &batches).unwrap();
        let ids = batch
            .column_by_name("song_id")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        (0..ids.len())
            .map(|i| (!ids.is_null(i)).then(|| ids.value(i).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_exact_match_resolves_and_misses_keep_rows() {
        let f = fixture().await;
        let resolver = FactResolver::new(f.ctx.clone(), Arc::new(MonotonicIdGenerator), None);

        let facts = resolver
            .resolve(&f.activity, &f.songs, &f.artists)
            .await
            .unwrap();
        validate_schema(Dataset::Songplays, facts.schema().as_arrow(), &songplays_schema())
            .unwrap();

        // second row is off by 0.001s, third has no catalog entry
        assert_eq!(
            song_ids(facts).await,
            vec![Some("SOZCTXZ12AB0182364".to_string()), None, None]
        );
    }

    #[tokio::test]
    async fn test_tolerance_match_accepts_small_length_drift() {
        let f = fixture().await;
        let resolver = FactResolver::new(f.ctx.clone(), Arc::new(MonotonicIdGenerator), Some(0.01));

        let facts = resolver
            .resolve(&f.activity, &f.songs, &f.artists)
            .await
            .unwrap();
        assert_eq!(
            song_ids(facts).await,
            vec![
                Some("SOZCTXZ12AB0182364".to_string()),
                Some("SOYMRWW12A6D4FAB14".to_string()),
                None
            ]
        );
    }

    #[tokio::test]
    async fn test_songplay_ids_are_unique_and_rows_preserved() {
        let f = fixture().await;
        let resolver = FactResolver::new(f.ctx.clone(), Arc::new(MonotonicIdGenerator), None);

        let facts = resolver
            .resolve(&f.activity, &f.songs, &f.artists)
            .await
            .unwrap();
        let batches = facts.collect().await.unwrap();
        let ids: Vec<i64> = batches
            .iter()
            .flat_map(|b| {
                b.column(0)
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .unwrap()
                    .values()
                    .to_vec()
            })
            .collect();
        assert_eq!(ids.len(), f.activity.count().await.unwrap());
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), ids.len());
    }

    #[tokio::test]
    async fn test_receipts_are_checked_by_dataset() {
        let f = fixture().await;
        let resolver = FactResolver::new(f.ctx.clone(), Arc::new(MonotonicIdGenerator), None);

        let err = resolver
            .resolve(&f.activity, &f.artists, &f.songs)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
