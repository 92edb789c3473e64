use super::dedup::{log_metrics, remove_exact_duplicates};
use crate::schema::{Dataset, require_columns};
use arrow::datatypes::DataType;
use common::Result;
use datafusion::prelude::*;

const SONG_COLUMNS: [&str; 5] = ["song_id", "title", "artist_id", "year", "duration"];
const ARTIST_COLUMNS: [&str; 5] = [
    "artist_id",
    "artist_name",
    "artist_location",
    "artist_latitude",
    "artist_longitude",
];

/// Songs dimension: one row per distinct catalog row.
pub async fn songs_table(song_data: &DataFrame) -> Result<DataFrame> {
    require_columns(song_data.schema(), Dataset::SongData, &SONG_COLUMNS)?;

    let songs = song_data.clone().select(vec![
        cast(ident("song_id"), DataType::Utf8).alias("song_id"),
        cast(ident("title"), DataType::Utf8).alias("title"),
        cast(ident("artist_id"), DataType::Utf8).alias("artist_id"),
        cast(ident("year"), DataType::Int64).alias("year"),
        cast(ident("duration"), DataType::Float64).alias("duration"),
    ])?;

    let (songs, metrics) = remove_exact_duplicates(Dataset::Songs, songs).await?;
    log_metrics(&metrics);
    Ok(songs)
}

/// Artists dimension, with the `artist_` source prefix dropped.
pub async fn artists_table(song_data: &DataFrame) -> Result<DataFrame> {
    require_columns(song_data.schema(), Dataset::SongData, &ARTIST_COLUMNS)?;

    let artists = song_data.clone().select(vec![
        cast(ident("artist_id"), DataType::Utf8).alias("artist_id"),
        cast(ident("artist_name"), DataType::Utf8).alias("name"),
        cast(ident("artist_location"), DataType::Utf8).alias("location"),
        cast(ident("artist_latitude"), DataType::Float64).alias("latitude"),
        cast(ident("artist_longitude"), DataType::Float64).alias("longitude"),
    ])?;

    let (artists, metrics) = remove_exact_duplicates(Dataset::Artists, artists).await?;
    log_metrics(&metrics);
    Ok(artists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{artists_schema, songs_schema, validate_schema};
    use arrow::array::{Array, Float64Array, StringArray};
    use common::Error;

    const CATALOG: &str = r#"{"num_songs": 1, "artist_id": "ARD7TVE1187B99BFB1", "artist_latitude": null, "artist_longitude": null, "artist_location": "California - LA", "artist_name": "Casual", "song_id": "SOMZWCG12A8C13C480", "title": "I Didn't Mean To", "duration": 218.93179, "year": 0}
{"num_songs": 1, "artist_id": "ARD7TVE1187B99BFB1", "artist_latitude": null, "artist_longitude": null, "artist_location": "California - LA", "artist_name": "Casual", "song_id": "SOMZWCG12A8C13C480", "title": "I Didn't Mean To", "duration": 218.93179, "year": 0}
{"num_songs": 1, "artist_id": "ARD7TVE1187B99BFB1", "artist_latitude": null, "artist_longitude": null, "artist_location": "California - LA", "artist_name": "Casual", "song_id": "SOMZWCG12A8C13C480", "title": "I Didn't Mean To (Remix)", "duration": 218.93179, "year": 0}
{"num_songs": 1, "artist_id": "ARMJAGH1187FB546F3", "artist_latitude": 35.14968, "artist_longitude": -90.04892, "artist_location": "Memphis, TN", "artist_name": "The Box Tops", "song_id": "SOCIWDW12A8C13D406", "title": "Soul Deep", "duration": 148, "year": 1969}
"#;

    async fn catalog(ctx: &SessionContext, dir: &tempfile::TempDir) -> DataFrame {
        let path = dir.path().join("songs.json");
        std::fs::write(&path, CATALOG).unwrap();
        ctx.read_json(path.to_str().unwrap(), NdJsonReadOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_songs_dedup_is_full_row_not_key() {
        let ctx = SessionContext::new();
        let dir = tempfile::tempdir().unwrap();
        let songs = songs_table(&catalog(&ctx, &dir).await).await.unwrap();

        validate_schema(Dataset::Songs, songs.schema().as_arrow(), &songs_schema()).unwrap();
        // duplicate row collapses, same song_id with a different title stays
        let batches = songs
            .filter(col("song_id").eq(lit("SOMZWCG12A8C13C480")))
            .unwrap()
            .collect()
            .await
            .unwrap();
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn test_integer_duration_is_cast_to_float() {
        let ctx = SessionContext::new();
        let dir = tempfile::tempdir().unwrap();
        let songs = songs_table(&catalog(&ctx, &dir).await).await.unwrap();

        let batches = songs
            .filter(col("song_id").eq(lit("SOCIWDW12A8C13D406")))
            .unwrap()
            .collect()
            .await
            .unwrap();
        let duration = batches
            .iter()
            .find(|b| b.num_rows() > 0)
            .unwrap()
            .column_by_name("duration")
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap()
            .value(0);
        assert_eq!(duration, 148.0);
    }

    #[tokio::test]
    async fn test_artists_renamed_and_deduplicated() {
        let ctx = SessionContext::new();
        let dir = tempfile::tempdir().unwrap();
        let artists = artists_table(&catalog(&ctx, &dir).await).await.unwrap();

        validate_schema(Dataset::Artists, artists.schema().as_arrow(), &artists_schema())
            .unwrap();
        let batches = artists
            .sort(vec![col("artist_id").sort(true, false)])
            .unwrap()
            .collect()
            .await
            .unwrap();
        let batch = arrow::compute::concat_batches(&batches[0].schema(), &batches).unwrap();
        assert_eq!(batch.num_rows(), 2);

        let names = batch
            .column_by_name("name")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(names.value(0), "Casual");
        let latitude = batch
            .column_by_name("latitude")
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert!(latitude.is_null(0));
        assert_eq!(latitude.value(1), 35.14968);
    }

    #[tokio::test]
    async fn test_missing_column_is_schema_mismatch() {
        let ctx = SessionContext::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"song_id": "S1", "title": "T"}"#).unwrap();
        let raw = ctx
            .read_json(path.to_str().unwrap(), NdJsonReadOptions::default())
            .await
            .unwrap();

        let err = songs_table(&raw).await.unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));
        assert!(err.to_string().contains("artist_id"));
    }
}
