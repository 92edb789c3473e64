use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use common::{Error, Result};
use datafusion::common::DFSchema;
use once_cell::sync::Lazy;
use std::sync::Arc;

/// Sentinel `page` value marking a playback event in the activity log.
pub const NEXT_SONG_PAGE: &str = "NextSong";

pub fn start_time_type() -> DataType {
    DataType::Timestamp(TimeUnit::Millisecond, None)
}

/// Every dataset the pipeline reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dataset {
    SongData,
    LogData,
    Songs,
    Artists,
    Users,
    Time,
    Songplays,
}

impl Dataset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SongData => "song_data",
            Self::LogData => "log_data",
            Self::Songs => "songs",
            Self::Artists => "artists",
            Self::Users => "users",
            Self::Time => "time",
            Self::Songplays => "songplays",
        }
    }

    /// Directory name under the output root.
    pub fn subpath(&self) -> &'static str {
        match self {
            Self::SongData => "song_data",
            Self::LogData => "log_data",
            Self::Songs => "songs_table.parquet",
            Self::Artists => "artists_table.parquet",
            Self::Users => "users_table.parquet",
            Self::Time => "time_table.parquet",
            Self::Songplays => "songplays_table.parquet",
        }
    }

    pub fn partition_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Songs => &["year", "artist_id"],
            Self::Time | Self::Songplays => &["year", "month"],
            _ => &[],
        }
    }

    /// Declared output schema; `None` for raw sources whose schema is inferred.
    pub fn schema(&self) -> Option<SchemaRef> {
        match self {
            Self::SongData | Self::LogData => None,
            Self::Songs => Some(SONGS_SCHEMA.clone()),
            Self::Artists => Some(ARTISTS_SCHEMA.clone()),
            Self::Users => Some(USERS_SCHEMA.clone()),
            Self::Time => Some(TIME_SCHEMA.clone()),
            Self::Songplays => Some(SONGPLAYS_SCHEMA.clone()),
        }
    }
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn songs_schema() -> Schema {
    Schema::new(vec![
        Field::new("song_id", DataType::Utf8, true),
        Field::new("title", DataType::Utf8, true),
        Field::new("artist_id", DataType::Utf8, true),
        Field::new("year", DataType::Int64, true),
        Field::new("duration", DataType::Float64, true),
    ])
}

pub fn artists_schema() -> Schema {
    Schema::new(vec![
        Field::new("artist_id", DataType::Utf8, true),
        Field::new("name", DataType::Utf8, true),
        Field::new("location", DataType::Utf8, true),
        Field::new("latitude", DataType::Float64, true),
        Field::new("longitude", DataType::Float64, true),
    ])
}

pub fn users_schema() -> Schema {
    Schema::new(vec![
        Field::new("user_id", DataType::Utf8, true),
        Field::new("first_name", DataType::Utf8, true),
        Field::new("last_name", DataType::Utf8, true),
        Field::new("gender", DataType::Utf8, true),
        Field::new("level", DataType::Utf8, true),
    ])
}

pub fn time_schema() -> Schema {
    Schema::new(vec![
        Field::new("start_time", start_time_type(), true),
        Field::new("hour", DataType::Int32, true),
        Field::new("day", DataType::Int32, true),
        Field::new("week", DataType::Int32, true),
        Field::new("month", DataType::Int32, true),
        Field::new("year", DataType::Int32, true),
        Field::new("weekday", DataType::Utf8, true),
    ])
}

pub fn songplays_schema() -> Schema {
    Schema::new(vec![
        Field::new("songplay_id", DataType::Int64, false),
        Field::new("start_time", start_time_type(), true),
        Field::new("user_id", DataType::Utf8, true),
        Field::new("level", DataType::Utf8, true),
        Field::new("song_id", DataType::Utf8, true),
        Field::new("artist_id", DataType::Utf8, true),
        Field::new("session_id", DataType::Int64, true),
        Field::new("location", DataType::Utf8, true),
        Field::new("user_agent", DataType::Utf8, true),
        Field::new("year", DataType::Int32, true),
        Field::new("month", DataType::Int32, true),
    ])
}

static SONGS_SCHEMA: Lazy<SchemaRef> = Lazy::new(|| Arc::new(songs_schema()));
static ARTISTS_SCHEMA: Lazy<SchemaRef> = Lazy::new(|| Arc::new(artists_schema()));
static USERS_SCHEMA: Lazy<SchemaRef> = Lazy::new(|| Arc::new(users_schema()));
static TIME_SCHEMA: Lazy<SchemaRef> = Lazy::new(|| Arc::new(time_schema()));
static SONGPLAYS_SCHEMA: Lazy<SchemaRef> = Lazy::new(|| Arc::new(songplays_schema()));

/// Fails with a schema mismatch naming the first referenced column that the
/// batch does not carry.
pub fn require_columns(schema: &DFSchema, dataset: Dataset, columns: &[&str]) -> Result<()> {
    for column in columns {
        if !schema.has_column_with_unqualified_name(column) {
            return Err(Error::schema_mismatch(
                dataset.as_str(),
                format!(
                    "column '{}' not found; available columns: [{}]",
                    column,
                    schema.field_names().join(", ")
                ),
            ));
        }
    }
    Ok(())
}

/// Compares names and types field by field, treating Utf8 and Utf8View as
/// compatible. Nullability is not compared.
pub fn validate_schema(dataset: Dataset, actual: &Schema, expected: &Schema) -> Result<()> {
    if actual.fields().len() != expected.fields().len() {
        return Err(Error::schema_mismatch(
            dataset.as_str(),
            format!(
                "expected {} columns, found {}",
                expected.fields().len(),
                actual.fields().len()
            ),
        ));
    }

    for (expected_field, actual_field) in expected.fields().iter().zip(actual.fields().iter()) {
        if expected_field.name() != actual_field.name() {
            return Err(Error::schema_mismatch(
                dataset.as_str(),
                format!(
                    "field name mismatch. Expected: {}, Found: {}",
                    expected_field.name(),
                    actual_field.name()
                ),
            ));
        }

        let types_match = match (expected_field.data_type(), actual_field.data_type()) {
            (DataType::Utf8, DataType::Utf8View) => true,
            (DataType::Utf8View, DataType::Utf8) => true,
            (expected, actual) => expected == actual,
        };

        if !types_match {
            return Err(Error::schema_mismatch(
                dataset.as_str(),
                format!(
                    "type mismatch for field {}. Expected: {:?}, Found: {:?}",
                    expected_field.name(),
                    expected_field.data_type(),
                    actual_field.data_type()
                ),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_columns_exist_in_declared_schema() {
        for dataset in [
            Dataset::Songs,
            Dataset::Artists,
            Dataset::Users,
            Dataset::Time,
            Dataset::Songplays,
        ] {
            let schema = dataset.schema().unwrap();
            for column in dataset.partition_columns() {
                assert!(
                    schema.field_with_name(column).is_ok(),
                    "{} lacks partition column {}",
                    dataset,
                    column
                );
            }
        }
    }

    #[test]
    fn test_validate_schema_accepts_string_views() {
        let actual = Schema::new(vec![
            Field::new("user_id", DataType::Utf8View, true),
            Field::new("first_name", DataType::Utf8, false),
            Field::new("last_name", DataType::Utf8, true),
            Field::new("gender", DataType::Utf8View, true),
            Field::new("level", DataType::Utf8, true),
        ]);
        assert!(validate_schema(Dataset::Users, &actual, &users_schema()).is_ok());
    }

    #[test]
    fn test_validate_schema_reports_type_mismatch() {
        let mut fields: Vec<Field> = songs_schema()
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();
        fields[4] = Field::new("duration", DataType::Utf8, true);
        let err = validate_schema(Dataset::Songs, &Schema::new(fields), &songs_schema())
            .unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));
        assert!(err.to_string().contains("duration"));
    }

    #[test]
    fn test_require_columns_names_missing_column() {
        let schema = DFSchema::try_from(users_schema()).unwrap();
        assert!(require_columns(&schema, Dataset::Users, &["user_id", "level"]).is_ok());

        let err = require_columns(&schema, Dataset::LogData, &["page"]).unwrap_err();
        assert!(err.to_string().contains("'page'"));
    }
}
