use super::dedup::{keep_first_per_key, log_metrics, remove_exact_duplicates};
use super::udf::{epoch_millis_to_timestamp_udf, weekday_abbrev_udf};
use crate::schema::{Dataset, NEXT_SONG_PAGE, require_columns};
use arrow::datatypes::DataType;
use common::Result;
use common::config::UserDedupPolicy;
use datafusion::functions::expr_fn::date_part;
use datafusion::prelude::*;

const USER_COLUMNS: [&str; 5] = ["userId", "firstName", "lastName", "gender", "level"];

/// Calendar columns derived from `start_time`, paired with their `date_part`
/// field. `week` is the ISO week.
pub const CALENDAR_PARTS: [(&str, &str); 5] = [
    ("hour", "hour"),
    ("day", "day"),
    ("week", "week"),
    ("month", "month"),
    ("year", "year"),
];

/// Keeps playback events and appends `start_time` plus its calendar
/// decomposition. The result still carries every source column.
pub fn enrich_activity(log_data: DataFrame) -> Result<DataFrame> {
    require_columns(log_data.schema(), Dataset::LogData, &["page", "ts"])?;

    let mut df = log_data
        .filter(cast(ident("page"), DataType::Utf8).eq(lit(NEXT_SONG_PAGE)))?
        .with_column(
            "start_time",
            epoch_millis_to_timestamp_udf().call(vec![cast(ident("ts"), DataType::Int64)]),
        )?;

    for (name, part) in CALENDAR_PARTS {
        df = df.with_column(
            name,
            cast(date_part(lit(part), col("start_time")), DataType::Int32),
        )?;
    }

    Ok(df.with_column("weekday", weekday_abbrev_udf().call(vec![col("start_time")]))?)
}

/// Users dimension. Deduplication follows `policy`; `Latest` keeps each
/// user's row from their most recent event.
pub async fn users_table(activity: &DataFrame, policy: UserDedupPolicy) -> Result<DataFrame> {
    require_columns(activity.schema(), Dataset::LogData, &USER_COLUMNS)?;

    let mut projection = vec![
        cast(ident("userId"), DataType::Utf8).alias("user_id"),
        cast(ident("firstName"), DataType::Utf8).alias("first_name"),
        cast(ident("lastName"), DataType::Utf8).alias("last_name"),
        cast(ident("gender"), DataType::Utf8).alias("gender"),
        cast(ident("level"), DataType::Utf8).alias("level"),
    ];

    match policy {
        UserDedupPolicy::None => Ok(activity.clone().select(projection)?),
        UserDedupPolicy::Exact => {
            let users = activity.clone().select(projection)?;
            let (users, metrics) = remove_exact_duplicates(Dataset::Users, users).await?;
            log_metrics(&metrics);
            Ok(users)
        }
        UserDedupPolicy::Latest => {
            projection.push(cast(ident("ts"), DataType::Int64).alias("ts"));
            let users = activity.clone().select(projection)?;
            let (users, metrics) = keep_first_per_key(
                Dataset::Users,
                users,
                "user_id",
                vec![col("ts").sort(false, false)],
            )
            .await?;
            log_metrics(&metrics);
            Ok(users.select_columns(&["user_id", "first_name", "last_name", "gender", "level"])?)
        }
    }
}
