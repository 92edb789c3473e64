use super::dedup::{log_metrics, remove_exact_duplicates};
use crate::schema::{Dataset, require_columns};
use common::Result;
use datafusion::prelude::DataFrame;

const TIME_COLUMNS: [&str; 7] = [
    "start_time",
    "hour",
    "day",
    "week",
    "month",
    "year",
    "weekday",
];

/// Calendar dimension over the enriched activity. Every column is a function
/// of `start_time`, so full-row dedup leaves one row per timestamp.
pub async fn time_table(activity: &DataFrame) -> Result<DataFrame> {
    require_columns(activity.schema(), Dataset::Time, &TIME_COLUMNS)?;

    let time = activity.clone().select_columns(&TIME_COLUMNS)?;
    let (time, metrics) = remove_exact_duplicates(Dataset::Time, time).await?;
    log_metrics(&metrics);
    Ok(time)
}
