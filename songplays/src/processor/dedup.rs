use crate::schema::Dataset;
use chrono::{DateTime, Utc};
use common::Result;
use datafusion::logical_expr::SortExpr;
use datafusion::prelude::*;
use tracing::info;

#[derive(Debug, Clone)]
pub struct DedupMetrics {
    pub dataset: Dataset,
    pub total_records: usize,
    pub duplicate_count: usize,
    pub unique_count: usize,
    pub processing_time_ms: i64,
    pub processed_at: DateTime<Utc>,
}

impl DedupMetrics {
    pub fn duplicate_percentage(&self) -> f64 {
        if self.total_records == 0 {
            0.0
        } else {
            (self.duplicate_count as f64 / self.total_records as f64) * 100.0
        }
    }
}

/// Drops rows equal to another row in every column.
pub async fn remove_exact_duplicates(
    dataset: Dataset,
    df: DataFrame,
) -> Result<(DataFrame, DedupMetrics)> {
    let start_time = Utc::now();
    let deduped = df.clone().distinct()?.cache().await?;
    let metrics = measure(dataset, df, &deduped, start_time).await?;
    Ok((deduped, metrics))
}

/// Keeps one row per `key`, the first one under `order_by`. The sort must lead
/// with `key`.
pub async fn keep_first_per_key(
    dataset: Dataset,
    df: DataFrame,
    key: &str,
    order_by: Vec<SortExpr>,
) -> Result<(DataFrame, DedupMetrics)> {
    let start_time = Utc::now();
    let select: Vec<Expr> = df
        .schema()
        .fields()
        .iter()
        .map(|field| ident(field.name()))
        .collect();

    let mut sort = vec![col(key).sort(true, false)];
    sort.extend(order_by);

    let deduped = df
        .clone()
        .distinct_on(vec![col(key)], select, Some(sort))?
        .cache()
        .await?;
    let metrics = measure(dataset, df, &deduped, start_time).await?;
    Ok((deduped, metrics))
}

async fn measure(
    dataset: Dataset,
    original: DataFrame,
    deduped: &DataFrame,
    start_time: DateTime<Utc>,
) -> Result<DedupMetrics> {
    let total_records = original.count().await?;
    let unique_count = deduped.clone().count().await?;

    Ok(DedupMetrics {
        dataset,
        total_records,
        duplicate_count: total_records.saturating_sub(unique_count),
        unique_count,
        processing_time_ms: (Utc::now() - start_time).num_milliseconds(),
        processed_at: Utc::now(),
    })
}

pub fn log_metrics(metrics: &DedupMetrics) {
    info!(
        dataset = %metrics.dataset,
        total_records = metrics.total_records,
        duplicate_count = metrics.duplicate_count,
        unique_count = metrics.unique_count,
        duplicate_pct = %format!("{:.2}", metrics.duplicate_percentage()),
        processing_time_ms = metrics.processing_time_ms,
        "Deduplication results"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    fn users_df(ctx: &SessionContext) -> DataFrame {
        let schema = Arc::new(Schema::new(vec![
            Field::new("user_id", DataType::Utf8, true),
            Field::new("level", DataType::Utf8, true),
            Field::new("ts", DataType::Int64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["10", "10", "10", "26"])),
                Arc::new(StringArray::from(vec!["free", "free", "paid", "free"])),
                Arc::new(Int64Array::from(vec![100, 100, 300, 200])),
            ],
        )
        .unwrap();
        ctx.read_batch(batch).unwrap()
    }

    #[tokio::test]
    async fn test_exact_dedup_counts_and_idempotence() {
        let ctx = SessionContext::new();
        let (once, metrics) = remove_exact_duplicates(Dataset::Users, users_df(&ctx))
            .await
            .unwrap();
        assert_eq!(metrics.total_records, 4);
        assert_eq!(metrics.duplicate_count, 1);
        assert_eq!(metrics.unique_count, 3);
        assert!((metrics.duplicate_percentage() - 25.0).abs() < f64::EPSILON);

        let (twice, metrics) = remove_exact_duplicates(Dataset::Users, once).await.unwrap();
        assert_eq!(metrics.duplicate_count, 0);
        assert_eq!(twice.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_keep_first_per_key_takes_latest_event() {
        let ctx = SessionContext::new();
        let (deduped, metrics) = keep_first_per_key(
            Dataset::Users,
            users_df(&ctx),
            "user_id",
            vec![col("ts").sort(false, false)],
        )
        .await
        .unwrap();
        assert_eq!(metrics.unique_count, 2);

        let batches = deduped
            .sort(vec![col("user_id").sort(true, false)])
            .unwrap()
            .collect()
            .await
            .unwrap();
        let batch = arrow::compute::concat_batches(&batches[0].schema(), &batches).unwrap();
        let level = batch
            .column_by_name("level")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(level.value(0), "paid");
        assert_eq!(level.value(1), "free");
    }
}
