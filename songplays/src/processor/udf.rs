use crate::schema::start_time_type;
use chrono::DateTime;
use common::{Error, Result};
use datafusion::arrow::array::{Int64Array, StringArray, TimestampMillisecondArray};
use datafusion::arrow::datatypes::DataType;
use datafusion::common::DataFusionError;
use datafusion::execution::context::SessionContext;
use datafusion::logical_expr::{ColumnarValue, ScalarUDF, Volatility, create_udf};
use std::sync::Arc;

pub const EPOCH_MILLIS_TO_TIMESTAMP: &str = "epoch_millis_to_timestamp";
pub const WEEKDAY_ABBREV: &str = "weekday_abbrev";

/// Registers all UDFs with the SessionContext
pub fn register_udfs(ctx: &SessionContext) -> Result<()> {
    ctx.register_udf(epoch_millis_to_timestamp_udf());
    ctx.register_udf(weekday_abbrev_udf());
    Ok(())
}

/// `Int64` epoch milliseconds to a timezone-naive millisecond timestamp.
pub fn epoch_millis_to_timestamp_udf() -> ScalarUDF {
    create_udf(
        EPOCH_MILLIS_TO_TIMESTAMP,
        vec![DataType::Int64],
        start_time_type(),
        Volatility::Immutable,
        Arc::new(|args| {
            epoch_millis_to_timestamp(args).map_err(|e| DataFusionError::Internal(e.to_string()))
        }),
    )
}

/// Three-letter English day name ("Mon" .. "Sun") of a millisecond timestamp.
pub fn weekday_abbrev_udf() -> ScalarUDF {
    create_udf(
        WEEKDAY_ABBREV,
        vec![start_time_type()],
        DataType::Utf8,
        Volatility::Immutable,
        Arc::new(|args| {
            weekday_abbrev(args).map_err(|e| DataFusionError::Internal(e.to_string()))
        }),
    )
}

fn epoch_millis_to_timestamp(args: &[ColumnarValue]) -> Result<ColumnarValue> {
    let arrays = ColumnarValue::values_to_arrays(args)?;
    let millis = arrays
        .first()
        .and_then(|array| array.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| Error::InvalidInput("Expected int64 array".to_string()))?;

    // Values chrono cannot represent become null rather than a bogus epoch.
    let result: TimestampMillisecondArray = millis
        .iter()
        .map(|opt_ts| {
            opt_ts.and_then(|ts| DateTime::from_timestamp_millis(ts).map(|dt| dt.timestamp_millis()))
        })
        .collect();

    Ok(ColumnarValue::Array(Arc::new(result)))
}

fn weekday_abbrev(args: &[ColumnarValue]) -> Result<ColumnarValue> {
    let arrays = ColumnarValue::values_to_arrays(args)?;
    let timestamps = arrays
        .first()
        .and_then(|array| array.as_any().downcast_ref::<TimestampMillisecondArray>())
        .ok_or_else(|| Error::InvalidInput("Expected timestamp(ms) array".to_string()))?;

    let result: StringArray = timestamps
        .iter()
        .map(|opt_ts| {
            opt_ts.and_then(|ts| {
                DateTime::from_timestamp_millis(ts)
                    .map(|dt| dt.naive_utc().format("%a").to_string())
            })
        })
        .collect();

    Ok(ColumnarValue::Array(Arc::new(result)))
}
