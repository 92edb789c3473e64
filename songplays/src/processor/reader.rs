use crate::schema::Dataset;
use crate::storage::StorageLocation;
use common::{Error, Result};
use datafusion::execution::context::SessionContext;
use datafusion::prelude::{DataFrame, NdJsonReadOptions};
use tracing::{info, warn};

/// Loads line-delimited JSON records below a source directory, recursively,
/// with an inferred schema.
pub struct RecordReader {
    ctx: SessionContext,
    schema_infer_max_records: usize,
}

impl RecordReader {
    pub fn new(ctx: SessionContext, schema_infer_max_records: usize) -> Self {
        Self {
            ctx,
            schema_infer_max_records,
        }
    }

    /// An existing directory without matching files reads as an empty batch.
    pub async fn read(&self, dataset: Dataset, location: &StorageLocation) -> Result<DataFrame> {
        if let Some(path) = location.local_path() {
            if !path.is_dir() {
                return Err(Error::SourceRead {
                    path: path.display().to_string(),
                    reason: "directory does not exist".to_string(),
                });
            }
        }

        let options = NdJsonReadOptions {
            schema_infer_max_records: self.schema_infer_max_records,
            ..Default::default()
        }
        .file_extension(".json");

        let df = self
            .ctx
            .read_json(location.as_str(), options)
            .await
            .map_err(|e| Error::SourceRead {
                path: location.to_string(),
                reason: e.to_string(),
            })?;

        if df.schema().fields().is_empty() {
            warn!(dataset = %dataset, location = %location, "No records found");
            return Ok(self.ctx.read_empty()?.limit(0, Some(0))?);
        }

        let df = df.cache().await.map_err(|e| Error::SourceRead {
            path: location.to_string(),
            reason: e.to_string(),
        })?;

        info!(
            dataset = %dataset,
            location = %location,
            columns = df.schema().fields().len(),
            "Loaded source records"
        );
        Ok(df)
    }
}
