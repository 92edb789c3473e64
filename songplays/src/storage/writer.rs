use super::StorageLocation;
use crate::schema::{Dataset, validate_schema};
use crate::utils::paths::PathBuilder;
use arrow::array::{Array, UInt32Array};
use arrow::compute::take_record_batch;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use chrono::{DateTime, Utc};
use common::config::WriteMode;
use common::{Error, Result};
use datafusion::prelude::DataFrame;
use futures::stream::{self, Stream, StreamExt};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub const SUCCESS_MARKER: &str = "_SUCCESS";
const VERIFY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteMarker {
    pub dataset: String,
    pub run_id: String,
    pub record_count: usize,
    pub partitions: Vec<String>,
    pub files: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Receipt for a dataset whose files and `_SUCCESS` marker have been written.
/// Only the writer can produce one.
#[derive(Debug, Clone)]
pub struct Materialized {
    dataset: Dataset,
    location: StorageLocation,
    run_id: String,
    rows: usize,
    partitions: Vec<String>,
    files: Vec<String>,
}

impl Materialized {
    pub fn dataset(&self) -> Dataset {
        self.dataset
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// `column=value/...` directories written, in sorted order.
    pub fn partitions(&self) -> &[String] {
        &self.partitions
    }

    /// Data files of this run, relative to the dataset location.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Urls of this run's data files. Files left by earlier runs under the
    /// same prefix are not included.
    pub fn file_urls(&self) -> Result<Vec<Url>> {
        self.files
            .iter()
            .map(|file| self.location.file_url(file))
            .collect()
    }

    /// Confirms the marker of this run is readable from storage, retrying with
    /// backoff for stores with delayed visibility. A storage failure on the
    /// last attempt is returned as is.
    pub async fn verify(&self) -> Result<WriteMarker> {
        let mut last_error = None;
        for attempt in 1..=VERIFY_ATTEMPTS {
            match self.location.exists(SUCCESS_MARKER).await {
                Ok(true) => {
                    let marker: WriteMarker =
                        serde_json::from_slice(&self.location.get(SUCCESS_MARKER).await?)?;
                    if marker.run_id != self.run_id {
                        return Err(Error::MissingMaterialization(format!(
                            "{} (marker belongs to run {}, expected {})",
                            self.dataset, marker.run_id, self.run_id
                        )));
                    }
                    return Ok(marker);
                }
                Ok(false) => {
                    warn!(
                        dataset = %self.dataset,
                        attempt,
                        "Marker not visible yet"
                    );
                    last_error = None;
                }
                Err(e) => {
                    warn!(
                        dataset = %self.dataset,
                        attempt,
                        "Error checking marker: {}",
                        e
                    );
                    last_error = Some(e);
                }
            }

            if attempt < VERIFY_ATTEMPTS {
                sleep(Duration::from_millis(200 * 2u64.pow(attempt))).await;
            }
        }

        Err(last_error.unwrap_or_else(|| Error::MissingMaterialization(self.dataset.to_string())))
    }
}

/// One open Parquet file per partition directory.
struct PartitionFile {
    relative: String,
    writer: ArrowWriter<Vec<u8>>,
    rows: usize,
}

pub struct PartitionedWriter {
    output: StorageLocation,
    write_mode: WriteMode,
    run_id: String,
}

impl PartitionedWriter {
    pub fn new(output: StorageLocation, write_mode: WriteMode) -> Self {
        Self {
            output,
            write_mode,
            run_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn location(&self, dataset: Dataset) -> Result<StorageLocation> {
        self.output.child(dataset.subpath())
    }

    /// Executes `df` and persists it under the dataset's subpath, partitioned by
    /// the dataset's partition columns. Batches are routed to their partition
    /// file as they arrive.
    pub async fn write(&self, dataset: Dataset, df: DataFrame) -> Result<Materialized> {
        let stream = df.execute_stream().await?;
        let schema = stream.schema();
        self.write_stream(dataset, schema, stream.map(|batch| batch.map_err(Error::from)))
            .await
    }

    pub async fn write_batches(
        &self,
        dataset: Dataset,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<Materialized> {
        self.write_stream(dataset, schema, stream::iter(batches.into_iter().map(Ok)))
            .await
    }

    async fn write_stream<S>(
        &self,
        dataset: Dataset,
        schema: SchemaRef,
        mut batches: S,
    ) -> Result<Materialized>
    where
        S: Stream<Item = Result<RecordBatch>> + Unpin,
    {
        if let Some(expected) = dataset.schema() {
            validate_schema(dataset, &schema, &expected)?;
        }
        let partition_columns = dataset.partition_columns();
        for column in partition_columns {
            if schema.index_of(column).is_err() {
                return Err(Error::schema_mismatch(
                    dataset.as_str(),
                    format!("partition column '{}' not found", column),
                ));
            }
        }

        let location = self.location(dataset)?;
        if self.write_mode == WriteMode::Overwrite {
            let removed = location.delete_all().await?;
            if removed > 0 {
                debug!(dataset = %dataset, removed, "Cleared previous output");
            }
        }

        let mut open: BTreeMap<String, PartitionFile> = BTreeMap::new();
        let mut next_index = 0;
        while let Some(batch) = batches.next().await {
            let batch = batch?;
            for (partition_path, (builder, indices)) in
                group_rows_by_partition(&batch, partition_columns)?
            {
                let part = take_record_batch(&batch, &UInt32Array::from(indices))?;
                let file = match open.entry(partition_path) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let file =
                            self.open_file(dataset, &schema, &builder, entry.key(), next_index)?;
                        next_index += 1;
                        entry.insert(file)
                    }
                };
                file.writer.write(&part)?;
                file.rows += part.num_rows();
            }
        }

        // an empty dataset still gets one file so its schema can be read back
        if open.is_empty() {
            let file = self.open_file(dataset, &schema, &PathBuilder::new(), "", next_index)?;
            open.insert(String::new(), file);
        }

        let mut rows = 0;
        let mut files = Vec::with_capacity(open.len());
        let mut partitions = Vec::new();
        for (partition_path, file) in open {
            let PartitionFile {
                relative,
                mut writer,
                rows: file_rows,
            } = file;
            writer.append_key_value_metadata(KeyValue::new(
                "record_count".to_string(),
                file_rows.to_string(),
            ));
            location.put(&relative, writer.into_inner()?).await?;
            debug!(dataset = %dataset, file = %relative, rows = file_rows, "Wrote file");

            rows += file_rows;
            if !partition_path.is_empty() {
                partitions.push(partition_path);
            }
            files.push(relative);
        }

        let marker = WriteMarker {
            dataset: dataset.as_str().to_string(),
            run_id: self.run_id.clone(),
            record_count: rows,
            partitions: partitions.clone(),
            files: files.clone(),
            created_at: Utc::now(),
        };
        location
            .put(SUCCESS_MARKER, serde_json::to_vec_pretty(&marker)?)
            .await?;

        info!(
            dataset = %dataset,
            rows,
            partitions = partitions.len(),
            files = files.len(),
            location = %location,
            "Dataset written"
        );

        Ok(Materialized {
            dataset,
            location,
            run_id: self.run_id.clone(),
            rows,
            partitions,
            files,
        })
    }

    fn open_file(
        &self,
        dataset: Dataset,
        schema: &SchemaRef,
        builder: &PathBuilder,
        partition_path: &str,
        index: usize,
    ) -> Result<PartitionFile> {
        let file_name = format!("part-{:05}-{}.snappy.parquet", index, self.run_id);
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_key_value_metadata(Some(vec![
                KeyValue::new("dataset".to_string(), dataset.as_str().to_string()),
                KeyValue::new("run_id".to_string(), self.run_id.clone()),
                KeyValue::new("partition".to_string(), partition_path.to_string()),
            ]))
            .build();

        Ok(PartitionFile {
            relative: builder.build_file_path(&file_name),
            writer: ArrowWriter::try_new(Vec::new(), schema.clone(), Some(props))?,
            rows: 0,
        })
    }
}

/// Row indices per partition directory of one batch, ordered by directory name.
fn group_rows_by_partition(
    batch: &RecordBatch,
    partition_columns: &[&str],
) -> Result<BTreeMap<String, (PathBuilder, Vec<u32>)>> {
    let mut groups: BTreeMap<String, (PathBuilder, Vec<u32>)> = BTreeMap::new();
    if batch.num_rows() == 0 {
        return Ok(groups);
    }

    let options = FormatOptions::default();
    let columns = partition_columns
        .iter()
        .map(|name| {
            let array = batch.column(batch.schema().index_of(name)?).clone();
            Ok((*name, array))
        })
        .collect::<Result<Vec<_>>>()?;
    let formatters = columns
        .iter()
        .map(|(_, array)| ArrayFormatter::try_new(array.as_ref(), &options))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for row in 0..batch.num_rows() {
        let mut builder = PathBuilder::new();
        for ((name, array), formatter) in columns.iter().zip(formatters.iter()) {
            let value = if array.is_null(row) {
                None
            } else {
                Some(formatter.value(row).to_string())
            };
            builder = builder.with_partition(name, value.as_deref());
        }
        groups
            .entry(builder.build_partition_path())
            .or_insert_with(|| (builder, Vec::new()))
            .1
            .push(row as u32);
    }

    Ok(groups)
}
