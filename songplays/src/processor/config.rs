use super::udf::register_udfs;
use common::Result;
use common::config::PipelineConfig;
use datafusion::execution::context::SessionContext;
use datafusion::prelude::SessionConfig;
use tracing::debug;

/// Session shared by every stage of a run.
pub fn build_session_context(pipeline: &PipelineConfig) -> Result<SessionContext> {
    let mut config = SessionConfig::new()
        .with_target_partitions(pipeline.target_partitions)
        .with_batch_size(pipeline.batch_size);

    // Sources and partitioned outputs are nested directory trees.
    config.options_mut().execution.listing_table_ignore_subdirectory = false;
    config.options_mut().execution.parquet.schema_force_view_types = false;

    let ctx = SessionContext::new_with_config(config);
    register_udfs(&ctx)?;

    debug!(
        target_partitions = pipeline.target_partitions,
        batch_size = pipeline.batch_size,
        "Session context ready"
    );
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::execution::FunctionRegistry;

    #[test]
    fn test_session_reads_nested_directories() {
        let ctx = build_session_context(&PipelineConfig::default()).unwrap();
        let state = ctx.state();
        let options = state.config().options();
        assert!(!options.execution.listing_table_ignore_subdirectory);
        assert_eq!(options.execution.target_partitions, 4);
        assert!(ctx.udf("epoch_millis_to_timestamp").is_ok());
    }
}
