use anyhow::Result;
use tracing::info;

use crate::metrics::record::MetricBatch;

/// Writes every record through tracing, one line per entity.
#[derive(Debug, Default)]
pub struct LogExporter;

impl LogExporter {
    pub fn new() -> Self {
        Self
    }

    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        "log"
    }

    pub fn export(&self, batch: &MetricBatch) -> Result<()> {
        for record in &batch.records {
            info!(
                cluster = %batch.cluster,
                epoch = batch.epoch,
                kind = %record.kind,
                id = %record.id,
                values = ?record.values,
                "metric record",
            );
        }
        Ok(())
    }
}
