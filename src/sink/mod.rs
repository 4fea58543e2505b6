pub mod http;
pub mod log;

use anyhow::Result;

use crate::metrics::record::MetricBatch;

use self::http::HttpExporter;
use self::log::LogExporter;

/// Exporter dispatches metric batches to the configured outputs.
#[derive(Debug)]
pub enum Exporter {
    Log(LogExporter),
    Http(HttpExporter),
}

impl Exporter {
    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Log(e) => e.name(),
            Self::Http(e) => e.name(),
        }
    }

    /// Initialize the exporter.
    pub async fn start(&mut self) -> Result<()> {
        match self {
            Self::Log(_) => Ok(()),
            Self::Http(e) => e.start().await,
        }
    }

    /// Export a batch of metrics.
    pub async fn export(&self, batch: &MetricBatch) -> Result<()> {
        match self {
            Self::Log(e) => e.export(batch),
            Self::Http(e) => e.export(batch).await,
        }
    }

    /// Shut down the exporter.
    pub async fn stop(&mut self) -> Result<()> {
        match self {
            Self::Log(_) => Ok(()),
            Self::Http(e) => e.stop().await,
        }
    }
}
