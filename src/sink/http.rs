use std::io::Write;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::config::HttpExportConfig;
use crate::metrics::record::{MetricBatch, MetricSample};
use crate::snapshot::Epoch;

/// JSON schema of one exported sample.
#[derive(Debug, Clone, Serialize)]
pub struct SampleJson<'a> {
    pub cluster: &'a str,
    pub entity_kind: &'static str,
    pub entity_id: &'a str,
    pub metric: &'a str,
    pub value: f64,
    /// Sampling instant the value describes, RFC 3339.
    pub timestamp: &'a str,
    pub updated_date_time: &'a str,
}

impl<'a> SampleJson<'a> {
    fn new(
        cluster: &'a str,
        sample: &MetricSample<'a>,
        timestamp: &'a str,
        updated: &'a str,
    ) -> Self {
        Self {
            cluster,
            entity_kind: sample.kind.as_str(),
            entity_id: sample.id,
            metric: sample.metric,
            value: sample.value,
            timestamp,
            updated_date_time: updated,
        }
    }
}

/// HTTP NDJSON exporter with optional compression.
///
/// Each batch becomes one POST of newline-delimited samples, one line per
/// (entity, metric) value.
#[derive(Debug)]
pub struct HttpExporter {
    cfg: HttpExportConfig,
    client: Option<reqwest::Client>,
}

impl HttpExporter {
    /// Creates a new HTTP exporter with the given configuration.
    pub fn new(cfg: HttpExportConfig) -> Self {
        Self { cfg, client: None }
    }

    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        "http"
    }

    /// Builds the HTTP client.
    pub async fn start(&mut self) -> Result<()> {
        if self.cfg.address.is_empty() {
            bail!("http address is required");
        }

        let mut client_builder = reqwest::Client::builder().timeout(self.cfg.timeout);
        if !self.cfg.keep_alive {
            client_builder = client_builder.pool_max_idle_per_host(0);
        }

        self.client = Some(client_builder.build().context("building HTTP client")?);

        Ok(())
    }

    /// Sends one batch.
    pub async fn export(&self, batch: &MetricBatch) -> Result<()> {
        let Some(client) = &self.client else {
            bail!("http exporter not started");
        };
        if batch.is_empty() {
            return Ok(());
        }

        let buf = encode_ndjson(batch, SystemTime::now())?;
        let raw_len = buf.len();

        let compressed =
            compress(&buf, &self.cfg.compression).context("compressing NDJSON data")?;

        let mut request = client
            .post(&self.cfg.address)
            .header("Content-Type", "application/x-ndjson")
            .body(compressed);

        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request
            .send()
            .await
            .context("sending HTTP export request")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("HTTP export unexpected status: {status}");
        }

        tracing::debug!(
            cluster = %batch.cluster,
            epoch = batch.epoch,
            bytes = raw_len,
            "exported batch via HTTP",
        );

        Ok(())
    }

    /// Drops the HTTP client.
    pub async fn stop(&mut self) -> Result<()> {
        self.client.take();
        Ok(())
    }
}

/// Serializes a batch as NDJSON.
pub fn encode_ndjson(batch: &MetricBatch, now: SystemTime) -> Result<Vec<u8>> {
    let timestamp = format_epoch(batch.epoch)
        .with_context(|| format!("epoch {} out of range", batch.epoch))?;
    let updated = format_datetime(now);

    let mut buf = Vec::with_capacity(batch.records.len() * 512);
    for sample in batch.samples() {
        let line = SampleJson::new(&batch.cluster, &sample, &timestamp, &updated);
        serde_json::to_writer(&mut buf, &line).context("serializing metric to JSON")?;
        buf.push(b'\n');
    }
    Ok(buf)
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

// --- Datetime formatting ---

fn format_epoch(epoch: Epoch) -> Option<String> {
    DateTime::<Utc>::from_timestamp(epoch, 0)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn format_datetime(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}
