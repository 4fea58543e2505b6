use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ClusterConfig, Config};
use crate::engine::{CollectionState, Engine};
use crate::export::health::HealthMetrics;
use crate::metrics::record::MetricBatch;
use crate::sink::http::HttpExporter;
use crate::sink::log::LogExporter;
use crate::sink::Exporter;
use crate::snapshot::Epoch;
use crate::source::SpoolSource;

/// Agent orchestrates the health server, the exporters and one poll driver
/// per configured cluster.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    exporters: Arc<Vec<Exporter>>,
    drivers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            exporters: Arc::new(Vec::new()),
            drivers: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin polling.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health server first so probes respond while exporters connect.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 2. Exporters.
        self.exporters = Arc::new(start_exporters(&self.cfg).await?);

        // 3. One driver per cluster.
        for cluster in &self.cfg.clusters {
            let source = SpoolSource::new(&cluster.source).with_metrics(self.health.source_callback());
            let engine = Engine::new(cluster, source);

            info!(
                cluster = %cluster.name,
                interval = ?cluster.interval,
                poll_interval = ?cluster.poll_interval(),
                spool_dir = %cluster.source.spool_dir.display(),
                "starting poll driver",
            );

            self.drivers.push(tokio::spawn(drive(
                engine,
                cluster.clone(),
                Arc::clone(&self.exporters),
                Arc::clone(&self.health),
                self.cancel.child_token(),
            )));
        }

        info!(clusters = self.drivers.len(), "agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all drivers to stop and wait for in-flight polls to settle.
        self.cancel.cancel();
        for handle in self.drivers.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "poll driver task failed");
            }
        }

        match Arc::get_mut(&mut self.exporters) {
            Some(exporters) => {
                for exporter in exporters.iter_mut() {
                    if let Err(e) = exporter.stop().await {
                        error!(exporter = exporter.name(), error = %e, "error stopping exporter");
                    }
                }
            }
            None => warn!("exporters still referenced, skipping exporter shutdown"),
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }
}

/// Builds and starts the exporters enabled in `cfg`.
async fn start_exporters(cfg: &Config) -> Result<Vec<Exporter>> {
    let mut exporters = Vec::new();

    if cfg.sinks.log.enabled {
        exporters.push(Exporter::Log(LogExporter::new()));
    }

    if cfg.sinks.http.enabled {
        exporters.push(Exporter::Http(HttpExporter::new(cfg.sinks.http.clone())));
        info!(address = %cfg.sinks.http.address, "HTTP exporter configured");
    }

    for exporter in &mut exporters {
        let name = exporter.name().to_string();
        exporter
            .start()
            .await
            .with_context(|| format!("starting {name} exporter"))?;
    }

    if exporters.is_empty() {
        warn!("no exporters enabled, collected metrics will be discarded");
    }

    Ok(exporters)
}

/// Poll loop for one cluster. Each poll is awaited before the next tick so
/// polls for a cluster never overlap.
async fn drive(
    engine: Engine<SpoolSource>,
    cfg: ClusterConfig,
    exporters: Arc<Vec<Exporter>>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) {
    let mut state = CollectionState::new(&cfg);
    let mut ticker = tokio::time::interval(cfg.poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let start = Instant::now();
                let poll = tokio::time::timeout(cfg.cycle_timeout, engine.poll(&mut state));
                let report = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = poll => match result {
                        Ok(report) => report,
                        Err(_) => {
                            state.mark_stalled();
                            warn!(
                                cluster = %cfg.name,
                                timeout = ?cfg.cycle_timeout,
                                current_epoch = state.current_epoch(),
                                "poll exceeded cycle timeout, abandoned",
                            );
                            health.record_timeout(&cfg.name, start.elapsed());
                            continue;
                        }
                    },
                };

                for batch in &report.batches {
                    dispatch(&exporters, &health, batch).await;
                }

                health.record_poll(&cfg.name, &report, &state);
            }
        }
    }
}

/// Sends `batch` to every exporter. A failing exporter does not stop the
/// others.
async fn dispatch(exporters: &[Exporter], health: &HealthMetrics, batch: &MetricBatch) {
    for exporter in exporters {
        if let Err(e) = exporter.export(batch).await {
            health
                .export_errors
                .with_label_values(&[exporter.name()])
                .inc();
            error!(
                exporter = exporter.name(),
                cluster = %batch.cluster,
                epoch = batch.epoch,
                error = %e,
                "export failed",
            );
        }
    }
}

/// Recomputes metrics for one epoch of `cluster` and sends them through the
/// configured exporters. No collection state is read or written.
pub async fn replay(cfg: &Config, cluster: &str, epoch: Epoch) -> Result<Option<MetricBatch>> {
    let Some(cluster_cfg) = cfg.cluster(cluster) else {
        bail!("cluster {cluster:?} is not configured");
    };

    let engine = Engine::new(cluster_cfg, SpoolSource::new(&cluster_cfg.source));
    let batch = engine
        .collect_at(epoch)
        .await
        .with_context(|| format!("collecting epoch {epoch} of cluster {cluster}"))?;

    let Some(batch) = batch else {
        warn!(cluster, epoch, "no entity has a counter pair for this epoch");
        return Ok(None);
    };

    let mut exporters = start_exporters(cfg).await?;
    let mut failed = Vec::new();
    for exporter in &exporters {
        if let Err(e) = exporter.export(&batch).await {
            error!(exporter = exporter.name(), error = %e, "export failed");
            failed.push(exporter.name().to_string());
        }
    }
    for exporter in &mut exporters {
        if let Err(e) = exporter.stop().await {
            error!(exporter = exporter.name(), error = %e, "error stopping exporter");
        }
    }

    if !failed.is_empty() {
        bail!("export failed for: {}", failed.join(", "));
    }

    info!(
        cluster,
        epoch,
        records = batch.records.len(),
        "replayed epoch",
    );

    Ok(Some(batch))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).expect("valid config")
    }

    #[tokio::test]
    async fn test_start_exporters_defaults_to_log() {
        let cfg = config("clusters: []");
        let exporters = start_exporters(&cfg).await.expect("exporters");
        assert_eq!(exporters.len(), 1);
        assert_eq!(exporters[0].name(), "log");
    }

    #[tokio::test]
    async fn test_start_exporters_http_requires_address() {
        let cfg = config("sinks:\n  http:\n    enabled: true\n");
        let err = start_exporters(&cfg).await.unwrap_err();
        assert!(format!("{err:#}").contains("http address is required"));
    }

    #[tokio::test]
    async fn test_replay_unknown_cluster() {
        let cfg = config("clusters: []");
        let err = replay(&cfg, "svc01", 1_710_497_700).await.unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[tokio::test]
    async fn test_replay_from_spool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let write = |name: &str, body: &str| {
            std::fs::write(dir.path().join(name), body).expect("write dump");
        };
        write(
            "Nv_stats_n1_240315_101400",
            r#"{"entries": [{"kind": "volume", "id": "v0", "counters": {"ro": 100}}]}"#,
        );
        write(
            "Nv_stats_n1_240315_101500",
            r#"{"entries": [{"kind": "volume", "id": "v0", "counters": {"ro": 700}}]}"#,
        );

        let cfg = config(&format!(
            r#"
clusters:
  - name: svc01
    expected_nodes: 1
    dump_kinds: [volume]
    source:
      spool_dir: {}
    metrics:
      node: []
      storage_group: []
      extent: []
      port: []
      volume:
        - type: rate
          name: read_io_rate
          source: volume
          counter: ro
"#,
            dir.path().display()
        ));

        let batch = replay(&cfg, "svc01", 1_710_497_700)
            .await
            .expect("replay")
            .expect("pair for v0");
        let rec = batch
            .record(crate::snapshot::EntityKind::Volume, "v0")
            .expect("v0 record");
        assert_eq!(rec.get("read_io_rate"), Some(10.0));
    }
}
