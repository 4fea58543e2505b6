use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use statsync::config::Config;
use statsync::engine::{CollectionState, Engine, PollOutcome};
use statsync::snapshot::EntityKind;
use statsync::source::{SnapshotSource, SpoolSource, TopologySource};

const CONFIG: &str = r#"
log_level: debug
health:
  addr: "127.0.0.1:0"
clusters:
  - name: svc01
    interval: 60s
    poll_interval: 10s
    dump_kinds: [node, volume, extent]
    source:
      spool_dir: SPOOL
      topology_file: SPOOL/topology.yaml
"#;

const TOPOLOGY: &str = r#"
nodes: [node1]
volumes:
  vol0: pool0
  vol1: pool0
ports:
  "500507680140A1B2": node1
"#;

fn write(dir: &Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), body).expect("write spool file");
}

fn volume_dump(ro: u64, rb: u64) -> String {
    format!(
        r#"{{"entries": [
            {{"kind": "volume", "id": "vol0", "counters": {{"ro": {ro}, "rb": {rb}, "rl": {ro}}}}},
            {{"kind": "volume", "id": "vol1", "counters": {{"ro": {ro}, "rb": {rb}, "rl": {ro}}}}}
        ]}}"#
    )
}

fn node_dump(busy: u64, hbt: u64) -> String {
    format!(
        r#"{{"entries": [
            {{"kind": "node", "id": "node1", "counters": {{"busy": {busy}}}}},
            {{"kind": "port", "id": "500507680140A1B2", "counters": {{"hbt": {hbt}}}}}
        ]}}"#
    )
}

fn extent_dump(ro: u64, pre: u64) -> String {
    format!(
        r#"{{"entries": [
            {{"kind": "extent", "id": "mdisk0", "counters": {{"ro": {ro}, "re": {ro}, "pre": {pre}}}}}
        ]}}"#
    )
}

fn setup() -> (tempfile::TempDir, Config) {
    let dir = tempfile::tempdir().expect("tempdir");
    let spool = dir.path().display().to_string();

    let cfg_path = dir.path().join("statsync.yaml");
    std::fs::write(&cfg_path, CONFIG.replace("SPOOL", &spool)).expect("write config");
    write(dir.path(), "topology.yaml", TOPOLOGY);

    let cfg = Config::load(&cfg_path).expect("valid config");
    (dir, cfg)
}

#[test]
fn test_config_file_defaults() {
    let (_dir, cfg) = setup();
    let cluster = cfg.cluster("svc01").expect("cluster");
    assert_eq!(cluster.interval_secs(), 60);
    assert_eq!(cluster.poll_interval().as_secs(), 10);
    assert_eq!(cluster.backlog.eviction_bound, 15);
    assert!(cfg.sinks.log.enabled);
    assert!(!cfg.sinks.http.enabled);
    assert!(!cluster.metrics.rules(EntityKind::StorageGroup).is_empty());
}

#[tokio::test]
async fn test_poll_spool_directory() {
    let (dir, cfg) = setup();
    let cluster = cfg.cluster("svc01").expect("cluster");

    write(dir.path(), "Nv_stats_node1_240315_101400", &volume_dump(0, 0));
    write(dir.path(), "Nn_stats_node1_240315_101400", &node_dump(0, 0));
    write(dir.path(), "Nm_stats_node1_240315_101400", &extent_dump(0, 0));
    write(dir.path(), "Nv_stats_node1_240315_101500", &volume_dump(600, 1200));
    write(dir.path(), "Nn_stats_node1_240315_101500", &node_dump(30_000, 6_000));
    write(dir.path(), "Nm_stats_node1_240315_101500", &extent_dump(120, 7));
    write(dir.path(), "Nm_stats_node1_240315_101500.partial", "{}");

    let requests = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&requests);
    let source = SpoolSource::new(&cluster.source).with_metrics(Box::new(move |_, _, _| {
        counter.fetch_add(1, Ordering::Relaxed);
    }));

    let engine = Engine::new(cluster, source);
    let mut state = CollectionState::new(cluster);
    let report = engine.poll(&mut state).await;

    assert_eq!(report.outcome, PollOutcome::Processed);
    assert_eq!(state.current_epoch(), 1_710_497_700);
    // topology.yaml, statsync.yaml and the partial transfer.
    assert_eq!(report.malformed, 3);
    // list, topology, three current and three previous dumps.
    assert_eq!(requests.load(Ordering::Relaxed), 8);

    let batch = &report.batches[0];
    let pool = batch
        .record(EntityKind::StorageGroup, "pool0")
        .expect("pool0 record");
    assert_eq!(pool.get("read_io_rate"), Some(20.0));

    let vol = batch.record(EntityKind::Volume, "vol0").expect("vol0 record");
    assert_eq!(vol.get("read_io_rate"), Some(10.0));
    assert_eq!(vol.get("read_data_rate"), Some(10_240.0));

    let node = batch.record(EntityKind::Node, "node1").expect("node1 record");
    assert_eq!(node.get("cpu_utilization"), Some(50.0));
    assert_eq!(node.get("read_io_rate"), Some(2.0));

    let extent = batch.record(EntityKind::Extent, "mdisk0").expect("extent record");
    assert_eq!(extent.get("peak_read_response_time"), Some(7.0));
    assert_eq!(extent.get("read_response_time"), Some(1.0));

    let port = batch
        .record(EntityKind::Port, "500507680140A1B2")
        .expect("port record");
    assert_eq!(port.get("host_send_data_rate"), Some(100.0));
}

#[tokio::test]
async fn test_spool_topology_and_listing() {
    let (dir, cfg) = setup();
    let cluster = cfg.cluster("svc01").expect("cluster");
    write(dir.path(), "Nv_stats_node1_240315_101500", &volume_dump(1, 1));

    let source = SpoolSource::new(&cluster.source);
    let topology = source.topology().await.expect("topology");
    assert_eq!(topology.nodes, vec!["node1".to_string()]);
    assert_eq!(topology.parent(EntityKind::Volume, "vol1"), Some("pool0"));

    let listing = source.list_dumps().await.expect("listing");
    assert!(listing.contains(&"Nv_stats_node1_240315_101500".to_string()));
}
