use std::collections::{BTreeSet, HashSet};

use anyhow::{bail, Result};
use serde::Deserialize;

use crate::snapshot::EntityKind;

/// Bytes per sector for `rb`/`wb` counters.
const SECTOR_BYTES: f64 = 512.0;

/// How one output metric is derived from raw counters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricRule {
    /// `trunc(sum(delta(counter)) * scale / interval)`.
    Rate {
        name: String,
        source: EntityKind,
        counter: String,
        #[serde(default = "default_scale")]
        scale: f64,
    },
    /// `sum(delta(numerators)) * scale / sum(delta(denominator))`, 0 when the
    /// denominator sum is 0.
    Ratio {
        name: String,
        source: EntityKind,
        numerators: Vec<String>,
        denominator: String,
        #[serde(default = "default_scale")]
        scale: f64,
    },
    /// Largest "new" value of `counter` across contributors.
    Peak {
        name: String,
        source: EntityKind,
        counter: String,
    },
}

fn default_scale() -> f64 {
    1.0
}

impl MetricRule {
    pub fn rate(name: &str, source: EntityKind, counter: &str, scale: f64) -> Self {
        Self::Rate {
            name: name.to_string(),
            source,
            counter: counter.to_string(),
            scale,
        }
    }

    pub fn ratio(
        name: &str,
        source: EntityKind,
        numerators: &[&str],
        denominator: &str,
        scale: f64,
    ) -> Self {
        Self::Ratio {
            name: name.to_string(),
            source,
            numerators: numerators.iter().map(|n| n.to_string()).collect(),
            denominator: denominator.to_string(),
            scale,
        }
    }

    pub fn peak(name: &str, source: EntityKind, counter: &str) -> Self {
        Self::Peak {
            name: name.to_string(),
            source,
            counter: counter.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Rate { name, .. } | Self::Ratio { name, .. } | Self::Peak { name, .. } => name,
        }
    }

    pub fn source(&self) -> EntityKind {
        match self {
            Self::Rate { source, .. } | Self::Ratio { source, .. } | Self::Peak { source, .. } => {
                *source
            }
        }
    }

    /// Whether the rule needs an old/new pair.
    pub fn is_delta_based(&self) -> bool {
        !matches!(self, Self::Peak { .. })
    }

    fn validate(&self, level: EntityKind) -> Result<()> {
        if self.name().is_empty() {
            bail!("{level} metric rule name is required");
        }

        let source = self.source();
        let reachable = source == level
            || level == EntityKind::Node
            || (level == EntityKind::StorageGroup && source.is_leaf());
        if !reachable {
            bail!(
                "{level} metric {:?} cannot be sourced from {source} counters",
                self.name()
            );
        }
        if source == EntityKind::StorageGroup {
            bail!(
                "{level} metric {:?}: storage groups have no raw counters",
                self.name()
            );
        }

        match self {
            Self::Rate { counter, scale, .. } => {
                if counter.is_empty() {
                    bail!("{level} metric {:?}: counter is required", self.name());
                }
                validate_scale(level, self.name(), *scale)?;
            }
            Self::Ratio {
                numerators,
                denominator,
                scale,
                ..
            } => {
                if numerators.is_empty() || numerators.iter().any(String::is_empty) {
                    bail!(
                        "{level} metric {:?}: numerators must be non-empty",
                        self.name()
                    );
                }
                if denominator.is_empty() {
                    bail!("{level} metric {:?}: denominator is required", self.name());
                }
                validate_scale(level, self.name(), *scale)?;
            }
            Self::Peak { counter, .. } => {
                if counter.is_empty() {
                    bail!("{level} metric {:?}: counter is required", self.name());
                }
            }
        }

        Ok(())
    }
}

fn validate_scale(level: EntityKind, name: &str, scale: f64) -> Result<()> {
    if !scale.is_finite() || scale <= 0.0 {
        bail!("{level} metric {name:?}: scale must be a positive number");
    }
    Ok(())
}

/// Tracked-counter rules per output level.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_node_rules")]
    pub node: Vec<MetricRule>,

    #[serde(default = "default_storage_group_rules")]
    pub storage_group: Vec<MetricRule>,

    #[serde(default = "default_volume_rules")]
    pub volume: Vec<MetricRule>,

    #[serde(default = "default_extent_rules")]
    pub extent: Vec<MetricRule>,

    #[serde(default = "default_port_rules")]
    pub port: Vec<MetricRule>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            node: default_node_rules(),
            storage_group: default_storage_group_rules(),
            volume: default_volume_rules(),
            extent: default_extent_rules(),
            port: default_port_rules(),
        }
    }
}

impl MetricsConfig {
    /// Rules reported at `level`.
    pub fn rules(&self, level: EntityKind) -> &[MetricRule] {
        match level {
            EntityKind::Node => &self.node,
            EntityKind::StorageGroup => &self.storage_group,
            EntityKind::Volume => &self.volume,
            EntityKind::Extent => &self.extent,
            EntityKind::Port => &self.port,
        }
    }

    /// Every (level, rule) pair in reporting order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityKind, &MetricRule)> {
        EntityKind::all()
            .iter()
            .flat_map(move |level| self.rules(*level).iter().map(move |r| (*level, r)))
    }

    /// Entity kinds whose raw counters some rule reads.
    pub fn source_kinds(&self) -> BTreeSet<EntityKind> {
        self.iter().map(|(_, rule)| rule.source()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        for level in EntityKind::all() {
            let mut seen = HashSet::new();
            for rule in self.rules(*level) {
                rule.validate(*level)?;
                if !seen.insert(rule.name()) {
                    bail!("duplicate {level} metric {:?}", rule.name());
                }
            }
        }
        Ok(())
    }
}

fn default_node_rules() -> Vec<MetricRule> {
    use EntityKind::{Extent, Node, Volume};
    vec![
        // `busy` is CPU milliseconds; per second of wall time that is 0.1%.
        MetricRule::rate("cpu_utilization", Node, "busy", 0.1),
        MetricRule::rate("read_data_rate", Extent, "rb", SECTOR_BYTES),
        MetricRule::rate("write_data_rate", Extent, "wb", SECTOR_BYTES),
        MetricRule::rate("read_io_rate", Extent, "ro", 1.0),
        MetricRule::rate("write_io_rate", Extent, "wo", 1.0),
        MetricRule::ratio("read_response_time", Extent, &["re"], "ro", 1.0),
        MetricRule::ratio("write_response_time", Extent, &["we"], "wo", 1.0),
        MetricRule::ratio(
            "write_cache_delay_percentage",
            Volume,
            &["ctwft", "ctwwt"],
            "ctw",
            100.0,
        ),
    ]
}

fn default_storage_group_rules() -> Vec<MetricRule> {
    use EntityKind::{Extent, Volume};
    vec![
        MetricRule::rate("read_data_rate", Volume, "rb", SECTOR_BYTES),
        MetricRule::rate("write_data_rate", Volume, "wb", SECTOR_BYTES),
        MetricRule::rate("read_io_rate", Volume, "ro", 1.0),
        MetricRule::rate("write_io_rate", Volume, "wo", 1.0),
        MetricRule::ratio("read_response_time", Volume, &["rl"], "ro", 1.0),
        MetricRule::ratio("write_response_time", Volume, &["wl"], "wo", 1.0),
        MetricRule::rate("backend_read_data_rate", Extent, "rb", SECTOR_BYTES),
        MetricRule::rate("backend_write_data_rate", Extent, "wb", SECTOR_BYTES),
        MetricRule::rate("backend_read_io_rate", Extent, "ro", 1.0),
        MetricRule::rate("backend_write_io_rate", Extent, "wo", 1.0),
        MetricRule::ratio("backend_read_response_time", Extent, &["re"], "ro", 1.0),
        MetricRule::ratio("backend_write_response_time", Extent, &["we"], "wo", 1.0),
        MetricRule::peak("peak_backend_read_response_time", Extent, "pre"),
        MetricRule::peak("peak_backend_write_response_time", Extent, "pwe"),
    ]
}

fn default_volume_rules() -> Vec<MetricRule> {
    use EntityKind::Volume;
    vec![
        MetricRule::rate("read_data_rate", Volume, "rb", SECTOR_BYTES),
        MetricRule::rate("write_data_rate", Volume, "wb", SECTOR_BYTES),
        MetricRule::rate("read_io_rate", Volume, "ro", 1.0),
        MetricRule::rate("write_io_rate", Volume, "wo", 1.0),
        MetricRule::ratio("read_response_time", Volume, &["rl"], "ro", 1.0),
        MetricRule::ratio("write_response_time", Volume, &["wl"], "wo", 1.0),
    ]
}

fn default_extent_rules() -> Vec<MetricRule> {
    use EntityKind::Extent;
    vec![
        MetricRule::rate("read_data_rate", Extent, "rb", SECTOR_BYTES),
        MetricRule::rate("write_data_rate", Extent, "wb", SECTOR_BYTES),
        MetricRule::rate("read_io_rate", Extent, "ro", 1.0),
        MetricRule::rate("write_io_rate", Extent, "wo", 1.0),
        MetricRule::ratio("read_response_time", Extent, &["re"], "ro", 1.0),
        MetricRule::ratio("write_response_time", Extent, &["we"], "wo", 1.0),
        MetricRule::peak("peak_read_response_time", Extent, "pre"),
        MetricRule::peak("peak_write_response_time", Extent, "pwe"),
    ]
}

fn default_port_rules() -> Vec<MetricRule> {
    use EntityKind::Port;
    vec![
        MetricRule::rate("host_send_data_rate", Port, "hbt", 1.0),
        MetricRule::rate("host_receive_data_rate", Port, "hbr", 1.0),
        MetricRule::rate("controller_send_data_rate", Port, "cbt", 1.0),
        MetricRule::rate("controller_receive_data_rate", Port, "cbr", 1.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = MetricsConfig::default();
        cfg.validate().expect("defaults should validate");
        assert!(cfg.source_kinds().contains(&EntityKind::Extent));
        assert!(!cfg.source_kinds().contains(&EntityKind::StorageGroup));
    }

    #[test]
    fn test_parse_rules_yaml() {
        let yaml = r#"
volume:
  - type: rate
    name: read_io_rate
    source: volume
    counter: ro
  - type: ratio
    name: read_response_time
    source: volume
    numerators: [rl]
    denominator: ro
    scale: 0.001
  - type: peak
    name: peak_read
    source: volume
    counter: pre
"#;
        let cfg: MetricsConfig = serde_yaml::from_str(yaml).expect("valid yaml");
        assert_eq!(cfg.volume.len(), 3);
        assert_eq!(
            cfg.volume[0],
            MetricRule::rate("read_io_rate", EntityKind::Volume, "ro", 1.0)
        );
        assert_eq!(
            cfg.volume[1],
            MetricRule::ratio("read_response_time", EntityKind::Volume, &["rl"], "ro", 0.001)
        );
        assert!(!cfg.volume[2].is_delta_based());
        // Unspecified levels keep their defaults.
        assert_eq!(cfg.port, default_port_rules());
        cfg.validate().expect("should validate");
    }

    #[test]
    fn test_validate_unreachable_source() {
        let cfg = MetricsConfig {
            volume: vec![MetricRule::rate("x", EntityKind::Extent, "ro", 1.0)],
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("cannot be sourced from extent"));

        let cfg = MetricsConfig {
            storage_group: vec![MetricRule::rate("x", EntityKind::Port, "hbt", 1.0)],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_name() {
        let cfg = MetricsConfig {
            port: vec![
                MetricRule::rate("x", EntityKind::Port, "hbt", 1.0),
                MetricRule::rate("x", EntityKind::Port, "hbr", 1.0),
            ],
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate port metric"));
    }

    #[test]
    fn test_validate_bad_scale_and_fields() {
        let cfg = MetricsConfig {
            port: vec![MetricRule::rate("x", EntityKind::Port, "hbt", 0.0)],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = MetricsConfig {
            volume: vec![MetricRule::ratio("x", EntityKind::Volume, &[], "ro", 1.0)],
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("numerators"));

        let cfg = MetricsConfig {
            node: vec![MetricRule::peak("", EntityKind::Node, "busy")],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_node_level_accepts_any_raw_source() {
        let cfg = MetricsConfig {
            node: vec![
                MetricRule::rate("a", EntityKind::Port, "hbt", 1.0),
                MetricRule::rate("b", EntityKind::Volume, "ro", 1.0),
            ],
            ..Default::default()
        };
        cfg.validate().expect("node level reachable from any origin");
    }
}
