//! Daemon configuration: listen address, tick cadence and the initial
//! topology. Stored as JSON next to the checkpoint; missing fields take
//! their defaults.

use std::fs;
use std::path::Path;

use neurite::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::DaemonError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSpec {
    pub name: String,
    pub kind: RegionKind,
    pub capacity: usize,
    #[serde(default)]
    pub pattern: UpdatePattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub from: String,
    pub to: String,
    pub density: f32,
    pub weight_low: f32,
    pub weight_high: f32,
}

/// Regions and connections used when no checkpoint exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub regions: Vec<RegionSpec>,
    pub connections: Vec<ConnectionSpec>,
}

impl Default for Topology {
    fn default() -> Self {
        let region = |name: &str, kind, capacity| RegionSpec {
            name: name.to_string(),
            kind,
            capacity,
            pattern: UpdatePattern::Synchronous,
        };
        let link = |from: &str, to: &str, density, weight_low, weight_high| ConnectionSpec {
            from: from.to_string(),
            to: to.to_string(),
            density,
            weight_low,
            weight_high,
        };
        Self {
            regions: vec![
                region("sensory", RegionKind::Sensory, 256),
                region("assoc", RegionKind::Associative, 1024),
                region("motor", RegionKind::Motor, 64),
            ],
            connections: vec![
                link("sensory", "assoc", 0.05, 0.1, 0.6),
                link("assoc", "assoc", 0.01, -0.2, 0.2),
                link("assoc", "motor", 0.05, 0.0, 0.4),
            ],
        }
    }
}

impl Topology {
    /// Build and seal a fresh substrate.
    pub fn build(&self, cfg: SubstrateConfig) -> Result<Substrate, DaemonError> {
        let mut substrate = Substrate::new(cfg)?;
        for r in &self.regions {
            substrate.create_region_with(&r.name, r.kind, r.capacity, r.pattern)?;
        }
        for c in &self.connections {
            let from = substrate.region_by_name(&c.from)?.id;
            let to = substrate.region_by_name(&c.to)?.id;
            let created = substrate.connect(from, to, c.density, c.weight_low..=c.weight_high)?;
            info!(from = %c.from, to = %c.to, created, "connected regions");
        }
        substrate.seal()?;
        Ok(substrate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen: String,
    pub tick_period_ms: u64,
    /// Periodic checkpoint cadence in ticks; 0 disables.
    pub checkpoint_every: u64,
    pub topology: Topology,
    pub substrate: SubstrateConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9876".to_string(),
            tick_period_ms: 20,
            checkpoint_every: 10_000,
            topology: Topology::default(),
            substrate: SubstrateConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Read `path`, or fall back to defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, DaemonError> {
        let cfg = if path.exists() {
            let text = fs::read_to_string(path)?;
            serde_json::from_str(&text)?
        } else {
            info!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.tick_period_ms == 0 {
            return Err(DaemonError::Config("tick_period_ms must be >= 1".into()));
        }
        if self.topology.regions.is_empty() {
            return Err(DaemonError::Config("topology needs at least one region".into()));
        }
        self.substrate
            .validate()
            .map_err(|e| DaemonError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: DaemonConfig =
            serde_json::from_str(r#"{ "tick_period_ms": 5, "substrate": { "seed": 9 } }"#).unwrap();
        assert_eq!(cfg.tick_period_ms, 5);
        assert_eq!(cfg.listen, "127.0.0.1:9876");
        assert_eq!(cfg.substrate.seed, Some(9));
        assert_eq!(cfg.topology, Topology::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_period_is_rejected() {
        let cfg = DaemonConfig {
            tick_period_ms: 0,
            ..DaemonConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(DaemonError::Config(_))));
    }

    #[test]
    fn topology_builds_a_sealed_substrate() {
        let topology = Topology {
            regions: vec![
                RegionSpec {
                    name: "in".into(),
                    kind: RegionKind::Sensory,
                    capacity: 8,
                    pattern: UpdatePattern::Synchronous,
                },
                RegionSpec {
                    name: "out".into(),
                    kind: RegionKind::Motor,
                    capacity: 4,
                    pattern: UpdatePattern::Asynchronous,
                },
            ],
            connections: vec![ConnectionSpec {
                from: "in".into(),
                to: "out".into(),
                density: 0.5,
                weight_low: 0.1,
                weight_high: 0.3,
            }],
        };
        let s = topology.build(SubstrateConfig::default().with_seed(2)).unwrap();
        assert_eq!(s.phase(), Phase::Idle);
        assert_eq!(s.regions().len(), 2);
        assert_eq!(s.synapse_count(), 16);
    }

    #[test]
    fn unknown_region_in_connection_fails() {
        let topology = Topology {
            regions: vec![RegionSpec {
                name: "in".into(),
                kind: RegionKind::Sensory,
                capacity: 4,
                pattern: UpdatePattern::Synchronous,
            }],
            connections: vec![ConnectionSpec {
                from: "in".into(),
                to: "nowhere".into(),
                density: 0.5,
                weight_low: 0.0,
                weight_high: 0.1,
            }],
        };
        assert!(matches!(
            topology.build(SubstrateConfig::default()),
            Err(DaemonError::Substrate(SubstrateError::InvalidReference(_)))
        ));
    }
}
