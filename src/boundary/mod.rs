//! Narrow surfaces for code outside the tick loop.
//!
//! Producers push through [`SensoryInput`] and [`RewardInput`], which only
//! touch the scheduler's bounded buffers. Consumers read through
//! [`ActivationReader`] and [`SubstrateAdapter`], which take the read side of
//! the phase lock and never mutate anything.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::region::{RegionId, RegionKind};
use crate::scheduler::Scheduler;
use crate::substrate::{Diagnostics, Substrate};
use crate::synapse::SynapseKey;

/// Sensory producer handle.
#[derive(Clone)]
pub struct SensoryInput {
    scheduler: Scheduler,
}

impl SensoryInput {
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            scheduler: scheduler.clone(),
        }
    }

    /// Resolve a region name once so the hot path can push by id.
    pub fn region_id(&self, name: &str) -> Result<RegionId> {
        self.scheduler.read(|s| s.region_by_name(name).map(|r| r.id))
    }

    /// Queue a feature vector for `region`. Rejects unknown regions and
    /// non-finite features; drops the oldest queued frame when full.
    pub fn push(&self, region: RegionId, features: Vec<f32>, timestamp: u64) -> Result<()> {
        self.scheduler.push_sensory(region, features, timestamp)
    }
}

/// Reward producer handle.
#[derive(Clone)]
pub struct RewardInput {
    scheduler: Scheduler,
}

impl RewardInput {
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            scheduler: scheduler.clone(),
        }
    }

    /// Queue a reward. Components are clamped to `[0, 1]`; non-finite values
    /// are rejected.
    pub fn push(&self, novelty: f32, task_reward: f32, timestamp: u64) -> Result<()> {
        self.scheduler.push_reward(novelty, task_reward, timestamp)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ActivationSnapshot {
    pub region: RegionId,
    /// Completed ticks when the snapshot was taken.
    pub tick: u64,
    pub values: Vec<f32>,
}

/// Point-in-time activation reads.
#[derive(Clone)]
pub struct ActivationReader {
    scheduler: Scheduler,
}

impl ActivationReader {
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            scheduler: scheduler.clone(),
        }
    }

    pub fn snapshot(&self, region: RegionId) -> Result<ActivationSnapshot> {
        self.scheduler.read(|s| {
            Ok(ActivationSnapshot {
                region,
                tick: s.tick(),
                values: s.region_activations(region)?.to_vec(),
            })
        })
    }

    pub fn snapshot_by_name(&self, name: &str) -> Result<ActivationSnapshot> {
        self.scheduler.read(|s| {
            let region = s.region_by_name(name)?.id;
            Ok(ActivationSnapshot {
                region,
                tick: s.tick(),
                values: s.region_activations(region)?.to_vec(),
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegionSummary {
    pub id: RegionId,
    pub name: String,
    pub kind: RegionKind,
    pub neurons: usize,
    pub mean_activation: f32,
}

/// A read-only snapshot of the substrate.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SubstrateSnapshot {
    pub diagnostics: Diagnostics,
    pub regions: Vec<RegionSummary>,
    /// Most recent synapses whose update was discarded as non-finite.
    pub flagged: Vec<SynapseKey>,
}

pub struct SubstrateAdapter<'a> {
    substrate: &'a Substrate,
}

impl<'a> SubstrateAdapter<'a> {
    pub fn new(substrate: &'a Substrate) -> Self {
        Self { substrate }
    }

    pub fn snapshot(&self) -> SubstrateSnapshot {
        let s = self.substrate;
        let regions = s
            .regions()
            .iter()
            .map(|r| {
                let values = &s.activations()[r.neurons.clone()];
                RegionSummary {
                    id: r.id,
                    name: r.name.clone(),
                    kind: r.kind,
                    neurons: r.len(),
                    mean_activation: values.iter().sum::<f32>() / values.len().max(1) as f32,
                }
            })
            .collect();

        SubstrateSnapshot {
            diagnostics: s.diagnostics(),
            regions,
            flagged: s.flagged_synapses().to_vec(),
        }
    }
}

impl Scheduler {
    /// Snapshot through [`SubstrateAdapter`] under the read lock.
    pub fn snapshot(&self) -> SubstrateSnapshot {
        self.read(|s| SubstrateAdapter::new(s).snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubstrateConfig;
    use crate::error::SubstrateError;

    fn running() -> Scheduler {
        let mut s = Substrate::new(SubstrateConfig::default().with_seed(8)).unwrap();
        let a = s.create_region("vision", RegionKind::Sensory, 6).unwrap();
        let b = s.create_region("motor", RegionKind::Motor, 3).unwrap();
        s.connect(a, b, 0.6, 0.2..=0.7).unwrap();
        s.seal().unwrap();
        Scheduler::new(s).unwrap()
    }

    #[test]
    fn producers_feed_the_next_tick() {
        let sched = running();
        let sensory = SensoryInput::new(&sched);
        let reward = RewardInput::new(&sched);
        let reader = ActivationReader::new(&sched);

        let vision = sensory.region_id("vision").unwrap();
        sensory.push(vision, vec![0.5; 6], 1).unwrap();
        reward.push(0.1, 0.8, 1).unwrap();
        sched.tick().unwrap();

        let snap = reader.snapshot(vision).unwrap();
        assert_eq!(snap.tick, 1);
        assert_eq!(snap.values, vec![0.5; 6]);
        assert_eq!(reader.snapshot_by_name("motor").unwrap().values.len(), 3);
    }

    #[test]
    fn bad_input_is_rejected_at_the_boundary() {
        let sched = running();
        let sensory = SensoryInput::new(&sched);
        assert!(matches!(
            sensory.region_id("audio"),
            Err(SubstrateError::InvalidReference(_))
        ));
        assert!(sensory.push(0, vec![f32::NAN], 0).is_err());
        assert!(RewardInput::new(&sched).push(f32::INFINITY, 0.0, 0).is_err());
        assert!(ActivationReader::new(&sched).snapshot(5).is_err());
        assert_eq!(sched.pending_inputs(), 0);
    }

    #[test]
    fn adapter_summarizes_regions() {
        let sched = running();
        sched.push_sensory(0, vec![1.0; 6], 0).unwrap();
        sched.tick().unwrap();
        let snap = sched.snapshot();
        assert_eq!(snap.regions.len(), 2);
        assert_eq!(snap.regions[0].mean_activation, 1.0);
        assert_eq!(snap.diagnostics.tick, 1);
        assert_eq!(snap.diagnostics.neuron_count, 9);
        assert!(snap.flagged.is_empty());
    }
}
