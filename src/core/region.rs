//! Regions and per-neuron state.
//!
//! Neuron state is stored struct-of-arrays, indexed by [`NeuronId`]. Regions
//! own contiguous, non-overlapping id ranges allocated in creation order, so
//! the neuron table is always covered exactly by the region table.

use std::ops::Range;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::SubstrateConfig;
use crate::error::{Reference, Resource, Result, SubstrateError};

pub type NeuronId = usize;
pub type RegionId = usize;

/// Declared functional role of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RegionKind {
    Sensory,
    Associative,
    Motor,
    Modulatory,
}

impl RegionKind {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            RegionKind::Sensory => 0,
            RegionKind::Associative => 1,
            RegionKind::Motor => 2,
            RegionKind::Modulatory => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RegionKind::Sensory),
            1 => Some(RegionKind::Associative),
            2 => Some(RegionKind::Motor),
            3 => Some(RegionKind::Modulatory),
            _ => None,
        }
    }
}

/// How a region's neurons see each other's activations within a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum UpdatePattern {
    /// Every neuron reads the previous tick's activations.
    #[default]
    Synchronous,
    /// Neurons update in id order and see values already written this tick.
    Asynchronous,
}

impl UpdatePattern {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            UpdatePattern::Synchronous => 0,
            UpdatePattern::Asynchronous => 1,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(UpdatePattern::Synchronous),
            1 => Some(UpdatePattern::Asynchronous),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Region {
    pub id: RegionId,
    pub name: String,
    pub kind: RegionKind,
    pub neurons: Range<NeuronId>,
    pub pattern: UpdatePattern,
}

impl Region {
    pub fn len(&self) -> usize {
        self.neurons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neurons.is_empty()
    }

    pub fn contains(&self, neuron: NeuronId) -> bool {
        self.neurons.contains(&neuron)
    }
}

/// Copy of one neuron's state.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Neuron {
    pub id: NeuronId,
    pub region: RegionId,
    pub activation: f32,
    pub threshold: f32,
    /// Tick of the last activation event (activation reached threshold).
    pub last_spike: Option<u64>,
    /// Slow running mean of activation.
    pub activity_trace: f32,
}

#[derive(Debug, Clone, Default)]
pub struct NeuronStore {
    regions: Vec<Region>,
    owner: Vec<RegionId>,

    pub(crate) activation: Vec<f32>,
    pub(crate) threshold: Vec<f32>,
    pub(crate) last_spike: Vec<Option<u64>>,
    pub(crate) activity_trace: Vec<f32>,
}

impl NeuronStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a region of `capacity` neurons.
    ///
    /// Fails without modifying the store when any limit in `cfg` would be
    /// exceeded.
    pub fn create_region(
        &mut self,
        name: &str,
        kind: RegionKind,
        capacity: usize,
        pattern: UpdatePattern,
        cfg: &SubstrateConfig,
    ) -> Result<RegionId> {
        if name.is_empty() {
            return Err(SubstrateError::config("region name must not be empty"));
        }
        if capacity == 0 {
            return Err(SubstrateError::config(format!(
                "region {name:?}: capacity must be >= 1"
            )));
        }
        if capacity > cfg.max_region_capacity {
            return Err(SubstrateError::config(format!(
                "region {name:?}: capacity {capacity} exceeds max_region_capacity {}",
                cfg.max_region_capacity
            )));
        }
        if self.regions.iter().any(|r| r.name == name) {
            return Err(SubstrateError::config(format!(
                "region {name:?} already exists"
            )));
        }
        if self.regions.len() >= cfg.max_regions {
            return Err(SubstrateError::ResourceExhausted {
                resource: Resource::Regions,
                limit: cfg.max_regions,
            });
        }
        let start = self.len();
        let end = match start.checked_add(capacity) {
            Some(end) if end <= cfg.max_neurons => end,
            _ => {
                return Err(SubstrateError::ResourceExhausted {
                    resource: Resource::Neurons,
                    limit: cfg.max_neurons,
                })
            }
        };

        let id = self.regions.len();
        self.regions.push(Region {
            id,
            name: name.to_string(),
            kind,
            neurons: start..end,
            pattern,
        });
        self.owner.resize(end, id);
        self.activation.resize(end, 0.0);
        self.threshold.resize(end, cfg.default_threshold);
        self.last_spike.resize(end, None);
        self.activity_trace.resize(end, 0.0);
        Ok(id)
    }

    /// Total neuron count across all regions.
    #[inline]
    pub fn len(&self) -> usize {
        self.activation.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.activation.is_empty()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region(&self, id: RegionId) -> Result<&Region> {
        self.regions
            .get(id)
            .ok_or(SubstrateError::InvalidReference(Reference::Region(id)))
    }

    pub fn region_by_name(&self, name: &str) -> Result<&Region> {
        self.regions
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| SubstrateError::InvalidReference(Reference::RegionName(name.to_string())))
    }

    pub fn neuron_count(&self, region: RegionId) -> Result<usize> {
        Ok(self.region(region)?.len())
    }

    #[inline]
    pub(crate) fn check_neuron(&self, id: NeuronId) -> Result<()> {
        if id < self.len() {
            Ok(())
        } else {
            Err(SubstrateError::InvalidReference(Reference::Neuron(id)))
        }
    }

    pub fn owner(&self, id: NeuronId) -> Result<RegionId> {
        self.check_neuron(id)?;
        Ok(self.owner[id])
    }

    pub fn set_activation(&mut self, id: NeuronId, value: f32) -> Result<()> {
        self.check_neuron(id)?;
        if !value.is_finite() {
            return Err(SubstrateError::NumericInstability(format!(
                "non-finite activation {value} for neuron #{id}"
            )));
        }
        self.activation[id] = value;
        Ok(())
    }

    pub fn get_activation(&self, id: NeuronId) -> Result<f32> {
        self.check_neuron(id)?;
        Ok(self.activation[id])
    }

    pub fn set_threshold(&mut self, id: NeuronId, value: f32) -> Result<()> {
        self.check_neuron(id)?;
        if !value.is_finite() || value < 0.0 {
            return Err(SubstrateError::config(format!(
                "threshold for neuron #{id} must be finite and >= 0"
            )));
        }
        self.threshold[id] = value;
        Ok(())
    }

    pub fn neuron(&self, id: NeuronId) -> Result<Neuron> {
        self.check_neuron(id)?;
        Ok(Neuron {
            id,
            region: self.owner[id],
            activation: self.activation[id],
            threshold: self.threshold[id],
            last_spike: self.last_spike[id],
            activity_trace: self.activity_trace[id],
        })
    }

    pub fn activations(&self) -> &[f32] {
        &self.activation
    }

    pub fn region_activations(&self, region: RegionId) -> Result<&[f32]> {
        let r = self.region(region)?;
        Ok(&self.activation[r.neurons.clone()])
    }

    /// Rebuild a store from checkpointed tables.
    ///
    /// The caller has already validated that the region ranges are contiguous
    /// from zero and cover every neuron.
    pub(crate) fn from_parts(regions: Vec<Region>, neurons: Vec<Neuron>) -> Self {
        let n = neurons.len();
        let mut owner = Vec::with_capacity(n);
        let mut activation = Vec::with_capacity(n);
        let mut threshold = Vec::with_capacity(n);
        let mut last_spike = Vec::with_capacity(n);
        let mut activity_trace = Vec::with_capacity(n);
        for neuron in neurons {
            owner.push(neuron.region);
            activation.push(neuron.activation);
            threshold.push(neuron.threshold);
            last_spike.push(neuron.last_spike);
            activity_trace.push(neuron.activity_trace);
        }
        Self {
            regions,
            owner,
            activation,
            threshold,
            last_spike,
            activity_trace,
        }
    }
}
