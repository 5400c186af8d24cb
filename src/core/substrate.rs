//! The substrate: regions, synapses and the tick that advances them.
//!
//! A [`Substrate`] is built in the [`Phase::Building`] phase (regions, then
//! connections), sealed, and then advanced one tick at a time with
//! [`Substrate::step`]. Each tick applies external input, propagates
//! activations, runs the plasticity rules and advances the tick counter;
//! every `consolidate_every` ticks a consolidation pass prunes, rescales and
//! compacts.

use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::SubstrateConfig;
use crate::error::{Result, SubstrateError};
use crate::plasticity::{self, PlasticityStats, RewardSignal, TickSignals};
use crate::prng::Prng;
use crate::region::{Neuron, NeuronId, NeuronStore, Region, RegionId, RegionKind, UpdatePattern};
use crate::synapse::{SynapseKey, SynapseStore, SynapseView, INVALID_NEURON};

/// Most recent flagged synapses kept for inspection.
pub const MAX_FLAGGED: usize = 1024;

/// Eligibility traces below this magnitude are zeroed during consolidation.
pub const ELIGIBILITY_EPSILON: f32 = 1e-12;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Phase {
    /// Topology may still change.
    #[default]
    Building,
    Idle,
    Stepping,
    Consolidating,
    Checkpointing,
}

/// One sensory observation for a region.
///
/// `features[i]` drives the region's `i`-th neuron; missing entries drive 0
/// and extra entries are ignored.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SensoryFrame {
    pub region: RegionId,
    pub features: Vec<f32>,
    pub timestamp: u64,
}

/// External input consumed by one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickInput {
    pub frames: Vec<SensoryFrame>,
    pub rewards: Vec<RewardSignal>,
}

impl TickInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame(mut self, region: RegionId, features: Vec<f32>, timestamp: u64) -> Self {
        self.frames.push(SensoryFrame {
            region,
            features,
            timestamp,
        });
        self
    }

    pub fn with_reward(mut self, novelty: f32, task_reward: f32, timestamp: u64) -> Self {
        self.rewards.push(RewardSignal {
            novelty,
            task_reward,
            timestamp,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.rewards.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConsolidationReport {
    pub pruned: usize,
    pub rescaled_neurons: usize,
    pub eligibility_cleared: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TickReport {
    /// Tick counter after this step.
    pub tick: u64,
    pub clamped_neurons: usize,
    pub spikes: usize,
    pub rewarded: bool,
    pub plasticity: PlasticityStats,
    pub consolidation: Option<ConsolidationReport>,
    pub elapsed: Duration,
    /// The step took longer than `tick_budget_ms`.
    pub overrun: bool,
}

/// Point-in-time summary of the substrate.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Diagnostics {
    pub tick: u64,
    pub phase: Phase,
    pub region_count: usize,
    pub neuron_count: usize,
    /// Live (non-pruned) synapses.
    pub synapse_count: usize,
    /// Average weight magnitude (saturation indicator).
    pub mean_abs_weight: f32,
    pub mean_activation: f32,
    pub overruns: u64,
    pub dropped_inputs: u64,
    pub flagged_total: u64,
    /// Estimated memory usage in bytes.
    pub memory_bytes: usize,
}

pub struct Substrate {
    pub(crate) cfg: SubstrateConfig,
    pub(crate) seed: u64,
    pub(crate) rng: Prng,
    pub(crate) phase: Phase,
    pub(crate) tick: u64,

    pub(crate) neurons: NeuronStore,
    pub(crate) synapses: SynapseStore,

    flagged: Vec<SynapseKey>,
    flagged_total: u64,
    overruns: u64,
    dropped_inputs: u64,

    // Scratch buffers reused across ticks.
    prev: Vec<f32>,
    clamp: Vec<Option<f32>>,
    noise: Vec<f32>,
}

impl std::fmt::Debug for Substrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Substrate")
            .field("tick", &self.tick)
            .field("phase", &self.phase)
            .field("regions", &self.neurons.regions().len())
            .field("neurons", &self.neurons.len())
            .field("synapses", &self.synapses.synapse_count())
            .finish()
    }
}

impl Substrate {
    pub fn new(cfg: SubstrateConfig) -> Result<Self> {
        cfg.validate().map_err(SubstrateError::config)?;
        let seed = cfg.seed.unwrap_or(1);
        Ok(Self::from_parts(
            cfg,
            seed,
            Prng::new(seed),
            0,
            NeuronStore::new(),
            SynapseStore::new(0),
            Phase::Building,
        ))
    }

    pub(crate) fn from_parts(
        cfg: SubstrateConfig,
        seed: u64,
        rng: Prng,
        tick: u64,
        neurons: NeuronStore,
        synapses: SynapseStore,
        phase: Phase,
    ) -> Self {
        Self {
            cfg,
            seed,
            rng,
            phase,
            tick,
            neurons,
            synapses,
            flagged: Vec::new(),
            flagged_total: 0,
            overruns: 0,
            dropped_inputs: 0,
            prev: Vec::new(),
            clamp: Vec::new(),
            noise: Vec::new(),
        }
    }

    pub fn config(&self) -> &SubstrateConfig {
        &self.cfg
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Completed ticks.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn is_sealed(&self) -> bool {
        self.phase != Phase::Building
    }

    fn require_building(&self) -> Result<()> {
        if self.phase == Phase::Building {
            Ok(())
        } else {
            Err(SubstrateError::config(
                "topology is fixed once the substrate is sealed",
            ))
        }
    }

    fn require_idle(&self, what: &str) -> Result<()> {
        match self.phase {
            Phase::Idle => Ok(()),
            Phase::Building => Err(SubstrateError::config(format!(
                "{what} requires a sealed substrate"
            ))),
            other => Err(SubstrateError::config(format!(
                "{what} is not allowed while {other:?}"
            ))),
        }
    }

    // =========================================================================
    // Topology
    // =========================================================================

    pub fn create_region(&mut self, name: &str, kind: RegionKind, capacity: usize) -> Result<RegionId> {
        self.create_region_with(name, kind, capacity, UpdatePattern::default())
    }

    pub fn create_region_with(
        &mut self,
        name: &str,
        kind: RegionKind,
        capacity: usize,
        pattern: UpdatePattern,
    ) -> Result<RegionId> {
        self.require_building()?;
        let id = self
            .neurons
            .create_region(name, kind, capacity, pattern, &self.cfg)?;
        self.synapses.grow_neurons(self.neurons.len());
        Ok(id)
    }

    /// Connect `from` to `to`, sampling `round(density * pairs)` pairs.
    ///
    /// Returns the number of synapses created.
    pub fn connect(
        &mut self,
        from: RegionId,
        to: RegionId,
        density: f32,
        weights: RangeInclusive<f32>,
    ) -> Result<usize> {
        self.require_building()?;
        let a = self.neurons.region(from)?.clone();
        let b = self.neurons.region(to)?.clone();
        self.synapses.connect(
            &a,
            &b,
            density,
            weights,
            self.cfg.learning.w_max,
            self.cfg.max_synapses,
            self.tick,
            &mut self.rng,
        )
    }

    /// Freeze the topology. Required before the first tick.
    pub fn seal(&mut self) -> Result<()> {
        self.require_building()?;
        self.cfg.validate().map_err(SubstrateError::config)?;
        self.phase = Phase::Idle;
        Ok(())
    }

    // =========================================================================
    // Neuron access
    // =========================================================================

    pub fn regions(&self) -> &[Region] {
        self.neurons.regions()
    }

    pub fn region(&self, id: RegionId) -> Result<&Region> {
        self.neurons.region(id)
    }

    pub fn region_by_name(&self, name: &str) -> Result<&Region> {
        self.neurons.region_by_name(name)
    }

    pub fn neuron_count(&self, region: RegionId) -> Result<usize> {
        self.neurons.neuron_count(region)
    }

    pub fn total_neurons(&self) -> usize {
        self.neurons.len()
    }

    pub fn neuron(&self, id: NeuronId) -> Result<Neuron> {
        self.neurons.neuron(id)
    }

    pub fn set_activation(&mut self, id: NeuronId, value: f32) -> Result<()> {
        self.neurons.set_activation(id, value)
    }

    pub fn get_activation(&self, id: NeuronId) -> Result<f32> {
        self.neurons.get_activation(id)
    }

    pub fn set_threshold(&mut self, id: NeuronId, value: f32) -> Result<()> {
        self.neurons.set_threshold(id, value)
    }

    pub fn activations(&self) -> &[f32] {
        self.neurons.activations()
    }

    pub fn region_activations(&self, region: RegionId) -> Result<&[f32]> {
        self.neurons.region_activations(region)
    }

    // =========================================================================
    // Synapse access
    // =========================================================================

    pub fn synapses(&self) -> &SynapseStore {
        &self.synapses
    }

    pub fn synapse_count(&self) -> usize {
        self.synapses.synapse_count()
    }

    pub fn synapse(&self, key: SynapseKey) -> Result<SynapseView> {
        self.synapses.synapse(key)
    }

    pub fn for_each_synapse_from<F>(&self, source: NeuronId, visitor: F) -> Result<()>
    where
        F: FnMut(SynapseView),
    {
        self.synapses.for_each_synapse_from(source, visitor)
    }

    pub fn outgoing_count(&self, source: NeuronId) -> Result<usize> {
        self.synapses.outgoing_count(source)
    }

    /// Most recent synapses whose update was discarded as non-finite.
    pub fn flagged_synapses(&self) -> &[SynapseKey] {
        &self.flagged
    }

    // =========================================================================
    // Tick
    // =========================================================================

    /// Advance one tick.
    ///
    /// Input is validated before anything is modified; an invalid frame or
    /// reward fails the call and leaves the substrate untouched.
    pub fn step(&mut self, input: &TickInput) -> Result<TickReport> {
        self.require_idle("step")?;
        self.validate_input(input)?;

        let started = Instant::now();
        self.phase = Phase::Stepping;
        let now = self.tick;

        let clamped_neurons = self.apply_frames(&input.frames);
        let spikes = self.propagate(now);

        let reward = if self.cfg.learning.rules.reward {
            plasticity::reward_drive(&self.cfg.learning, &input.rewards)
        } else {
            None
        };
        let signals = TickSignals {
            activation: &self.neurons.activation,
            last_spike: &self.neurons.last_spike,
            now,
            reward,
        };
        let first_flagged = self.flagged.len();
        let stats = plasticity::apply(
            &mut self.synapses,
            &self.cfg.learning,
            &signals,
            &mut self.flagged,
        );
        self.flagged_total += (self.flagged.len() - first_flagged) as u64;
        if self.flagged.len() > MAX_FLAGGED {
            let excess = self.flagged.len() - MAX_FLAGGED;
            self.flagged.drain(..excess);
        }

        self.tick += 1;
        self.phase = Phase::Idle;

        let consolidation = if self.tick % self.cfg.consolidate_every == 0 {
            Some(self.consolidate()?)
        } else {
            None
        };

        let elapsed = started.elapsed();
        let overrun = elapsed > Duration::from_millis(self.cfg.tick_budget_ms as u64);
        if overrun {
            self.overruns += 1;
        }

        Ok(TickReport {
            tick: self.tick,
            clamped_neurons,
            spikes,
            rewarded: reward.is_some(),
            plasticity: stats,
            consolidation,
            elapsed,
            overrun,
        })
    }

    fn validate_input(&self, input: &TickInput) -> Result<()> {
        for frame in &input.frames {
            self.neurons.region(frame.region)?;
            if let Some(bad) = frame.features.iter().find(|v| !v.is_finite()) {
                return Err(SubstrateError::NumericInstability(format!(
                    "non-finite feature {bad} for region #{}",
                    frame.region
                )));
            }
        }
        for r in &input.rewards {
            if !r.novelty.is_finite() || !r.task_reward.is_finite() {
                return Err(SubstrateError::NumericInstability(
                    "non-finite reward component".to_string(),
                ));
            }
            if !(0.0..=1.0).contains(&r.novelty) || !(0.0..=1.0).contains(&r.task_reward) {
                return Err(SubstrateError::config(
                    "reward components must be in [0, 1]",
                ));
            }
        }
        Ok(())
    }

    /// Record clamp values for every neuron of every framed region. Frames are
    /// applied oldest first so the latest timestamp wins.
    fn apply_frames(&mut self, frames: &[SensoryFrame]) -> usize {
        let n = self.neurons.len();
        self.clamp.clear();
        self.clamp.resize(n, None);

        let mut order: Vec<&SensoryFrame> = frames.iter().collect();
        order.sort_by_key(|f| f.timestamp);

        let mut clamped = 0;
        for frame in order {
            let Ok(region) = self.neurons.region(frame.region) else {
                continue;
            };
            for (i, neuron) in region.neurons.clone().enumerate() {
                let v = frame.features.get(i).copied().unwrap_or(0.0).clamp(-1.0, 1.0);
                if self.clamp[neuron].replace(v).is_none() {
                    clamped += 1;
                }
            }
        }
        clamped
    }

    /// Update every neuron's activation. Returns the number of spikes.
    fn propagate(&mut self, now: u64) -> usize {
        let n = self.neurons.len();
        self.prev.clear();
        self.prev.extend_from_slice(&self.neurons.activation);

        // Pre-generate noise (keeps the RNG stream independent of execution order).
        self.noise.clear();
        let amp = self.cfg.activation_noise;
        if amp > 0.0 {
            for _ in 0..n {
                let v = self.rng.gen_range_f32(-amp, amp);
                self.noise.push(v);
            }
        } else {
            self.noise.resize(n, 0.0);
        }

        let rate = self.cfg.activation_rate;
        for r in 0..self.neurons.regions().len() {
            let (range, pattern) = {
                let region = &self.neurons.regions()[r];
                (region.neurons.clone(), region.pattern)
            };
            match pattern {
                UpdatePattern::Synchronous => {
                    let next = self.synchronous_update(range.clone(), rate);
                    self.neurons.activation[range].copy_from_slice(&next);
                }
                UpdatePattern::Asynchronous => {
                    for d in range {
                        let a = self.neurons.activation[d];
                        let next = match self.clamp[d] {
                            Some(v) => v,
                            None => {
                                let drive = drive_into(&self.synapses, &self.neurons.activation, d);
                                integrate(a, drive, self.neurons.threshold[d], rate, self.noise[d])
                            }
                        };
                        self.neurons.activation[d] = next;
                    }
                }
            }
        }

        let trace_rate = self.cfg.activity_trace_rate;
        let mut spikes = 0;
        for d in 0..n {
            let a = self.neurons.activation[d];
            if a > 0.0 && a >= self.neurons.threshold[d] {
                self.neurons.last_spike[d] = Some(now);
                spikes += 1;
            }
            let tr = &mut self.neurons.activity_trace[d];
            *tr = (1.0 - trace_rate) * *tr + trace_rate * a.max(0.0);
        }
        spikes
    }

    #[cfg(not(feature = "parallel"))]
    fn synchronous_update(&self, range: std::ops::Range<NeuronId>, rate: f32) -> Vec<f32> {
        range
            .map(|d| self.next_activation(d, rate))
            .collect()
    }

    #[cfg(feature = "parallel")]
    fn synchronous_update(&self, range: std::ops::Range<NeuronId>, rate: f32) -> Vec<f32> {
        range
            .into_par_iter()
            .map(|d| self.next_activation(d, rate))
            .collect()
    }

    #[inline]
    fn next_activation(&self, d: NeuronId, rate: f32) -> f32 {
        match self.clamp[d] {
            Some(v) => v,
            None => {
                let drive = drive_into(&self.synapses, &self.prev, d);
                integrate(
                    self.prev[d],
                    drive,
                    self.neurons.threshold[d],
                    rate,
                    self.noise[d],
                )
            }
        }
    }

    // =========================================================================
    // Consolidation
    // =========================================================================

    /// Prune, rescale and compact. Runs automatically every
    /// `consolidate_every` ticks.
    pub fn consolidate(&mut self) -> Result<ConsolidationReport> {
        self.require_idle("consolidate")?;
        self.phase = Phase::Consolidating;

        let now = self.tick;
        let prune = self.cfg.prune;
        let pruned = self
            .synapses
            .prune_below(prune.threshold, prune.min_idle_steps, now);
        let rescaled_neurons = plasticity::homeostasis(
            &mut self.synapses,
            &self.neurons.activity_trace,
            &self.cfg.homeostasis,
            self.cfg.learning.w_max,
            now,
        );
        let eligibility_cleared = plasticity::settle_eligibility(&mut self.synapses);
        self.synapses.compact();

        self.phase = Phase::Idle;
        Ok(ConsolidationReport {
            pruned,
            rescaled_neurons,
            eligibility_cleared,
        })
    }

    /// Remove synapses with `|w| < threshold` that have been idle for at least
    /// `min_idle_steps` ticks. Runs as its own consolidation phase.
    pub fn prune_below(&mut self, threshold: f32, min_idle_steps: u64) -> Result<usize> {
        self.require_idle("prune")?;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(SubstrateError::config("prune threshold must be finite and >= 0"));
        }
        self.phase = Phase::Consolidating;
        let removed = self.synapses.prune_below(threshold, min_idle_steps, self.tick);
        self.synapses.compact();
        self.phase = Phase::Idle;
        Ok(removed)
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub(crate) fn record_dropped_inputs(&mut self, total: u64) {
        self.dropped_inputs = total;
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    pub fn dropped_inputs(&self) -> u64 {
        self.dropped_inputs
    }

    pub fn estimated_memory_bytes(&self) -> usize {
        let per_neuron = 4 + 4 + 16 + 4 + 8 + 8;
        let per_slot = 8 + 4 + 4 + 8 + 1 + 8 + 8;
        self.neurons.len() * per_neuron + self.synapses.slot_count() * per_slot
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let n = self.neurons.len();
        let mean_activation = if n == 0 {
            0.0
        } else {
            self.neurons.activation.iter().sum::<f32>() / n as f32
        };
        Diagnostics {
            tick: self.tick,
            phase: self.phase,
            region_count: self.neurons.regions().len(),
            neuron_count: n,
            synapse_count: self.synapses.synapse_count(),
            mean_abs_weight: self.synapses.mean_abs_weight(),
            mean_activation,
            overruns: self.overruns,
            dropped_inputs: self.dropped_inputs,
            flagged_total: self.flagged_total,
            memory_bytes: self.estimated_memory_bytes(),
        }
    }
}

/// Weighted input arriving at `d`.
#[inline]
fn drive_into(store: &SynapseStore, source_acts: &[f32], d: NeuronId) -> f32 {
    let mut sum = 0.0;
    for &slot in &store.in_slots[store.in_offsets[d]..store.in_offsets[d + 1]] {
        if store.targets[slot] == INVALID_NEURON {
            continue;
        }
        sum += store.weights[slot] * source_acts[store.sources[slot]];
    }
    sum
}

/// Leaky integration toward `tanh(max(drive - threshold, 0))`.
#[inline]
fn integrate(a: f32, drive: f32, threshold: f32, rate: f32, noise: f32) -> f32 {
    let target = (drive - threshold).max(0.0).tanh();
    let next = (a + rate * (target - a) + noise).clamp(-1.0, 1.0);
    if next.is_finite() {
        next
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LearningConfig, RuleSet};
    use crate::error::{Reference, Resource};

    fn small() -> (Substrate, RegionId, RegionId) {
        let cfg = SubstrateConfig::default().with_seed(7);
        let mut s = Substrate::new(cfg).unwrap();
        let a = s.create_region("in", RegionKind::Sensory, 8).unwrap();
        let b = s.create_region("out", RegionKind::Motor, 8).unwrap();
        s.connect(a, b, 0.5, 0.2..=0.6).unwrap();
        (s, a, b)
    }

    #[test]
    fn topology_is_frozen_after_seal() {
        let (mut s, a, b) = small();
        assert!(s.step(&TickInput::new()).is_err());
        s.seal().unwrap();
        assert_eq!(s.phase(), Phase::Idle);

        assert!(matches!(
            s.create_region("late", RegionKind::Associative, 4),
            Err(SubstrateError::Configuration(_))
        ));
        assert!(matches!(
            s.connect(a, b, 0.1, 0.1..=0.2),
            Err(SubstrateError::Configuration(_))
        ));
        assert!(s.seal().is_err());
    }

    #[test]
    fn unknown_region_is_rejected_before_mutation() {
        let (mut s, a, _) = small();
        assert!(matches!(
            s.connect(a, 9, 0.5, 0.1..=0.2),
            Err(SubstrateError::InvalidReference(Reference::Region(9)))
        ));
        s.seal().unwrap();

        let input = TickInput::new().with_frame(42, vec![1.0], 0);
        assert!(matches!(
            s.step(&input),
            Err(SubstrateError::InvalidReference(_))
        ));
        let input = TickInput::new().with_frame(a, vec![f32::NAN], 0);
        assert!(matches!(
            s.step(&input),
            Err(SubstrateError::NumericInstability(_))
        ));
        assert_eq!(s.tick(), 0);
        assert_eq!(s.phase(), Phase::Idle);
    }

    #[test]
    fn frames_clamp_their_region_and_latest_wins() {
        let (mut s, a, _) = small();
        s.seal().unwrap();
        let input = TickInput::new()
            .with_frame(a, vec![0.9; 8], 20)
            .with_frame(a, vec![0.3; 8], 10);
        let report = s.step(&input).unwrap();
        assert_eq!(report.clamped_neurons, 8);
        assert_eq!(report.tick, 1);
        assert!(s.region_activations(a).unwrap().iter().all(|&v| v == 0.9));
        let first = s.region(a).unwrap().neurons.start;
        assert_eq!(s.neuron(first).unwrap().last_spike, Some(0));
    }

    #[test]
    fn driven_region_activates_downstream() {
        let (mut s, a, b) = small();
        s.seal().unwrap();
        for t in 0..20 {
            s.step(&TickInput::new().with_frame(a, vec![1.0; 8], t)).unwrap();
        }
        let out = s.region_activations(b).unwrap();
        assert!(out.iter().any(|&v| v > 0.0));
        assert!(out.iter().all(|&v| (-1.0..=1.0).contains(&v)));
    }

    #[test]
    fn asynchronous_region_sees_same_tick_updates() {
        let cfg = SubstrateConfig {
            activation_rate: 1.0,
            default_threshold: 0.0,
            ..SubstrateConfig::default()
        }
        .with_learning(LearningConfig::default().with_rules(RuleSet {
            associative: false,
            timing: false,
            reward: false,
        }));
        let build = |pattern| {
            let mut s = Substrate::new(cfg).unwrap();
            let src = s.create_region("src", RegionKind::Sensory, 1).unwrap();
            let chain = s
                .create_region_with("chain", RegionKind::Associative, 2, pattern)
                .unwrap();
            s.connect(src, chain, 1.0, 1.0..=1.0).unwrap();
            s.connect(chain, chain, 1.0, 1.0..=1.0).unwrap();
            s.seal().unwrap();
            s.step(&TickInput::new().with_frame(src, vec![1.0], 0)).unwrap();
            s
        };

        // Chain neurons read the clamped source; the second chain neuron also
        // reads the first. Asynchronous order lets that value land this tick.
        let sync = build(UpdatePattern::Synchronous);
        let asyn = build(UpdatePattern::Asynchronous);
        let sync_out = sync.region_activations(1).unwrap();
        let async_out = asyn.region_activations(1).unwrap();
        assert_eq!(sync_out[0], sync_out[1]);
        assert!(async_out[1] > async_out[0]);
    }

    #[test]
    fn consolidation_runs_on_cadence() {
        let cfg = SubstrateConfig::default()
            .with_seed(3)
            .with_consolidate_every(5);
        let mut s = Substrate::new(cfg).unwrap();
        let a = s.create_region("a", RegionKind::Associative, 4).unwrap();
        s.connect(a, a, 0.5, 0.1..=0.2).unwrap();
        s.seal().unwrap();
        for i in 1..=10 {
            let report = s.step(&TickInput::new()).unwrap();
            assert_eq!(report.consolidation.is_some(), i % 5 == 0);
        }
        assert_eq!(s.phase(), Phase::Idle);
    }

    #[test]
    fn oversized_connect_is_refused_before_sampling() {
        let cfg = SubstrateConfig {
            max_synapses: 10,
            ..SubstrateConfig::default()
        }
        .with_seed(5);
        let cap = cfg.max_region_capacity;
        let mut s = Substrate::new(cfg).unwrap();
        let a = s.create_region("wide_a", RegionKind::Sensory, cap).unwrap();
        let b = s.create_region("wide_b", RegionKind::Associative, cap).unwrap();
        let rng_before = s.rng.state();

        assert!(matches!(
            s.connect(a, b, 0.01, 0.1..=0.2),
            Err(SubstrateError::ResourceExhausted {
                resource: Resource::Synapses,
                limit: 10,
            })
        ));
        assert_eq!(s.synapse_count(), 0);
        assert_eq!(s.rng.state(), rng_before);

        // Still usable within the limit.
        let small = s.create_region("small", RegionKind::Motor, 4).unwrap();
        assert_eq!(s.connect(small, small, 0.5, 0.1..=0.2).unwrap(), 6);
    }

    #[test]
    fn explicit_prune_removes_weak_idle_synapses() {
        let (mut s, _, _) = small();
        let before = s.synapse_count();
        s.seal().unwrap();
        assert_eq!(s.prune_below(1.0, 0).unwrap(), before);
        assert_eq!(s.synapse_count(), 0);
        assert_eq!(s.diagnostics().synapse_count, 0);
    }
}
