//! Sparse synapse storage.
//!
//! Synapses live in a CSR (compressed sparse row) layout keyed by source
//! neuron: source `i` owns slots `offsets[i]..offsets[i + 1]`, and each slot
//! carries its destination, weight, eligibility trace, last-update tick and
//! rule tag in parallel arrays.
//!
//! Slots are an internal detail. A synapse is identified by its
//! [`SynapseKey`]; pruning tombstones slots and compaction removes them, but
//! a key stays valid for as long as the synapse exists.

use std::ops::RangeInclusive;

use hashbrown::HashSet;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Reference, Resource, Result, SubstrateError};
use crate::prng::Prng;
use crate::region::{NeuronId, Region};

/// Sentinel destination for pruned slots awaiting compaction.
pub const INVALID_NEURON: NeuronId = NeuronId::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SynapseKey {
    pub source: NeuronId,
    pub destination: NeuronId,
}

impl SynapseKey {
    pub fn new(source: NeuronId, destination: NeuronId) -> Self {
        Self {
            source,
            destination,
        }
    }
}

/// Which path last changed a synapse's weight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RuleTag {
    /// Never updated since creation.
    #[default]
    Initial,
    Associative,
    Timing,
    Reward,
    Homeostatic,
}

impl RuleTag {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            RuleTag::Initial => 0,
            RuleTag::Associative => 1,
            RuleTag::Timing => 2,
            RuleTag::Reward => 3,
            RuleTag::Homeostatic => 4,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RuleTag::Initial),
            1 => Some(RuleTag::Associative),
            2 => Some(RuleTag::Timing),
            3 => Some(RuleTag::Reward),
            4 => Some(RuleTag::Homeostatic),
            _ => None,
        }
    }
}

/// Copy of one synapse's state.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SynapseView {
    pub key: SynapseKey,
    pub weight: f32,
    pub eligibility: f32,
    pub last_update: u64,
    pub rule: RuleTag,
}

#[derive(Debug, Clone)]
pub struct SynapseStore {
    /// Source `i` owns slots `offsets[i]..offsets[i + 1]`. Length = neurons + 1.
    pub(crate) offsets: Vec<usize>,
    pub(crate) targets: Vec<NeuronId>,
    pub(crate) weights: Vec<f32>,
    pub(crate) eligibility: Vec<f32>,
    pub(crate) last_update: Vec<u64>,
    pub(crate) rule: Vec<RuleTag>,

    /// Source of every slot (derived from `offsets`).
    pub(crate) sources: Vec<NeuronId>,
    /// Incoming index: destination `d` is fed by `in_slots[in_offsets[d]..in_offsets[d + 1]]`.
    pub(crate) in_offsets: Vec<usize>,
    pub(crate) in_slots: Vec<usize>,

    live: usize,
    tombstones: usize,
}

impl Default for SynapseStore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SynapseStore {
    pub fn new(neuron_count: usize) -> Self {
        Self {
            offsets: vec![0; neuron_count + 1],
            targets: Vec::new(),
            weights: Vec::new(),
            eligibility: Vec::new(),
            last_update: Vec::new(),
            rule: Vec::new(),
            sources: Vec::new(),
            in_offsets: vec![0; neuron_count + 1],
            in_slots: Vec::new(),
            live: 0,
            tombstones: 0,
        }
    }

    /// Number of neurons the CSR rows cover.
    #[inline]
    pub fn neuron_count(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Extend the row table after new regions were created.
    pub(crate) fn grow_neurons(&mut self, neuron_count: usize) {
        if neuron_count > self.neuron_count() {
            let end = self.targets.len();
            self.offsets.resize(neuron_count + 1, end);
            let in_end = self.in_slots.len();
            self.in_offsets.resize(neuron_count + 1, in_end);
        }
    }

    /// Live synapse count (tombstones excluded).
    #[inline]
    pub fn synapse_count(&self) -> usize {
        self.live
    }

    #[inline]
    pub(crate) fn slot_count(&self) -> usize {
        self.targets.len()
    }

    #[inline]
    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    #[inline]
    pub(crate) fn row(&self, source: NeuronId) -> std::ops::Range<usize> {
        self.offsets[source]..self.offsets[source + 1]
    }

    fn check_neuron(&self, id: NeuronId) -> Result<()> {
        if id < self.neuron_count() {
            Ok(())
        } else {
            Err(SubstrateError::InvalidReference(Reference::Neuron(id)))
        }
    }

    fn find_slot(&self, source: NeuronId, destination: NeuronId) -> Option<usize> {
        if source >= self.neuron_count() {
            return None;
        }
        self.row(source)
            .find(|&idx| self.targets[idx] == destination)
    }

    #[inline]
    fn view(&self, idx: usize) -> SynapseView {
        SynapseView {
            key: SynapseKey::new(self.sources[idx], self.targets[idx]),
            weight: self.weights[idx],
            eligibility: self.eligibility[idx],
            last_update: self.last_update[idx],
            rule: self.rule[idx],
        }
    }

    pub fn contains(&self, key: SynapseKey) -> bool {
        key.destination != INVALID_NEURON && self.find_slot(key.source, key.destination).is_some()
    }

    pub fn synapse(&self, key: SynapseKey) -> Result<SynapseView> {
        if key.destination == INVALID_NEURON {
            return Err(SubstrateError::InvalidReference(Reference::Synapse {
                source: key.source,
                destination: key.destination,
            }));
        }
        self.find_slot(key.source, key.destination)
            .map(|idx| self.view(idx))
            .ok_or(SubstrateError::InvalidReference(Reference::Synapse {
                source: key.source,
                destination: key.destination,
            }))
    }

    /// Visit every live synapse leaving `source`, in slot order.
    pub fn for_each_synapse_from<F>(&self, source: NeuronId, mut visitor: F) -> Result<()>
    where
        F: FnMut(SynapseView),
    {
        self.check_neuron(source)?;
        for idx in self.row(source) {
            if self.targets[idx] != INVALID_NEURON {
                visitor(self.view(idx));
            }
        }
        Ok(())
    }

    pub fn outgoing_count(&self, source: NeuronId) -> Result<usize> {
        self.check_neuron(source)?;
        Ok(self
            .row(source)
            .filter(|&idx| self.targets[idx] != INVALID_NEURON)
            .count())
    }

    /// All live synapses, ordered by (source, slot).
    pub fn iter(&self) -> impl Iterator<Item = SynapseView> + '_ {
        (0..self.targets.len())
            .filter(move |&idx| self.targets[idx] != INVALID_NEURON)
            .map(move |idx| self.view(idx))
    }

    pub fn mean_abs_weight(&self) -> f32 {
        if self.live == 0 {
            return 0.0;
        }
        let sum: f64 = self
            .targets
            .iter()
            .zip(&self.weights)
            .filter(|(&t, _)| t != INVALID_NEURON)
            .map(|(_, &w)| w.abs() as f64)
            .sum();
        (sum / self.live as f64) as f32
    }

    /// Connect `from` to `to` at `density`, with initial weights drawn
    /// uniformly from `weights`.
    ///
    /// Pairs are sampled without replacement over the full pair space (self
    /// pairs excluded when `from` and `to` are the same region). The number of
    /// sampled pairs is `round(density * pairs)`; sampled pairs that already
    /// exist are skipped, so the returned count may be lower.
    ///
    /// On error the store is unchanged.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn connect(
        &mut self,
        from: &Region,
        to: &Region,
        density: f32,
        weights: RangeInclusive<f32>,
        w_max: f32,
        max_synapses: usize,
        now: u64,
        rng: &mut Prng,
    ) -> Result<usize> {
        if !density.is_finite() || density <= 0.0 || density > 1.0 {
            return Err(SubstrateError::config(format!(
                "density {density} must be in (0, 1]"
            )));
        }
        let (low, high) = (*weights.start(), *weights.end());
        if !low.is_finite() || !high.is_finite() || low > high {
            return Err(SubstrateError::config(format!(
                "weight range {low}..={high} is empty or non-finite"
            )));
        }
        if low < -w_max || high > w_max {
            return Err(SubstrateError::config(format!(
                "weight range {low}..={high} exceeds w_max {w_max}"
            )));
        }
        if from.neurons.end > self.neuron_count() || to.neurons.end > self.neuron_count() {
            return Err(SubstrateError::InvalidReference(Reference::Region(
                from.id.max(to.id),
            )));
        }

        let intra = from.id == to.id;
        let n_from = from.len() as u64;
        let n_to = to.len() as u64;
        let pairs = if intra {
            n_from * n_from.saturating_sub(1)
        } else {
            n_from * n_to
        };
        let wanted = (density as f64 * pairs as f64).round() as u64;
        if wanted == 0 {
            return Ok(0);
        }
        // Existing pairs only lower the final count, so this bound is safe to
        // check before sampling.
        let wanted_usize = usize::try_from(wanted).unwrap_or(usize::MAX);
        if self.live.saturating_add(wanted_usize) > max_synapses {
            return Err(SubstrateError::ResourceExhausted {
                resource: Resource::Synapses,
                limit: max_synapses,
            });
        }

        let picks = sample_without_replacement(pairs, wanted, rng);

        // Decode pair indices and drop pairs that already exist.
        let mut fresh: Vec<SynapseKey> = Vec::with_capacity(picks.len());
        for idx in picks {
            let key = if intra {
                let row = idx / (n_from - 1);
                let col = idx % (n_from - 1);
                let col = if col >= row { col + 1 } else { col };
                SynapseKey::new(
                    from.neurons.start + row as usize,
                    from.neurons.start + col as usize,
                )
            } else {
                SynapseKey::new(
                    from.neurons.start + (idx / n_to) as usize,
                    to.neurons.start + (idx % n_to) as usize,
                )
            };
            if self.find_slot(key.source, key.destination).is_none() {
                fresh.push(key);
            }
        }

        if self.live + fresh.len() > max_synapses {
            return Err(SubstrateError::ResourceExhausted {
                resource: Resource::Synapses,
                limit: max_synapses,
            });
        }

        let initial: Vec<f32> = fresh
            .iter()
            .map(|_| rng.gen_range_f32(low, high).clamp(low, high))
            .collect();

        self.insert_sorted(&fresh, &initial, now);
        Ok(fresh.len())
    }

    /// Merge `keys` (sorted by source, then destination) into the CSR arrays.
    fn insert_sorted(&mut self, keys: &[SynapseKey], weights: &[f32], now: u64) {
        let n = self.neuron_count();
        let total = self.live + keys.len();
        let mut offsets = Vec::with_capacity(n + 1);
        let mut targets = Vec::with_capacity(total);
        let mut new_weights = Vec::with_capacity(total);
        let mut eligibility = Vec::with_capacity(total);
        let mut last_update = Vec::with_capacity(total);
        let mut rule = Vec::with_capacity(total);

        let mut k = 0;
        for source in 0..n {
            offsets.push(targets.len());
            for idx in self.row(source) {
                if self.targets[idx] != INVALID_NEURON {
                    targets.push(self.targets[idx]);
                    new_weights.push(self.weights[idx]);
                    eligibility.push(self.eligibility[idx]);
                    last_update.push(self.last_update[idx]);
                    rule.push(self.rule[idx]);
                }
            }
            while k < keys.len() && keys[k].source == source {
                targets.push(keys[k].destination);
                new_weights.push(weights[k]);
                eligibility.push(0.0);
                last_update.push(now);
                rule.push(RuleTag::Initial);
                k += 1;
            }
        }
        offsets.push(targets.len());

        self.offsets = offsets;
        self.targets = targets;
        self.weights = new_weights;
        self.eligibility = eligibility;
        self.last_update = last_update;
        self.rule = rule;
        self.live = total;
        self.tombstones = 0;
        self.rebuild_index();
    }

    /// Tombstone synapses with `|w| < threshold` that have not been updated
    /// for at least `min_idle_steps` ticks. Returns the number removed.
    ///
    /// Slots are reclaimed by [`SynapseStore::compact`].
    pub(crate) fn prune_below(&mut self, threshold: f32, min_idle_steps: u64, now: u64) -> usize {
        if threshold <= 0.0 {
            return 0;
        }
        let mut removed = 0;
        for idx in 0..self.targets.len() {
            if self.targets[idx] == INVALID_NEURON {
                continue;
            }
            let idle = now.saturating_sub(self.last_update[idx]);
            if self.weights[idx].abs() < threshold && idle >= min_idle_steps {
                self.targets[idx] = INVALID_NEURON;
                self.weights[idx] = 0.0;
                self.eligibility[idx] = 0.0;
                removed += 1;
            }
        }
        self.live -= removed;
        self.tombstones += removed;
        removed
    }

    /// Drop tombstoned slots and rebuild the derived indexes.
    pub(crate) fn compact(&mut self) {
        if self.tombstones == 0 {
            return;
        }
        let n = self.neuron_count();
        let mut offsets = Vec::with_capacity(n + 1);
        let mut write = 0;
        for source in 0..n {
            offsets.push(write);
            for idx in self.row(source) {
                if self.targets[idx] != INVALID_NEURON {
                    self.targets[write] = self.targets[idx];
                    self.weights[write] = self.weights[idx];
                    self.eligibility[write] = self.eligibility[idx];
                    self.last_update[write] = self.last_update[idx];
                    self.rule[write] = self.rule[idx];
                    write += 1;
                }
            }
        }
        offsets.push(write);

        self.targets.truncate(write);
        self.weights.truncate(write);
        self.eligibility.truncate(write);
        self.last_update.truncate(write);
        self.rule.truncate(write);
        self.offsets = offsets;
        self.tombstones = 0;
        self.rebuild_index();
    }

    /// Recompute `sources` and the incoming (by destination) index.
    fn rebuild_index(&mut self) {
        let n = self.neuron_count();
        self.sources.clear();
        self.sources.resize(self.targets.len(), INVALID_NEURON);
        for source in 0..n {
            for idx in self.row(source) {
                self.sources[idx] = source;
            }
        }

        // Counting sort by destination keeps slots in ascending order per row.
        let mut counts = vec![0usize; n + 1];
        for &t in &self.targets {
            if t != INVALID_NEURON {
                counts[t + 1] += 1;
            }
        }
        for i in 0..n {
            counts[i + 1] += counts[i];
        }
        self.in_offsets = counts.clone();
        let mut cursor = counts;
        self.in_slots = vec![0; self.in_offsets[n]];
        for (idx, &t) in self.targets.iter().enumerate() {
            if t != INVALID_NEURON {
                self.in_slots[cursor[t]] = idx;
                cursor[t] += 1;
            }
        }
    }

    /// Rebuild a store from checkpointed synapses.
    ///
    /// `synapses` must be sorted by key, free of duplicates, and reference
    /// only neurons below `neuron_count`.
    pub(crate) fn from_sorted(neuron_count: usize, synapses: &[SynapseView]) -> Self {
        let mut store = Self::new(neuron_count);
        let mut k = 0;
        let mut offsets = Vec::with_capacity(neuron_count + 1);
        for source in 0..neuron_count {
            offsets.push(store.targets.len());
            while k < synapses.len() && synapses[k].key.source == source {
                let s = &synapses[k];
                store.targets.push(s.key.destination);
                store.weights.push(s.weight);
                store.eligibility.push(s.eligibility);
                store.last_update.push(s.last_update);
                store.rule.push(s.rule);
                k += 1;
            }
        }
        offsets.push(store.targets.len());
        store.offsets = offsets;
        store.live = store.targets.len();
        store.rebuild_index();
        store
    }
}

/// Sample `k` distinct values from `[0, n)` (Floyd's algorithm), returned sorted.
///
/// Draw order depends only on `rng`, so the result is reproducible for a given
/// seed.
pub(crate) fn sample_without_replacement(n: u64, k: u64, rng: &mut Prng) -> Vec<u64> {
    let k = k.min(n);
    let mut seen: HashSet<u64> = HashSet::with_capacity(k as usize);
    let mut out = Vec::with_capacity(k as usize);
    for j in (n - k)..n {
        let t = rng.gen_below_u64(j + 1);
        let pick = if seen.contains(&t) { j } else { t };
        seen.insert(pick);
        out.push(pick);
    }
    out.sort_unstable();
    out
}
