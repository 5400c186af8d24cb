//! Per-tick weight updates.
//!
//! Three rules read the same post-propagation activations and write the same
//! weight field:
//!
//! - associative: `rate * pre * post` for co-active pairs,
//! - timing: a spike-timing window over the last spike of each endpoint,
//! - reward: `κ * E * Σ(α * novelty + γ * task)` on ticks that carry reward,
//!   where `E` is the eligibility trace `E ← λE + η * pre * post`.
//!
//! The blended sum is clipped to `±clip_bound`, then the weight to `±w_max`.
//! Every synapse is evaluated independently from read-only inputs, so the
//! `parallel` feature only changes how outcomes are computed; they are always
//! applied in slot order, which keeps results identical to the scalar path.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::{HomeostasisConfig, LearningConfig, TimingConfig};
use crate::region::NeuronId;
use crate::synapse::{RuleTag, SynapseKey, SynapseStore, INVALID_NEURON};

/// An external reward event. Both components are in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RewardSignal {
    pub novelty: f32,
    pub task_reward: f32,
    pub timestamp: u64,
}

/// Summary of one plasticity pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PlasticityStats {
    /// Synapses whose weight actually changed.
    pub updated: usize,
    pub potentiated: usize,
    pub depressed: usize,
    /// Updates whose blended delta exceeded `clip_bound`.
    pub clipped: usize,
    /// Updates discarded because a non-finite value appeared.
    pub flagged: usize,
    pub delta_sum: f64,
    pub delta_l1: f64,
}

impl PlasticityStats {
    pub fn mean_delta(&self) -> f32 {
        if self.updated == 0 {
            0.0
        } else {
            (self.delta_sum / self.updated as f64) as f32
        }
    }
}

/// Read-only per-tick inputs to the rules.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TickSignals<'a> {
    pub activation: &'a [f32],
    pub last_spike: &'a [Option<u64>],
    pub now: u64,
    /// Combined `Σ(α * novelty + γ * task)` for the rewards drained this tick.
    pub reward: Option<f32>,
}

/// Combine drained reward events into a single modulatory drive.
///
/// Returns `None` when no reward arrived this tick.
pub fn reward_drive(cfg: &LearningConfig, rewards: &[RewardSignal]) -> Option<f32> {
    if rewards.is_empty() {
        return None;
    }
    Some(
        rewards
            .iter()
            .map(|r| cfg.novelty_weight * r.novelty + cfg.task_weight * r.task_reward)
            .sum(),
    )
}

/// Timing-window contribution for `dt = t_post - t_pre` ticks.
pub fn timing_delta(cfg: &TimingConfig, dt: i64) -> f32 {
    if dt == 0 || dt.unsigned_abs() > cfg.window as u64 {
        return 0.0;
    }
    let dt = dt as f32;
    if dt > 0.0 {
        cfg.a_plus * (-dt / cfg.tau_plus).exp()
    } else {
        cfg.a_minus * (dt / cfg.tau_minus).exp()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Outcome {
    /// Tombstoned slot.
    Skip,
    Update {
        weight: f32,
        eligibility: f32,
        /// Change the weight actually receives after both clamps.
        delta: f32,
        rule: RuleTag,
        clipped: bool,
    },
    Flagged,
}

#[inline]
fn evaluate(
    cfg: &LearningConfig,
    signals: &TickSignals<'_>,
    source: NeuronId,
    target: NeuronId,
    weight: f32,
    eligibility: f32,
) -> Outcome {
    if target == INVALID_NEURON {
        return Outcome::Skip;
    }
    let pre = signals.activation[source];
    let post = signals.activation[target];
    let coincidence = pre * post;

    let assoc = if cfg.rules.associative
        && pre > cfg.coactive_threshold
        && post > cfg.coactive_threshold
    {
        cfg.blend.associative * cfg.associative_rate * coincidence
    } else {
        0.0
    };

    let timing = if cfg.rules.timing {
        match (signals.last_spike[source], signals.last_spike[target]) {
            (Some(t_pre), Some(t_post)) if t_pre == signals.now || t_post == signals.now => {
                cfg.blend.timing * timing_delta(&cfg.timing, t_post as i64 - t_pre as i64)
            }
            _ => 0.0,
        }
    } else {
        0.0
    };

    let next_eligibility = cfg.eligibility_decay * eligibility + cfg.eligibility_rate * coincidence;

    let reward = match signals.reward {
        Some(drive) if cfg.rules.reward => cfg.reward_scale * next_eligibility * drive,
        _ => 0.0,
    };

    let total = assoc + timing + reward;
    if !total.is_finite() || !next_eligibility.is_finite() {
        return Outcome::Flagged;
    }

    let clip = cfg.clip_bound;
    let applied = total.clamp(-clip, clip);
    let next_weight = (weight + applied).clamp(-cfg.w_max, cfg.w_max);
    if !next_weight.is_finite() {
        return Outcome::Flagged;
    }

    let (a, t, r) = (assoc.abs(), timing.abs(), reward.abs());
    let rule = if r >= a && r >= t && r > 0.0 {
        RuleTag::Reward
    } else if t > a {
        RuleTag::Timing
    } else {
        RuleTag::Associative
    };

    Outcome::Update {
        weight: next_weight,
        eligibility: next_eligibility,
        delta: next_weight - weight,
        rule,
        clipped: total.abs() > clip,
    }
}

/// Run one plasticity pass over every live synapse.
///
/// Keys of synapses whose update was discarded are appended to `flagged`.
pub(crate) fn apply(
    store: &mut SynapseStore,
    cfg: &LearningConfig,
    signals: &TickSignals<'_>,
    flagged: &mut Vec<SynapseKey>,
) -> PlasticityStats {
    let outcomes = evaluate_all(store, cfg, signals);

    let mut stats = PlasticityStats::default();
    for (idx, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Outcome::Skip => {}
            Outcome::Flagged => {
                stats.flagged += 1;
                flagged.push(SynapseKey::new(store.sources[idx], store.targets[idx]));
            }
            Outcome::Update {
                weight,
                eligibility,
                delta,
                rule,
                clipped,
            } => {
                store.eligibility[idx] = eligibility;
                // A saturated weight receives nothing and keeps its bookkeeping.
                if delta == 0.0 {
                    continue;
                }
                store.weights[idx] = weight;
                store.last_update[idx] = signals.now;
                store.rule[idx] = rule;

                stats.updated += 1;
                if delta > 0.0 {
                    stats.potentiated += 1;
                } else {
                    stats.depressed += 1;
                }
                if clipped {
                    stats.clipped += 1;
                }
                stats.delta_sum += delta as f64;
                stats.delta_l1 += delta.abs() as f64;
            }
        }
    }
    stats
}

#[cfg(not(feature = "parallel"))]
fn evaluate_all(
    store: &SynapseStore,
    cfg: &LearningConfig,
    signals: &TickSignals<'_>,
) -> Vec<Outcome> {
    (0..store.slot_count())
        .map(|idx| {
            evaluate(
                cfg,
                signals,
                store.sources[idx],
                store.targets[idx],
                store.weights[idx],
                store.eligibility[idx],
            )
        })
        .collect()
}

#[cfg(feature = "parallel")]
fn evaluate_all(
    store: &SynapseStore,
    cfg: &LearningConfig,
    signals: &TickSignals<'_>,
) -> Vec<Outcome> {
    (0..store.slot_count())
        .into_par_iter()
        .map(|idx| {
            evaluate(
                cfg,
                signals,
                store.sources[idx],
                store.targets[idx],
                store.weights[idx],
                store.eligibility[idx],
            )
        })
        .collect()
}

/// Rescale outgoing weights of neurons whose activity trace left the target
/// band. Returns the number of neurons rescaled.
pub(crate) fn homeostasis(
    store: &mut SynapseStore,
    activity_trace: &[f32],
    cfg: &HomeostasisConfig,
    w_max: f32,
    now: u64,
) -> usize {
    if !cfg.enabled {
        return 0;
    }
    let lo = 1.0 - cfg.max_scale_step;
    let hi = 1.0 + cfg.max_scale_step;

    let mut rescaled = 0;
    for (neuron, &trace) in activity_trace.iter().enumerate() {
        let scale = if trace > cfg.target_high {
            cfg.target_high / trace
        } else if trace < cfg.target_low {
            if trace <= 0.0 {
                hi
            } else {
                cfg.target_low / trace
            }
        } else {
            continue;
        };
        let scale = scale.clamp(lo, hi);

        let mut touched = false;
        for idx in store.row(neuron) {
            if store.targets[idx] == INVALID_NEURON {
                continue;
            }
            let w = (store.weights[idx] * scale).clamp(-w_max, w_max);
            if w != store.weights[idx] {
                store.weights[idx] = w;
                store.last_update[idx] = now;
                store.rule[idx] = RuleTag::Homeostatic;
                touched = true;
            }
        }
        if touched {
            rescaled += 1;
        }
    }
    rescaled
}

/// Zero eligibility traces too small to matter. Returns the number cleared.
pub(crate) fn settle_eligibility(store: &mut SynapseStore) -> usize {
    let mut cleared = 0;
    for e in store.eligibility.iter_mut() {
        if *e != 0.0 && e.abs() < 1e-12 {
            *e = 0.0;
            cleared += 1;
        }
    }
    cleared
}
