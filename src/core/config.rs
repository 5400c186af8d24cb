#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Spike-timing window parameters.
///
/// `a_minus` is negative and smaller in magnitude than `a_plus`, so causal
/// (pre-before-post) ordering wins on balance.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TimingConfig {
    pub a_plus: f32,
    pub a_minus: f32,
    /// Potentiation time constant, in ticks.
    pub tau_plus: f32,
    /// Depression time constant, in ticks.
    pub tau_minus: f32,
    /// Spike pairs further apart than this many ticks contribute nothing.
    pub window: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            a_plus: 0.010,
            a_minus: -0.008,
            tau_plus: 20.0,
            tau_minus: 15.0,
            window: 60,
        }
    }
}

/// Relative weighting of the two non-reward rules.
///
/// The defaults follow the documented 75:25 associative/timing split; they are
/// a starting point, not a contract.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RuleBlend {
    pub associative: f32,
    pub timing: f32,
}

impl Default for RuleBlend {
    fn default() -> Self {
        Self {
            associative: 0.75,
            timing: 0.25,
        }
    }
}

/// Per-rule switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RuleSet {
    pub associative: bool,
    pub timing: bool,
    pub reward: bool,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            associative: true,
            timing: true,
            reward: true,
        }
    }
}

impl RuleSet {
    pub fn associative_only() -> Self {
        Self {
            associative: true,
            timing: false,
            reward: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LearningConfig {
    /// Associative (Hebbian) rate.
    pub associative_rate: f32,
    pub timing: TimingConfig,

    /// Eligibility decay per tick (λ), in [0, 1].
    pub eligibility_decay: f32,
    /// Eligibility accumulation rate (η).
    pub eligibility_rate: f32,
    /// Reward scale (κ). May be negative to invert reward polarity.
    pub reward_scale: f32,
    /// Weight on the novelty component of a reward (α).
    pub novelty_weight: f32,
    /// Weight on the task component of a reward (γ).
    pub task_weight: f32,

    /// Symmetric bound on any single applied weight delta.
    pub clip_bound: f32,
    /// Symmetric bound on any weight.
    pub w_max: f32,

    /// Both endpoints must exceed this for the associative rule to fire.
    pub coactive_threshold: f32,

    pub blend: RuleBlend,
    pub rules: RuleSet,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            associative_rate: 0.01,
            timing: TimingConfig::default(),
            eligibility_decay: 0.95,
            eligibility_rate: 0.1,
            reward_scale: 0.5,
            novelty_weight: 0.3,
            task_weight: 0.7,
            clip_bound: 0.05,
            w_max: 1.0,
            coactive_threshold: 0.1,
            blend: RuleBlend::default(),
            rules: RuleSet::default(),
        }
    }
}

impl LearningConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.associative_rate.is_finite()
            || self.associative_rate < 0.0
            || self.associative_rate > 1.0
        {
            return Err("associative_rate must be in [0, 1]");
        }

        let t = &self.timing;
        if !t.a_plus.is_finite() || t.a_plus <= 0.0 {
            return Err("timing.a_plus must be finite and > 0");
        }
        if !t.a_minus.is_finite() || t.a_minus >= 0.0 {
            return Err("timing.a_minus must be finite and < 0");
        }
        if t.a_minus.abs() >= t.a_plus {
            return Err("timing.a_minus must be smaller in magnitude than a_plus");
        }
        if !t.tau_plus.is_finite() || t.tau_plus <= 0.0 {
            return Err("timing.tau_plus must be finite and > 0");
        }
        if !t.tau_minus.is_finite() || t.tau_minus <= 0.0 {
            return Err("timing.tau_minus must be finite and > 0");
        }

        if !(0.0..=1.0).contains(&self.eligibility_decay) {
            return Err("eligibility_decay must be in [0, 1]");
        }
        if !self.eligibility_rate.is_finite() || self.eligibility_rate < 0.0 {
            return Err("eligibility_rate must be finite and >= 0");
        }
        if !self.reward_scale.is_finite() {
            return Err("reward_scale must be finite");
        }
        if !self.novelty_weight.is_finite() || self.novelty_weight < 0.0 {
            return Err("novelty_weight must be finite and >= 0");
        }
        if !self.task_weight.is_finite() || self.task_weight < 0.0 {
            return Err("task_weight must be finite and >= 0");
        }

        if !self.w_max.is_finite() || self.w_max <= 0.0 {
            return Err("w_max must be finite and > 0");
        }
        if !self.clip_bound.is_finite() || self.clip_bound <= 0.0 {
            return Err("clip_bound must be finite and > 0");
        }
        if self.clip_bound > self.w_max {
            return Err("clip_bound must be <= w_max");
        }
        if !self.coactive_threshold.is_finite() || self.coactive_threshold < 0.0 {
            return Err("coactive_threshold must be finite and >= 0");
        }

        if !self.blend.associative.is_finite() || self.blend.associative < 0.0 {
            return Err("blend.associative must be finite and >= 0");
        }
        if !self.blend.timing.is_finite() || self.blend.timing < 0.0 {
            return Err("blend.timing must be finite and >= 0");
        }
        Ok(())
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_blend(mut self, associative: f32, timing: f32) -> Self {
        self.blend = RuleBlend {
            associative,
            timing,
        };
        self
    }
}

/// Consolidation-phase pruning.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PruneConfig {
    /// Synapses with `|w|` below this are candidates. 0 disables pruning.
    pub threshold: f32,
    /// ...and must not have been updated for this many ticks.
    pub min_idle_steps: u64,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            threshold: 0.001,
            min_idle_steps: 1_000,
        }
    }
}

/// Slow outgoing-weight rescaling for neurons whose mean activation drifts.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct HomeostasisConfig {
    pub enabled: bool,
    pub target_low: f32,
    pub target_high: f32,
    /// Largest relative rescale applied in one consolidation pass, in (0, 1).
    pub max_scale_step: f32,
}

impl Default for HomeostasisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_low: 0.02,
            target_high: 0.6,
            max_scale_step: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SubstrateConfig {
    pub max_regions: usize,
    pub max_neurons: usize,
    pub max_region_capacity: usize,
    pub max_synapses: usize,

    /// Leaky-integration rate toward the propagated target activation, in (0, 1].
    pub activation_rate: f32,
    /// EMA rate of the per-neuron activity trace used by homeostasis, in [0, 1].
    pub activity_trace_rate: f32,
    /// Uniform noise amplitude added to propagated activations. 0 disables.
    pub activation_noise: f32,
    /// Firing threshold given to newly created neurons.
    pub default_threshold: f32,

    /// Run consolidation every N ticks.
    pub consolidate_every: u64,
    /// Emit a telemetry record every N ticks. 0 disables.
    pub telemetry_every: u64,
    /// Wall-clock budget for one tick. Overruns are recorded, never aborted.
    pub tick_budget_ms: u32,

    pub input_buffer_capacity: usize,
    pub reward_buffer_capacity: usize,

    pub prune: PruneConfig,
    pub homeostasis: HomeostasisConfig,

    // If set, makes behavior reproducible.
    pub seed: Option<u64>,

    pub learning: LearningConfig,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            max_regions: 256,
            max_neurons: 1 << 20,
            max_region_capacity: 1 << 18,
            max_synapses: 1 << 24,
            activation_rate: 0.5,
            activity_trace_rate: 0.01,
            activation_noise: 0.0,
            default_threshold: 0.2,
            consolidate_every: 100,
            telemetry_every: 50,
            tick_budget_ms: 20,
            input_buffer_capacity: 64,
            reward_buffer_capacity: 64,
            prune: PruneConfig::default(),
            homeostasis: HomeostasisConfig::default(),
            seed: None,
            learning: LearningConfig::default(),
        }
    }
}

impl SubstrateConfig {
    /// Hard ceilings independent of configuration (ids are stored as u32 on disk).
    pub const MAX_NEURONS_CEILING: usize = u32::MAX as usize;
    pub const MAX_SYNAPSES_CEILING: usize = u32::MAX as usize;

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_regions == 0 {
            return Err("max_regions must be >= 1");
        }
        if self.max_neurons == 0 || self.max_neurons > Self::MAX_NEURONS_CEILING {
            return Err("max_neurons must be in [1, u32::MAX]");
        }
        if self.max_region_capacity == 0 || self.max_region_capacity > self.max_neurons {
            return Err("max_region_capacity must be in [1, max_neurons]");
        }
        if self.max_synapses > Self::MAX_SYNAPSES_CEILING {
            return Err("max_synapses must be <= u32::MAX");
        }
        if !self.activation_rate.is_finite()
            || self.activation_rate <= 0.0
            || self.activation_rate > 1.0
        {
            return Err("activation_rate must be in (0, 1]");
        }
        if !(0.0..=1.0).contains(&self.activity_trace_rate) {
            return Err("activity_trace_rate must be in [0, 1]");
        }
        if !self.activation_noise.is_finite() || self.activation_noise < 0.0 {
            return Err("activation_noise must be finite and >= 0");
        }
        if !self.default_threshold.is_finite() || self.default_threshold < 0.0 {
            return Err("default_threshold must be finite and >= 0");
        }
        if self.consolidate_every == 0 {
            return Err("consolidate_every must be >= 1");
        }
        if self.input_buffer_capacity == 0 {
            return Err("input_buffer_capacity must be >= 1");
        }
        if self.reward_buffer_capacity == 0 {
            return Err("reward_buffer_capacity must be >= 1");
        }
        if !self.prune.threshold.is_finite() || self.prune.threshold < 0.0 {
            return Err("prune.threshold must be finite and >= 0");
        }
        let h = &self.homeostasis;
        if !h.target_low.is_finite() || !h.target_high.is_finite() || h.target_low < 0.0 {
            return Err("homeostasis targets must be finite and >= 0");
        }
        if h.target_low >= h.target_high {
            return Err("homeostasis.target_low must be < target_high");
        }
        if !h.max_scale_step.is_finite() || h.max_scale_step <= 0.0 || h.max_scale_step >= 1.0 {
            return Err("homeostasis.max_scale_step must be in (0, 1)");
        }
        self.learning.validate()
    }

    /// Set the random seed for reproducibility.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_learning(mut self, learning: LearningConfig) -> Self {
        self.learning = learning;
        self
    }

    pub fn with_consolidate_every(mut self, ticks: u64) -> Self {
        self.consolidate_every = ticks;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.input_buffer_capacity = capacity;
        self.reward_buffer_capacity = capacity;
        self
    }
}
