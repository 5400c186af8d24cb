//! # neurite
//!
//! A long-running learning substrate: a sparse graph of neurons grouped into
//! regions, joined by synapses whose weights evolve under associative,
//! spike-timing and reward-modulated (eligibility trace) plasticity.
//!
//! ## Quick Start
//!
//! ```
//! use neurite::prelude::*;
//!
//! let cfg = SubstrateConfig::default().with_seed(42);
//! let mut substrate = Substrate::new(cfg).unwrap();
//!
//! let vision = substrate.create_region("vision", RegionKind::Sensory, 64).unwrap();
//! let assoc = substrate.create_region("assoc", RegionKind::Associative, 128).unwrap();
//! substrate.connect(vision, assoc, 0.05, 0.1..=0.9).unwrap();
//! substrate.seal().unwrap();
//!
//! let scheduler = Scheduler::new(substrate).unwrap();
//! let sensory = SensoryInput::new(&scheduler);
//! sensory.push(vision, vec![1.0; 64], 0).unwrap();
//! RewardInput::new(&scheduler).push(0.2, 1.0, 0).unwrap();
//!
//! let report = scheduler.tick().unwrap();
//! assert_eq!(report.tick, 1);
//!
//! let snapshot = ActivationReader::new(&scheduler).snapshot(assoc).unwrap();
//! assert_eq!(snapshot.values.len(), 128);
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): serialization of configs, snapshots and telemetry
//!   records, plus the JSON-lines telemetry sink
//! - `parallel`: multi-threaded propagation and plasticity via rayon
//!
//! ## Modules
//!
//! - [`substrate`]: regions, synapses and the tick
//! - [`plasticity`]: the learning rules
//! - [`scheduler`]: phase lock, input buffers and the tick loop
//! - [`checkpoint`]: versioned save/load
//! - [`boundary`]: producer and reader handles

#[path = "core/error.rs"]
pub mod error;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/region.rs"]
pub mod region;

#[path = "core/synapse.rs"]
pub mod synapse;

#[path = "core/plasticity.rs"]
pub mod plasticity;

#[path = "core/substrate.rs"]
pub mod substrate;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/checkpoint.rs"]
pub mod checkpoint;

#[path = "core/telemetry.rs"]
pub mod telemetry;

#[path = "core/scheduler.rs"]
pub mod scheduler;

pub mod boundary;

/// Prelude module for convenient imports.
///
/// ```
/// use neurite::prelude::*;
/// ```
pub mod prelude {
    pub use crate::boundary::{
        ActivationReader, ActivationSnapshot, RewardInput, SensoryInput, SubstrateAdapter,
        SubstrateSnapshot,
    };
    pub use crate::config::{
        HomeostasisConfig, LearningConfig, PruneConfig, RuleBlend, RuleSet, SubstrateConfig,
        TimingConfig,
    };
    pub use crate::error::SubstrateError;
    pub use crate::plasticity::{PlasticityStats, RewardSignal};
    pub use crate::region::{NeuronId, RegionId, RegionKind, UpdatePattern};
    pub use crate::scheduler::Scheduler;
    pub use crate::substrate::{Diagnostics, Phase, Substrate, TickInput, TickReport};
    pub use crate::synapse::{RuleTag, SynapseKey, SynapseView};
    #[cfg(feature = "serde")]
    pub use crate::telemetry::JsonLinesSink;
    pub use crate::telemetry::{MemorySink, TelemetryRecord, TelemetrySink};
}
