//! Runtime handle that drives a sealed substrate.
//!
//! The substrate sits behind a single phase lock. A tick holds the write lock
//! from the first propagated neuron to the last weight update, so readers
//! always observe whole ticks. Producers never touch the lock: they push into
//! bounded per-channel buffers (one per region plus one for rewards) that the
//! tick drains before stepping. A full buffer drops its oldest entry.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{Reference, Result, SubstrateError};
use crate::plasticity::RewardSignal;
use crate::region::RegionId;
use crate::substrate::{Phase, SensoryFrame, Substrate, TickInput, TickReport};
use crate::telemetry::{TelemetryRecord, TelemetrySink};

struct PeriodicCheckpoint {
    path: PathBuf,
    every: u64,
}

struct Shared {
    substrate: RwLock<Substrate>,
    sensory: Vec<Mutex<VecDeque<SensoryFrame>>>,
    rewards: Mutex<VecDeque<RewardSignal>>,
    input_capacity: usize,
    reward_capacity: usize,
    dropped: AtomicU64,
    telemetry: Mutex<Option<Box<dyn TelemetrySink>>>,
    checkpoint: Mutex<Option<PeriodicCheckpoint>>,
}

/// Cloneable handle; clones drive the same substrate.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

/// Push onto a bounded buffer, dropping the oldest entry when full.
/// Returns true if an entry was dropped.
fn push_bounded<T>(queue: &Mutex<VecDeque<T>>, capacity: usize, item: T) -> bool {
    let mut q = queue.lock();
    let dropped = if q.len() >= capacity {
        q.pop_front();
        true
    } else {
        false
    };
    q.push_back(item);
    dropped
}

impl Scheduler {
    /// Take ownership of a sealed substrate.
    pub fn new(substrate: Substrate) -> Result<Self> {
        if substrate.phase() != Phase::Idle {
            return Err(SubstrateError::config(
                "the scheduler requires a sealed, idle substrate",
            ));
        }
        let cfg = *substrate.config();
        let sensory = (0..substrate.regions().len())
            .map(|_| Mutex::new(VecDeque::with_capacity(cfg.input_buffer_capacity)))
            .collect();
        Ok(Self {
            shared: Arc::new(Shared {
                substrate: RwLock::new(substrate),
                sensory,
                rewards: Mutex::new(VecDeque::with_capacity(cfg.reward_buffer_capacity)),
                input_capacity: cfg.input_buffer_capacity,
                reward_capacity: cfg.reward_buffer_capacity,
                dropped: AtomicU64::new(0),
                telemetry: Mutex::new(None),
                checkpoint: Mutex::new(None),
            }),
        })
    }

    /// Emit a [`TelemetryRecord`] every `telemetry_every` ticks.
    pub fn with_telemetry(self, sink: impl TelemetrySink + 'static) -> Self {
        *self.shared.telemetry.lock() = Some(Box::new(sink));
        self
    }

    /// Save a checkpoint to `path` every `every` ticks. 0 disables.
    pub fn with_checkpoint(self, path: impl Into<PathBuf>, every: u64) -> Self {
        *self.shared.checkpoint.lock() = (every > 0).then(|| PeriodicCheckpoint {
            path: path.into(),
            every,
        });
        self
    }

    // =========================================================================
    // Producers
    // =========================================================================

    pub fn push_sensory(&self, region: RegionId, features: Vec<f32>, timestamp: u64) -> Result<()> {
        let queue = self
            .shared
            .sensory
            .get(region)
            .ok_or(SubstrateError::InvalidReference(Reference::Region(region)))?;
        if let Some(bad) = features.iter().find(|v| !v.is_finite()) {
            return Err(SubstrateError::NumericInstability(format!(
                "non-finite feature {bad} for region #{region}"
            )));
        }
        let frame = SensoryFrame {
            region,
            features,
            timestamp,
        };
        if push_bounded(queue, self.shared.input_capacity, frame) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Queue a reward. Components are clamped to `[0, 1]`.
    pub fn push_reward(&self, novelty: f32, task_reward: f32, timestamp: u64) -> Result<()> {
        if !novelty.is_finite() || !task_reward.is_finite() {
            return Err(SubstrateError::NumericInstability(
                "non-finite reward component".to_string(),
            ));
        }
        let signal = RewardSignal {
            novelty: novelty.clamp(0.0, 1.0),
            task_reward: task_reward.clamp(0.0, 1.0),
            timestamp,
        };
        if push_bounded(&self.shared.rewards, self.shared.reward_capacity, signal) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Inputs dropped from full buffers since start.
    pub fn dropped_inputs(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Inputs waiting for the next tick.
    pub fn pending_inputs(&self) -> usize {
        let frames: usize = self.shared.sensory.iter().map(|q| q.lock().len()).sum();
        frames + self.shared.rewards.lock().len()
    }

    // =========================================================================
    // Ticks
    // =========================================================================

    fn drain(&self) -> TickInput {
        let mut input = TickInput::default();
        for queue in &self.shared.sensory {
            input.frames.extend(queue.lock().drain(..));
        }
        input.rewards.extend(self.shared.rewards.lock().drain(..));
        input
    }

    /// Put input back at the front of its buffers after a failed tick.
    /// Entries beyond capacity are dropped oldest first.
    fn restore(&self, input: TickInput) {
        let mut dropped = 0u64;
        for frame in input.frames.into_iter().rev() {
            if let Some(queue) = self.shared.sensory.get(frame.region) {
                let mut q = queue.lock();
                q.push_front(frame);
                while q.len() > self.shared.input_capacity {
                    q.pop_front();
                    dropped += 1;
                }
            }
        }
        let mut q = self.shared.rewards.lock();
        for signal in input.rewards.into_iter().rev() {
            q.push_front(signal);
        }
        while q.len() > self.shared.reward_capacity {
            q.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            self.shared.dropped.fetch_add(dropped, Ordering::Relaxed);
        }
    }

    /// Drain buffered input and run one tick under the write lock.
    ///
    /// Input is only drained once the substrate is known to be idle, and is
    /// returned to the buffers if the step fails.
    pub fn tick(&self) -> Result<TickReport> {
        let (report, record, budget_ms) = {
            let mut substrate = self.shared.substrate.write();
            if substrate.phase() != Phase::Idle {
                return Err(SubstrateError::config(format!(
                    "tick is not allowed while {:?}",
                    substrate.phase()
                )));
            }
            let input = self.drain();
            substrate.record_dropped_inputs(self.dropped_inputs());
            let report = match substrate.step(&input) {
                Ok(report) => report,
                Err(e) => {
                    self.restore(input);
                    return Err(e);
                }
            };
            let every = substrate.config().telemetry_every;
            let record = (every > 0 && report.tick % every == 0)
                .then(|| TelemetryRecord::from_tick(&substrate, &report));
            (report, record, substrate.config().tick_budget_ms)
        };

        if report.overrun {
            warn!(
                tick = report.tick,
                elapsed_ms = report.elapsed.as_secs_f64() * 1000.0,
                budget_ms,
                "tick overran its budget"
            );
        }
        if let Some(c) = &report.consolidation {
            debug!(
                tick = report.tick,
                pruned = c.pruned,
                rescaled = c.rescaled_neurons,
                "consolidated"
            );
        }
        if report.plasticity.flagged > 0 {
            warn!(
                tick = report.tick,
                flagged = report.plasticity.flagged,
                "discarded non-finite weight updates"
            );
        }
        if let Some(record) = record {
            self.emit(&record);
        }
        self.periodic_checkpoint(report.tick);
        Ok(report)
    }

    fn emit(&self, record: &TelemetryRecord) {
        let mut guard = self.shared.telemetry.lock();
        if let Some(sink) = guard.as_mut() {
            if let Err(e) = sink.emit(record).and_then(|_| sink.flush()) {
                warn!(tick = record.tick, error = %e, "telemetry emission failed");
            }
        }
    }

    fn periodic_checkpoint(&self, tick: u64) {
        let path = {
            let guard = self.shared.checkpoint.lock();
            match guard.as_ref() {
                Some(p) if tick % p.every == 0 => p.path.clone(),
                _ => return,
            }
        };
        // Failure is already logged by `save`; the loop keeps running.
        let _ = self.checkpoint(&path);
    }

    /// Save a checkpoint under the write lock.
    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        self.shared.substrate.write().save(path)
    }

    /// Run `f` against a consistent view of the substrate. Holding the view
    /// delays the next tick.
    pub fn read<R>(&self, f: impl FnOnce(&Substrate) -> R) -> R {
        f(&self.shared.substrate.read())
    }

    /// Tick every `period` until `stop` is set.
    ///
    /// A tick that overruns the period starts the next one immediately; the
    /// lost time is not made up.
    pub fn run(&self, stop: &AtomicBool, period: Duration) -> Result<()> {
        info!(period_ms = period.as_millis() as u64, "tick loop started");
        while !stop.load(Ordering::Acquire) {
            let started = Instant::now();
            if let Err(e) = self.tick() {
                error!(error = %e, "tick failed");
                return Err(e);
            }
            if let Some(rest) = period.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
        info!(tick = self.read(|s| s.tick()), "tick loop stopped");
        Ok(())
    }
}
