//! Outbound learning telemetry.
//!
//! Records are emitted by the [`crate::scheduler::Scheduler`] every
//! `telemetry_every` ticks. A failing sink is logged and otherwise ignored;
//! telemetry never stops the substrate.

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::substrate::{Substrate, TickReport};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TelemetryRecord {
    pub tick: u64,
    pub active_synapses: usize,
    /// Mean applied weight delta over updated synapses in the reported tick.
    pub mean_weight_delta: f32,
    pub potentiated: usize,
    pub depressed: usize,
    /// Updates discarded as non-finite in the reported tick.
    pub flagged: usize,
    /// Cumulative budget overruns.
    pub overruns: u64,
    /// Cumulative inputs dropped from full buffers.
    pub dropped_inputs: u64,
}

impl TelemetryRecord {
    pub fn from_tick(substrate: &Substrate, report: &TickReport) -> Self {
        Self {
            tick: report.tick,
            active_synapses: substrate.synapse_count(),
            mean_weight_delta: report.plasticity.mean_delta(),
            potentiated: report.plasticity.potentiated,
            depressed: report.plasticity.depressed,
            flagged: report.plasticity.flagged,
            overruns: substrate.overruns(),
            dropped_inputs: substrate.dropped_inputs(),
        }
    }
}

pub trait TelemetrySink: Send {
    fn emit(&mut self, record: &TelemetryRecord) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One JSON object per line.
#[cfg(feature = "serde")]
pub struct JsonLinesSink<W: Write + Send> {
    out: W,
}

#[cfg(feature = "serde")]
impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(feature = "serde")]
impl<W: Write + Send> TelemetrySink for JsonLinesSink<W> {
    fn emit(&mut self, record: &TelemetryRecord) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Keeps records in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<TelemetryRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&mut self, record: &TelemetryRecord) -> io::Result<()> {
        self.records.lock().push(*record);
        Ok(())
    }
}
