//! Versioned checkpoint images.
//!
//! Layout: `MAGIC | version u32 | chunk*`, where each chunk is
//! `tag[4] | len u32 | uncompressed_len u32 | lz4 payload` (see
//! [`crate::storage`]). Chunks:
//!
//! - `CONF`: substrate and learning configuration
//! - `PRNG`: seed and generator state
//! - `STAT`: tick counter
//! - `REGN`: region table
//! - `NEUR`: neuron table
//! - `SYNP`: synapse table
//!
//! Unknown chunks are skipped. Loading validates everything before building
//! a substrate, so a corrupt image never yields a partially populated one.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::{
    HomeostasisConfig, LearningConfig, PruneConfig, RuleBlend, RuleSet, SubstrateConfig,
    TimingConfig,
};
use crate::error::{Result, SubstrateError};
use crate::prng::Prng;
use crate::region::{Neuron, NeuronStore, Region, RegionKind, UpdatePattern};
use crate::storage::{self, CountingWriter};
use crate::substrate::{Phase, Substrate};
use crate::synapse::{RuleTag, SynapseKey, SynapseStore, SynapseView};

pub const TAG_CONF: [u8; 4] = *b"CONF";
pub const TAG_PRNG: [u8; 4] = *b"PRNG";
pub const TAG_STAT: [u8; 4] = *b"STAT";
pub const TAG_REGN: [u8; 4] = *b"REGN";
pub const TAG_NEUR: [u8; 4] = *b"NEUR";
pub const TAG_SYNP: [u8; 4] = *b"SYNP";

type Chunk = ([u8; 4], Vec<u8>);

impl Substrate {
    /// Write a checkpoint to `path`.
    ///
    /// The image is written to a sibling temporary file, synced, and renamed
    /// over `path`; on any failure the temporary file is removed and an
    /// existing checkpoint at `path` is left as it was.
    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if self.phase != Phase::Idle {
            return Err(SubstrateError::config(format!(
                "checkpoint requires an idle substrate (phase {:?})",
                self.phase
            )));
        }
        self.set_phase(Phase::Checkpointing);
        let result = write_atomic(path, |w| self.save_to(w));
        self.set_phase(Phase::Idle);

        match &result {
            Ok(()) => info!(path = %path.display(), tick = self.tick, "checkpoint saved"),
            Err(e) => warn!(path = %path.display(), error = %e, "checkpoint failed"),
        }
        result
    }

    /// Serialize a checkpoint image to `w`.
    pub fn save_to<W: Write>(&self, w: &mut W) -> Result<()> {
        write_image(w, &self.chunks()?)?;
        Ok(())
    }

    pub fn save_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.save_to(&mut buf)?;
        Ok(buf)
    }

    /// Size of the image [`Substrate::save_to`] would write.
    pub fn checkpoint_size_bytes(&self) -> Result<usize> {
        let mut w = CountingWriter::new();
        self.save_to(&mut w)?;
        Ok(w.written())
    }

    /// Cold-load a checkpoint. The returned substrate is sealed and idle.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let substrate = Self::load_from(&mut BufReader::new(file))?;
        info!(
            path = %path.display(),
            tick = substrate.tick,
            synapses = substrate.synapse_count(),
            "checkpoint loaded"
        );
        Ok(substrate)
    }

    pub fn load_from<R: Read>(r: &mut R) -> Result<Self> {
        let image = read_image(r).map_err(|e| SubstrateError::corrupt(e.to_string()))?;
        image.into_substrate()
    }

    pub fn load_bytes(bytes: &[u8]) -> Result<Self> {
        Self::load_from(&mut io::Cursor::new(bytes))
    }

    fn chunks(&self) -> io::Result<Vec<Chunk>> {
        let mut conf = Vec::new();
        write_config(&mut conf, &self.cfg)?;

        let mut prng = Vec::with_capacity(16);
        storage::write_u64_le(&mut prng, self.seed)?;
        storage::write_u64_le(&mut prng, self.rng.state())?;

        let mut stat = Vec::with_capacity(8);
        storage::write_u64_le(&mut stat, self.tick)?;

        let regions = self.neurons.regions();
        let mut regn = Vec::new();
        storage::write_u32_le(&mut regn, len_u32(regions.len())?)?;
        for region in regions {
            storage::write_string(&mut regn, &region.name)?;
            storage::write_u8(&mut regn, region.kind.to_u8())?;
            storage::write_u8(&mut regn, region.pattern.to_u8())?;
            storage::write_u32_le(&mut regn, len_u32(region.neurons.start)?)?;
            storage::write_u32_le(&mut regn, len_u32(region.len())?)?;
        }

        let n = self.neurons.len();
        let mut neur = Vec::with_capacity(4 + n * NEURON_RECORD_BYTES);
        storage::write_u32_le(&mut neur, len_u32(n)?)?;
        for id in 0..n {
            let neuron = self
                .neurons
                .neuron(id)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            storage::write_u32_le(&mut neur, len_u32(neuron.region)?)?;
            storage::write_f32_le(&mut neur, neuron.activation)?;
            storage::write_f32_le(&mut neur, neuron.threshold)?;
            storage::write_f32_le(&mut neur, neuron.activity_trace)?;
            match neuron.last_spike {
                Some(t) => {
                    storage::write_u8(&mut neur, 1)?;
                    storage::write_u64_le(&mut neur, t)?;
                }
                None => {
                    storage::write_u8(&mut neur, 0)?;
                    storage::write_u64_le(&mut neur, 0)?;
                }
            }
        }

        let m = self.synapses.synapse_count();
        let mut synp = Vec::with_capacity(4 + m * SYNAPSE_RECORD_BYTES);
        storage::write_u32_le(&mut synp, len_u32(m)?)?;
        for s in self.synapses.iter() {
            storage::write_u32_le(&mut synp, len_u32(s.key.source)?)?;
            storage::write_u32_le(&mut synp, len_u32(s.key.destination)?)?;
            storage::write_f32_le(&mut synp, s.weight)?;
            storage::write_f32_le(&mut synp, s.eligibility)?;
            storage::write_u64_le(&mut synp, s.last_update)?;
            storage::write_u8(&mut synp, s.rule.to_u8())?;
        }

        Ok(vec![
            (TAG_CONF, conf),
            (TAG_PRNG, prng),
            (TAG_STAT, stat),
            (TAG_REGN, regn),
            (TAG_NEUR, neur),
            (TAG_SYNP, synp),
        ])
    }
}

const NEURON_RECORD_BYTES: usize = 4 + 4 + 4 + 4 + 1 + 8;
const SYNAPSE_RECORD_BYTES: usize = 4 + 4 + 4 + 4 + 8 + 1;

fn len_u32(v: usize) -> io::Result<u32> {
    u32::try_from(v).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "value exceeds u32"))
}

fn write_image<W: Write>(w: &mut W, chunks: &[Chunk]) -> io::Result<()> {
    w.write_all(storage::MAGIC)?;
    storage::write_u32_le(w, storage::VERSION_CURRENT)?;
    for (tag, payload) in chunks {
        storage::write_chunk_lz4(w, *tag, payload)?;
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "checkpoint".into());
    name.push(format!(".tmp-{}", std::process::id()));
    path.with_file_name(name)
}

fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let tmp = temp_path_for(path);
    let result = (|| -> Result<()> {
        let file = File::create(&tmp)?;
        let mut w = BufWriter::new(file);
        write(&mut w)?;
        let file = w.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

// =============================================================================
// Reading
// =============================================================================

#[derive(Default)]
struct RawImage {
    cfg: Option<SubstrateConfig>,
    prng: Option<(u64, u64)>,
    tick: Option<u64>,
    regions: Option<Vec<Region>>,
    neurons: Option<Vec<Neuron>>,
    synapses: Option<Vec<SynapseView>>,
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Read the first byte of a chunk tag, distinguishing a clean end of image.
fn read_tag<R: Read>(r: &mut R) -> io::Result<Option<[u8; 4]>> {
    let mut tag = [0u8; 4];
    loop {
        match r.read(&mut tag[..1]) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    r.read_exact(&mut tag[1..])?;
    Ok(Some(tag))
}

fn read_image<R: Read>(r: &mut R) -> io::Result<RawImage> {
    let magic = storage::read_exact::<8, _>(r)?;
    if &magic != storage::MAGIC {
        return Err(invalid("bad checkpoint magic"));
    }
    let version = storage::read_u32_le(r)?;
    if version != storage::VERSION_CURRENT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported checkpoint version {version}"),
        ));
    }

    let mut image = RawImage::default();
    while let Some(tag) = read_tag(r)? {
        let len = storage::read_u32_le(r)?;
        let payload = storage::read_chunk_payload_lz4(r, len)?;
        let mut c = io::Cursor::new(payload);
        match &tag {
            b"CONF" => image.cfg = Some(read_config(&mut c)?),
            b"PRNG" => {
                let seed = storage::read_u64_le(&mut c)?;
                let state = storage::read_u64_le(&mut c)?;
                image.prng = Some((seed, state));
            }
            b"STAT" => image.tick = Some(storage::read_u64_le(&mut c)?),
            b"REGN" => image.regions = Some(read_regions(&mut c)?),
            b"NEUR" => image.neurons = Some(read_neurons(&mut c)?),
            b"SYNP" => image.synapses = Some(read_synapses(&mut c)?),
            other => {
                debug!(tag = ?String::from_utf8_lossy(other), "skipping unknown checkpoint chunk");
            }
        }
    }
    Ok(image)
}

/// Cap an untrusted element count by what the payload could possibly hold.
fn bounded_capacity(count: usize, remaining: usize, record: usize) -> usize {
    count.min(remaining / record.max(1))
}

fn remaining(c: &io::Cursor<Vec<u8>>) -> usize {
    c.get_ref().len().saturating_sub(c.position() as usize)
}

fn read_regions(c: &mut io::Cursor<Vec<u8>>) -> io::Result<Vec<Region>> {
    let count = storage::read_u32_le(c)? as usize;
    let mut regions = Vec::with_capacity(bounded_capacity(count, remaining(c), 14));
    for id in 0..count {
        let name = storage::read_string(c)?;
        let kind = RegionKind::from_u8(storage::read_u8(c)?)
            .ok_or_else(|| invalid("unknown region kind"))?;
        let pattern = UpdatePattern::from_u8(storage::read_u8(c)?)
            .ok_or_else(|| invalid("unknown update pattern"))?;
        let start = storage::read_u32_le(c)? as usize;
        let len = storage::read_u32_le(c)? as usize;
        regions.push(Region {
            id,
            name,
            kind,
            neurons: start..start + len,
            pattern,
        });
    }
    Ok(regions)
}

fn read_neurons(c: &mut io::Cursor<Vec<u8>>) -> io::Result<Vec<Neuron>> {
    let count = storage::read_u32_le(c)? as usize;
    let mut neurons = Vec::with_capacity(bounded_capacity(count, remaining(c), NEURON_RECORD_BYTES));
    for id in 0..count {
        let region = storage::read_u32_le(c)? as usize;
        let activation = storage::read_f32_le(c)?;
        let threshold = storage::read_f32_le(c)?;
        let activity_trace = storage::read_f32_le(c)?;
        let has_spike = storage::read_u8(c)?;
        let spike = storage::read_u64_le(c)?;
        let last_spike = match has_spike {
            0 => None,
            1 => Some(spike),
            _ => return Err(invalid("bad spike flag")),
        };
        neurons.push(Neuron {
            id,
            region,
            activation,
            threshold,
            last_spike,
            activity_trace,
        });
    }
    Ok(neurons)
}

fn read_synapses(c: &mut io::Cursor<Vec<u8>>) -> io::Result<Vec<SynapseView>> {
    let count = storage::read_u32_le(c)? as usize;
    let mut synapses =
        Vec::with_capacity(bounded_capacity(count, remaining(c), SYNAPSE_RECORD_BYTES));
    for _ in 0..count {
        let source = storage::read_u32_le(c)? as usize;
        let destination = storage::read_u32_le(c)? as usize;
        let weight = storage::read_f32_le(c)?;
        let eligibility = storage::read_f32_le(c)?;
        let last_update = storage::read_u64_le(c)?;
        let rule = RuleTag::from_u8(storage::read_u8(c)?)
            .ok_or_else(|| invalid("unknown rule tag"))?;
        synapses.push(SynapseView {
            key: SynapseKey::new(source, destination),
            weight,
            eligibility,
            last_update,
            rule,
        });
    }
    Ok(synapses)
}

impl RawImage {
    fn into_substrate(self) -> Result<Substrate> {
        let missing = |what: &str| SubstrateError::corrupt(format!("missing {what} chunk"));
        let cfg = self.cfg.ok_or_else(|| missing("CONF"))?;
        let (seed, state) = self.prng.ok_or_else(|| missing("PRNG"))?;
        let tick = self.tick.ok_or_else(|| missing("STAT"))?;
        let regions = self.regions.ok_or_else(|| missing("REGN"))?;
        let neurons = self.neurons.ok_or_else(|| missing("NEUR"))?;
        let mut synapses = self.synapses.ok_or_else(|| missing("SYNP"))?;

        cfg.validate()
            .map_err(|e| SubstrateError::corrupt(format!("invalid configuration: {e}")))?;
        if state == 0 {
            return Err(SubstrateError::corrupt("zero generator state"));
        }

        validate_regions(&cfg, &regions, neurons.len())?;
        validate_neurons(&regions, &neurons, tick)?;
        validate_synapses(&cfg, &mut synapses, neurons.len(), tick)?;

        let n = neurons.len();
        let neuron_store = NeuronStore::from_parts(regions, neurons);
        let synapse_store = SynapseStore::from_sorted(n, &synapses);
        Ok(Substrate::from_parts(
            cfg,
            seed,
            Prng::from_state(state),
            tick,
            neuron_store,
            synapse_store,
            Phase::Idle,
        ))
    }
}

fn validate_regions(cfg: &SubstrateConfig, regions: &[Region], neuron_count: usize) -> Result<()> {
    if regions.len() > cfg.max_regions {
        return Err(SubstrateError::corrupt(format!(
            "{} regions exceed max_regions {}",
            regions.len(),
            cfg.max_regions
        )));
    }
    let mut next = 0usize;
    for (i, region) in regions.iter().enumerate() {
        if region.name.is_empty() {
            return Err(SubstrateError::corrupt(format!("region #{i} has no name")));
        }
        if regions[..i].iter().any(|r| r.name == region.name) {
            return Err(SubstrateError::corrupt(format!(
                "duplicate region name {:?}",
                region.name
            )));
        }
        if region.neurons.start != next {
            return Err(SubstrateError::corrupt(format!(
                "region {:?} does not start where the previous one ends",
                region.name
            )));
        }
        let len = region.len();
        if len == 0 || len > cfg.max_region_capacity {
            return Err(SubstrateError::corrupt(format!(
                "region {:?} capacity {len} out of range",
                region.name
            )));
        }
        next = region.neurons.end;
    }
    if next != neuron_count {
        return Err(SubstrateError::corrupt(format!(
            "regions cover {next} neurons but the neuron table has {neuron_count}"
        )));
    }
    if neuron_count > cfg.max_neurons {
        return Err(SubstrateError::corrupt("neuron count exceeds max_neurons"));
    }
    Ok(())
}

fn validate_neurons(regions: &[Region], neurons: &[Neuron], tick: u64) -> Result<()> {
    for region in regions {
        for id in region.neurons.clone() {
            let n = &neurons[id];
            if n.region != region.id {
                return Err(SubstrateError::corrupt(format!(
                    "neuron #{id} claims region #{} but lies in #{}",
                    n.region, region.id
                )));
            }
            if !n.activation.is_finite() || !n.activity_trace.is_finite() {
                return Err(SubstrateError::corrupt(format!(
                    "neuron #{id} has non-finite state"
                )));
            }
            if !n.threshold.is_finite() || n.threshold < 0.0 {
                return Err(SubstrateError::corrupt(format!(
                    "neuron #{id} has invalid threshold"
                )));
            }
            if matches!(n.last_spike, Some(t) if t >= tick) {
                return Err(SubstrateError::corrupt(format!(
                    "neuron #{id} spiked after the checkpoint tick"
                )));
            }
        }
    }
    Ok(())
}

fn validate_synapses(
    cfg: &SubstrateConfig,
    synapses: &mut [SynapseView],
    neuron_count: usize,
    tick: u64,
) -> Result<()> {
    if synapses.len() > cfg.max_synapses {
        return Err(SubstrateError::corrupt("synapse count exceeds max_synapses"));
    }
    let w_max = cfg.learning.w_max;
    for s in synapses.iter() {
        let SynapseKey {
            source,
            destination,
        } = s.key;
        if source >= neuron_count || destination >= neuron_count {
            return Err(SubstrateError::corrupt(format!(
                "synapse {source}->{destination} has a dangling endpoint"
            )));
        }
        if !s.weight.is_finite() || !s.eligibility.is_finite() || s.weight.abs() > w_max {
            return Err(SubstrateError::corrupt(format!(
                "synapse {source}->{destination} has invalid weight or eligibility"
            )));
        }
        if s.last_update > tick {
            return Err(SubstrateError::corrupt(format!(
                "synapse {source}->{destination} updated after the checkpoint tick"
            )));
        }
    }
    synapses.sort_by_key(|s| s.key);
    if let Some(w) = synapses.windows(2).find(|w| w[0].key == w[1].key) {
        return Err(SubstrateError::corrupt(format!(
            "duplicate synapse {}->{}",
            w[0].key.source, w[0].key.destination
        )));
    }
    Ok(())
}

// =============================================================================
// Configuration encoding
// =============================================================================

fn write_config<W: Write>(w: &mut W, cfg: &SubstrateConfig) -> io::Result<()> {
    storage::write_u64_le(w, cfg.max_regions as u64)?;
    storage::write_u64_le(w, cfg.max_neurons as u64)?;
    storage::write_u64_le(w, cfg.max_region_capacity as u64)?;
    storage::write_u64_le(w, cfg.max_synapses as u64)?;
    storage::write_f32_le(w, cfg.activation_rate)?;
    storage::write_f32_le(w, cfg.activity_trace_rate)?;
    storage::write_f32_le(w, cfg.activation_noise)?;
    storage::write_f32_le(w, cfg.default_threshold)?;
    storage::write_u64_le(w, cfg.consolidate_every)?;
    storage::write_u64_le(w, cfg.telemetry_every)?;
    storage::write_u32_le(w, cfg.tick_budget_ms)?;
    storage::write_u64_le(w, cfg.input_buffer_capacity as u64)?;
    storage::write_u64_le(w, cfg.reward_buffer_capacity as u64)?;
    storage::write_f32_le(w, cfg.prune.threshold)?;
    storage::write_u64_le(w, cfg.prune.min_idle_steps)?;
    storage::write_u8(w, cfg.homeostasis.enabled as u8)?;
    storage::write_f32_le(w, cfg.homeostasis.target_low)?;
    storage::write_f32_le(w, cfg.homeostasis.target_high)?;
    storage::write_f32_le(w, cfg.homeostasis.max_scale_step)?;
    storage::write_u8(w, cfg.seed.is_some() as u8)?;
    storage::write_u64_le(w, cfg.seed.unwrap_or(0))?;

    let l = &cfg.learning;
    storage::write_f32_le(w, l.associative_rate)?;
    storage::write_f32_le(w, l.timing.a_plus)?;
    storage::write_f32_le(w, l.timing.a_minus)?;
    storage::write_f32_le(w, l.timing.tau_plus)?;
    storage::write_f32_le(w, l.timing.tau_minus)?;
    storage::write_u32_le(w, l.timing.window)?;
    storage::write_f32_le(w, l.eligibility_decay)?;
    storage::write_f32_le(w, l.eligibility_rate)?;
    storage::write_f32_le(w, l.reward_scale)?;
    storage::write_f32_le(w, l.novelty_weight)?;
    storage::write_f32_le(w, l.task_weight)?;
    storage::write_f32_le(w, l.clip_bound)?;
    storage::write_f32_le(w, l.w_max)?;
    storage::write_f32_le(w, l.coactive_threshold)?;
    storage::write_f32_le(w, l.blend.associative)?;
    storage::write_f32_le(w, l.blend.timing)?;
    storage::write_u8(w, l.rules.associative as u8)?;
    storage::write_u8(w, l.rules.timing as u8)?;
    storage::write_u8(w, l.rules.reward as u8)?;
    Ok(())
}

fn read_usize<R: Read>(r: &mut R) -> io::Result<usize> {
    usize::try_from(storage::read_u64_le(r)?).map_err(|_| invalid("size does not fit usize"))
}

fn read_bool<R: Read>(r: &mut R) -> io::Result<bool> {
    match storage::read_u8(r)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(invalid("bad boolean")),
    }
}

fn read_config<R: Read>(r: &mut R) -> io::Result<SubstrateConfig> {
    let max_regions = read_usize(r)?;
    let max_neurons = read_usize(r)?;
    let max_region_capacity = read_usize(r)?;
    let max_synapses = read_usize(r)?;
    let activation_rate = storage::read_f32_le(r)?;
    let activity_trace_rate = storage::read_f32_le(r)?;
    let activation_noise = storage::read_f32_le(r)?;
    let default_threshold = storage::read_f32_le(r)?;
    let consolidate_every = storage::read_u64_le(r)?;
    let telemetry_every = storage::read_u64_le(r)?;
    let tick_budget_ms = storage::read_u32_le(r)?;
    let input_buffer_capacity = read_usize(r)?;
    let reward_buffer_capacity = read_usize(r)?;
    let prune = PruneConfig {
        threshold: storage::read_f32_le(r)?,
        min_idle_steps: storage::read_u64_le(r)?,
    };
    let homeostasis = HomeostasisConfig {
        enabled: read_bool(r)?,
        target_low: storage::read_f32_le(r)?,
        target_high: storage::read_f32_le(r)?,
        max_scale_step: storage::read_f32_le(r)?,
    };
    let seed_present = read_bool(r)?;
    let seed = storage::read_u64_le(r)?;

    let associative_rate = storage::read_f32_le(r)?;
    let timing = TimingConfig {
        a_plus: storage::read_f32_le(r)?,
        a_minus: storage::read_f32_le(r)?,
        tau_plus: storage::read_f32_le(r)?,
        tau_minus: storage::read_f32_le(r)?,
        window: storage::read_u32_le(r)?,
    };
    let learning = LearningConfig {
        associative_rate,
        timing,
        eligibility_decay: storage::read_f32_le(r)?,
        eligibility_rate: storage::read_f32_le(r)?,
        reward_scale: storage::read_f32_le(r)?,
        novelty_weight: storage::read_f32_le(r)?,
        task_weight: storage::read_f32_le(r)?,
        clip_bound: storage::read_f32_le(r)?,
        w_max: storage::read_f32_le(r)?,
        coactive_threshold: storage::read_f32_le(r)?,
        blend: RuleBlend {
            associative: storage::read_f32_le(r)?,
            timing: storage::read_f32_le(r)?,
        },
        rules: RuleSet {
            associative: read_bool(r)?,
            timing: read_bool(r)?,
            reward: read_bool(r)?,
        },
    };

    Ok(SubstrateConfig {
        max_regions,
        max_neurons,
        max_region_capacity,
        max_synapses,
        activation_rate,
        activity_trace_rate,
        activation_noise,
        default_threshold,
        consolidate_every,
        telemetry_every,
        tick_budget_ms,
        input_buffer_capacity,
        reward_buffer_capacity,
        prune,
        homeostasis,
        seed: seed_present.then_some(seed),
        learning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::TickInput;

    fn trained() -> Substrate {
        let cfg = SubstrateConfig {
            activation_noise: 0.01,
            ..SubstrateConfig::default()
        }
        .with_seed(99)
        .with_consolidate_every(7);
        let mut s = Substrate::new(cfg).unwrap();
        let a = s.create_region("eye", RegionKind::Sensory, 12).unwrap();
        let b = s
            .create_region_with("assoc", RegionKind::Associative, 16, UpdatePattern::Asynchronous)
            .unwrap();
        s.connect(a, b, 0.4, 0.1..=0.5).unwrap();
        s.connect(b, b, 0.2, -0.3..=0.3).unwrap();
        s.seal().unwrap();
        for t in 0..25 {
            let mut input = TickInput::new().with_frame(a, vec![0.8; 12], t);
            if t % 5 == 0 {
                input = input.with_reward(0.2, 0.9, t);
            }
            s.step(&input).unwrap();
        }
        s
    }

    fn corrupt_message(result: Result<Substrate>) -> String {
        match result {
            Err(SubstrateError::CorruptState(msg)) => msg,
            other => panic!("expected CorruptState, got {other:?}"),
        }
    }

    fn rebuild(chunks: &[Chunk]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_image(&mut buf, chunks).unwrap();
        buf
    }

    #[test]
    fn round_trip_is_exact() {
        let s = trained();
        let bytes = s.save_bytes().unwrap();
        assert_eq!(bytes.len(), s.checkpoint_size_bytes().unwrap());

        let loaded = Substrate::load_bytes(&bytes).unwrap();
        assert_eq!(loaded.phase(), Phase::Idle);
        assert_eq!(loaded.tick(), s.tick());
        assert_eq!(loaded.seed(), s.seed());
        assert_eq!(loaded.rng, s.rng);
        assert_eq!(loaded.config(), s.config());
        assert_eq!(loaded.regions(), s.regions());
        for id in 0..s.total_neurons() {
            assert_eq!(loaded.neuron(id).unwrap(), s.neuron(id).unwrap());
        }
        let a: Vec<SynapseView> = s.synapses().iter().collect();
        let b: Vec<SynapseView> = loaded.synapses().iter().collect();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.key, y.key);
            assert_eq!(x.weight.to_bits(), y.weight.to_bits());
            assert_eq!(x.eligibility.to_bits(), y.eligibility.to_bits());
            assert_eq!(x.last_update, y.last_update);
            assert_eq!(x.rule, y.rule);
        }
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let s = trained();
        let mut bytes = s.save_bytes().unwrap();
        bytes[0] ^= 0xFF;
        assert!(corrupt_message(Substrate::load_bytes(&bytes)).contains("magic"));

        let mut bytes = s.save_bytes().unwrap();
        bytes[8..12].copy_from_slice(&99u32.to_le_bytes());
        assert!(corrupt_message(Substrate::load_bytes(&bytes)).contains("version"));
    }

    #[test]
    fn truncated_image_is_rejected() {
        let bytes = trained().save_bytes().unwrap();
        let cut = &bytes[..bytes.len() - 3];
        corrupt_message(Substrate::load_bytes(cut));
    }

    #[test]
    fn missing_chunk_is_rejected() {
        let chunks: Vec<Chunk> = trained()
            .chunks()
            .unwrap()
            .into_iter()
            .filter(|(tag, _)| *tag != TAG_SYNP)
            .collect();
        let msg = corrupt_message(Substrate::load_bytes(&rebuild(&chunks)));
        assert!(msg.contains("SYNP"));
    }

    #[test]
    fn unknown_chunks_are_skipped() {
        let s = trained();
        let mut chunks = s.chunks().unwrap();
        chunks.insert(2, (*b"XTRA", vec![1, 2, 3]));
        let loaded = Substrate::load_bytes(&rebuild(&chunks)).unwrap();
        assert_eq!(loaded.synapse_count(), s.synapse_count());
    }

    fn replace_synapses(s: &Substrate, records: &[(u32, u32, f32)]) -> Vec<u8> {
        let mut synp = Vec::new();
        storage::write_u32_le(&mut synp, records.len() as u32).unwrap();
        for &(src, dst, w) in records {
            storage::write_u32_le(&mut synp, src).unwrap();
            storage::write_u32_le(&mut synp, dst).unwrap();
            storage::write_f32_le(&mut synp, w).unwrap();
            storage::write_f32_le(&mut synp, 0.0).unwrap();
            storage::write_u64_le(&mut synp, 0).unwrap();
            storage::write_u8(&mut synp, 0).unwrap();
        }
        let chunks: Vec<Chunk> = s
            .chunks()
            .unwrap()
            .into_iter()
            .map(|(tag, payload)| if tag == TAG_SYNP { (tag, synp.clone()) } else { (tag, payload) })
            .collect();
        rebuild(&chunks)
    }

    #[test]
    fn structural_violations_are_rejected() {
        let s = trained();
        let n = s.total_neurons() as u32;

        let dangling = replace_synapses(&s, &[(0, n, 0.1)]);
        assert!(corrupt_message(Substrate::load_bytes(&dangling)).contains("dangling"));

        let duplicate = replace_synapses(&s, &[(0, 13, 0.1), (0, 13, 0.2)]);
        assert!(corrupt_message(Substrate::load_bytes(&duplicate)).contains("duplicate"));

        let non_finite = replace_synapses(&s, &[(0, 13, f32::NAN)]);
        corrupt_message(Substrate::load_bytes(&non_finite));

        let ok = replace_synapses(&s, &[(0, 13, 0.1)]);
        assert_eq!(Substrate::load_bytes(&ok).unwrap().synapse_count(), 1);
    }

    #[test]
    fn region_table_must_cover_neurons() {
        let s = trained();
        let mut regn = Vec::new();
        storage::write_u32_le(&mut regn, 1).unwrap();
        storage::write_string(&mut regn, "eye").unwrap();
        storage::write_u8(&mut regn, 0).unwrap();
        storage::write_u8(&mut regn, 0).unwrap();
        storage::write_u32_le(&mut regn, 0).unwrap();
        storage::write_u32_le(&mut regn, 12).unwrap();
        let chunks: Vec<Chunk> = s
            .chunks()
            .unwrap()
            .into_iter()
            .map(|(tag, payload)| if tag == TAG_REGN { (tag, regn.clone()) } else { (tag, payload) })
            .collect();
        corrupt_message(Substrate::load_bytes(&rebuild(&chunks)));
    }

    #[test]
    fn save_is_atomic_and_cleans_up() {
        let dir = std::env::temp_dir().join(format!("neurite-ckpt-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("substrate.ckpt");

        let mut s = trained();
        s.save(&path).unwrap();
        assert_eq!(s.phase(), Phase::Idle);
        let first = fs::read(&path).unwrap();

        // A directory in place of the temp file makes the write fail.
        let tmp = temp_path_for(&path);
        fs::create_dir_all(&tmp).unwrap();
        s.step(&TickInput::new()).unwrap();
        assert!(s.save(&path).is_err());
        assert_eq!(fs::read(&path).unwrap(), first);
        assert_eq!(s.phase(), Phase::Idle);
        fs::remove_dir_all(&tmp).unwrap();

        s.save(&path).unwrap();
        assert!(!tmp.exists());
        let loaded = Substrate::load(&path).unwrap();
        assert_eq!(loaded.tick(), s.tick());

        fs::remove_dir_all(&dir).unwrap();
    }
}
