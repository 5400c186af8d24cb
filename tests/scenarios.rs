use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use neurite::prelude::*;

fn scratch_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("neurite-{name}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn realized_density_is_within_tolerance() {
    for density in [0.01f32, 0.05, 0.2] {
        let mut s = Substrate::new(SubstrateConfig::default().with_seed(17)).unwrap();
        let a = s.create_region("a", RegionKind::Sensory, 1000).unwrap();
        let b = s.create_region("b", RegionKind::Associative, 1000).unwrap();
        let created = s.connect(a, b, density, 0.1..=0.9).unwrap();

        let realized = created as f64 / 1_000_000.0;
        let requested = density as f64;
        assert!(
            (realized - requested).abs() <= 0.1 * requested,
            "density {requested}: realized {realized}"
        );
        assert_eq!(s.synapse_count(), created);
    }
}

#[test]
fn intra_region_density_is_within_tolerance() {
    let mut s = Substrate::new(SubstrateConfig::default().with_seed(4)).unwrap();
    let a = s.create_region("a", RegionKind::Associative, 1000).unwrap();
    let created = s.connect(a, a, 0.03, -0.5..=0.5).unwrap();
    let realized = created as f64 / (1000.0 * 999.0);
    assert!((realized - 0.03).abs() <= 0.003);
}

#[test]
fn sustained_coactivity_saturates_weights() {
    let learning = LearningConfig::default().with_rules(RuleSet::associative_only());
    let cfg = SubstrateConfig::default()
        .with_seed(2024)
        .with_learning(learning);
    let w_max = cfg.learning.w_max;

    let mut s = Substrate::new(cfg).unwrap();
    let a = s.create_region("a", RegionKind::Sensory, 100).unwrap();
    let b = s.create_region("b", RegionKind::Associative, 100).unwrap();
    let created = s.connect(a, b, 0.05, 0.1..=0.9).unwrap();
    assert_eq!(created, 500);
    s.seal().unwrap();

    for t in 0..1000 {
        let input = TickInput::new()
            .with_frame(a, vec![1.0; 100], t)
            .with_frame(b, vec![1.0; 100], t);
        s.step(&input).unwrap();
    }

    assert_eq!(s.tick(), 1000);
    assert!(s.synapse_count() > 0);
    for view in s.synapses().iter() {
        assert_eq!(view.weight, w_max, "{:?}", view.key);
        assert_eq!(view.rule, RuleTag::Associative);
    }

    // Saturated weights take no further change, and the stats say so.
    let input = TickInput::new()
        .with_frame(a, vec![1.0; 100], 1000)
        .with_frame(b, vec![1.0; 100], 1000);
    let report = s.step(&input).unwrap();
    assert_eq!(report.plasticity.updated, 0);
    assert_eq!(report.plasticity.potentiated, 0);
    assert_eq!(report.plasticity.mean_delta(), 0.0);
}

fn replay(t: u64, sensory: RegionId) -> TickInput {
    let features: Vec<f32> = (0..32)
        .map(|i| (((t as usize * 7 + i * 13) % 17) as f32) / 16.0)
        .collect();
    let mut input = TickInput::new().with_frame(sensory, features, t);
    if t % 25 == 0 {
        input = input.with_reward(0.3, ((t / 25) % 2) as f32, t);
    }
    input
}

fn build_resumable() -> (Substrate, RegionId) {
    let cfg = SubstrateConfig {
        activation_noise: 0.02,
        ..SubstrateConfig::default()
    }
    .with_seed(77)
    .with_consolidate_every(50);
    let mut s = Substrate::new(cfg).unwrap();
    let sensory = s.create_region("sensory", RegionKind::Sensory, 32).unwrap();
    let assoc = s
        .create_region_with("assoc", RegionKind::Associative, 64, UpdatePattern::Asynchronous)
        .unwrap();
    let motor = s.create_region("motor", RegionKind::Motor, 16).unwrap();
    s.connect(sensory, assoc, 0.2, 0.1..=0.6).unwrap();
    s.connect(assoc, assoc, 0.05, -0.3..=0.3).unwrap();
    s.connect(assoc, motor, 0.3, 0.0..=0.5).unwrap();
    s.seal().unwrap();
    (s, sensory)
}

#[test]
fn resumed_checkpoint_matches_uninterrupted_run() {
    let dir = scratch_dir("resume");
    let path = dir.join("tick500.ckpt");

    let (mut reference, sensory) = build_resumable();
    for t in 0..500 {
        reference.step(&replay(t, sensory)).unwrap();
    }
    reference.save(&path).unwrap();
    reference.step(&replay(500, sensory)).unwrap();

    let mut resumed = Substrate::load(&path).unwrap();
    assert_eq!(resumed.tick(), 500);
    resumed.step(&replay(500, sensory)).unwrap();

    assert_eq!(resumed.tick(), reference.tick());
    let a: Vec<u32> = reference.activations().iter().map(|v| v.to_bits()).collect();
    let b: Vec<u32> = resumed.activations().iter().map(|v| v.to_bits()).collect();
    assert_eq!(a, b);

    let wa: Vec<(SynapseKey, u32)> = reference
        .synapses()
        .iter()
        .map(|v| (v.key, v.weight.to_bits()))
        .collect();
    let wb: Vec<(SynapseKey, u32)> = resumed
        .synapses()
        .iter()
        .map(|v| (v.key, v.weight.to_bits()))
        .collect();
    assert_eq!(wa, wb);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn delayed_reward_credits_earlier_coactivity() {
    let learning = LearningConfig::default().with_rules(RuleSet {
        associative: false,
        timing: false,
        reward: true,
    });
    let build = || {
        let cfg = SubstrateConfig::default()
            .with_seed(9)
            .with_learning(learning);
        let mut s = Substrate::new(cfg).unwrap();
        let a = s.create_region("cue", RegionKind::Sensory, 4).unwrap();
        let b = s.create_region("act", RegionKind::Motor, 4).unwrap();
        s.connect(a, b, 1.0, 0.3..=0.3).unwrap();
        s.seal().unwrap();
        (s, a, b)
    };

    let run = |rewarded: bool| {
        let (mut s, a, b) = build();
        for t in 0..5 {
            let input = TickInput::new()
                .with_frame(a, vec![1.0; 4], t)
                .with_frame(b, vec![1.0; 4], t);
            s.step(&input).unwrap();
        }
        for t in 5..8 {
            let input = TickInput::new()
                .with_frame(a, vec![0.0; 4], t)
                .with_frame(b, vec![0.0; 4], t);
            s.step(&input).unwrap();
        }
        let mut input = TickInput::new()
            .with_frame(a, vec![0.0; 4], 8)
            .with_frame(b, vec![0.0; 4], 8);
        if rewarded {
            input = input.with_reward(0.0, 1.0, 8);
        }
        s.step(&input).unwrap();
        s.synapses().iter().map(|v| v.weight).collect::<Vec<_>>()
    };

    let with_reward = run(true);
    let without = run(false);
    assert!(with_reward.iter().all(|&w| w > 0.3));
    assert!(without.iter().all(|&w| w == 0.3));
}

#[test]
fn long_run_stays_bounded() {
    let cfg = SubstrateConfig {
        activation_noise: 0.05,
        ..SubstrateConfig::default()
    }
    .with_seed(31)
    .with_consolidate_every(100);
    let w_max = cfg.learning.w_max;
    let mut s = Substrate::new(cfg).unwrap();
    let a = s.create_region("a", RegionKind::Sensory, 50).unwrap();
    let b = s.create_region("b", RegionKind::Associative, 80).unwrap();
    s.connect(a, b, 0.3, -0.5..=0.9).unwrap();
    s.connect(b, b, 0.1, -0.5..=0.5).unwrap();
    s.connect(b, a, 0.1, -0.2..=0.2).unwrap();
    s.seal().unwrap();

    let mut updates = 0usize;
    for t in 0..2000u64 {
        let mut input = TickInput::new().with_frame(
            a,
            (0..50).map(|i| ((t as usize + i) % 5) as f32 / 4.0).collect(),
            t,
        );
        if t % 40 == 0 {
            input = input.with_reward(0.5, 0.5, t);
        }
        let report = s.step(&input).unwrap();
        assert_eq!(report.plasticity.flagged, 0);
        updates += report.plasticity.updated;
    }
    assert!(updates > 0);
    for view in s.synapses().iter() {
        assert!(view.weight.is_finite() && view.weight.abs() <= w_max);
        assert!(view.eligibility.is_finite());
    }
    assert!(s.activations().iter().all(|v| v.is_finite()));
}

#[test]
fn concurrent_producers_drop_oldest() {
    let mut s = Substrate::new(
        SubstrateConfig::default()
            .with_seed(1)
            .with_buffer_capacity(16),
    )
    .unwrap();
    let regions: Vec<RegionId> = (0..4)
        .map(|i| {
            s.create_region(&format!("s{i}"), RegionKind::Sensory, 8)
                .unwrap()
        })
        .collect();
    s.seal().unwrap();
    let sched = Scheduler::new(s).unwrap();

    let per_producer = 500u64;
    let handles: Vec<_> = regions
        .iter()
        .map(|&region| {
            let input = SensoryInput::new(&sched);
            thread::spawn(move || {
                for t in 0..per_producer {
                    input.push(region, vec![0.25; 8], t).unwrap();
                }
            })
        })
        .collect();
    let rewards = {
        let input = RewardInput::new(&sched);
        thread::spawn(move || {
            for t in 0..per_producer {
                input.push(0.5, 0.5, t).unwrap();
            }
        })
    };
    for h in handles {
        h.join().unwrap();
    }
    rewards.join().unwrap();

    let pushed = per_producer * 5;
    let pending = sched.pending_inputs() as u64;
    assert_eq!(pending, 16 * 5);
    assert_eq!(sched.dropped_inputs(), pushed - pending);

    let report = sched.tick().unwrap();
    assert!(report.rewarded);
    assert_eq!(sched.pending_inputs(), 0);
    let snap = sched.snapshot();
    assert_eq!(snap.diagnostics.dropped_inputs, pushed - pending);
}

#[test]
fn pushes_do_not_wait_for_the_phase_lock() {
    let mut s = Substrate::new(SubstrateConfig::default().with_seed(3)).unwrap();
    let sensory = s.create_region("sensory", RegionKind::Sensory, 8).unwrap();
    s.seal().unwrap();
    let sched = Scheduler::new(s).unwrap();
    let producer = SensoryInput::new(&sched);
    let reward = RewardInput::new(&sched);

    let report = sched.read(|_| {
        // A tick queued behind this reader holds off until the view is released.
        let ticker = {
            let sched = sched.clone();
            thread::spawn(move || sched.tick())
        };
        thread::sleep(Duration::from_millis(20));

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let pusher = thread::spawn(move || {
            for t in 0..10 {
                producer.push(sensory, vec![0.6; 8], t).unwrap();
            }
            reward.push(0.2, 0.8, 0).unwrap();
            done_tx.send(()).unwrap();
        });
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("push blocked while the substrate lock was held");
        pusher.join().unwrap();
        ticker
    });

    let report = report.join().unwrap().unwrap();
    assert_eq!(report.tick, 1);
    assert!(report.rewarded);
    assert_eq!(report.clamped_neurons, 8);
    assert_eq!(sched.pending_inputs(), 0);
}

#[test]
fn readers_see_whole_ticks_while_loop_runs() {
    let (s, sensory) = build_resumable();
    let sched = Scheduler::new(s).unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    let ticker = {
        let sched = sched.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || sched.run(&stop, Duration::from_millis(1)))
    };

    let producer = SensoryInput::new(&sched);
    let reader = ActivationReader::new(&sched);
    let mut last_tick = 0;
    for t in 0..50 {
        producer.push(sensory, vec![0.7; 32], t).unwrap();
        let snap = reader.snapshot_by_name("motor").unwrap();
        assert!(snap.tick >= last_tick);
        assert!(snap.values.iter().all(|v| (-1.0..=1.0).contains(v)));
        last_tick = snap.tick;
        let phase = sched.read(|s| s.phase());
        assert_eq!(phase, Phase::Idle);
        thread::sleep(Duration::from_millis(1));
    }

    stop.store(true, Ordering::Release);
    ticker.join().unwrap().unwrap();
    assert!(sched.read(|s| s.tick()) >= last_tick);
}

#[cfg(feature = "serde")]
#[test]
fn json_telemetry_is_written_on_cadence() {
    let dir = scratch_dir("telemetry");
    let path = dir.join("telemetry.jsonl");

    let cfg = SubstrateConfig {
        telemetry_every: 10,
        ..SubstrateConfig::default()
    }
    .with_seed(3);
    let mut s = Substrate::new(cfg).unwrap();
    let a = s.create_region("a", RegionKind::Sensory, 10).unwrap();
    let b = s.create_region("b", RegionKind::Motor, 10).unwrap();
    s.connect(a, b, 0.5, 0.2..=0.4).unwrap();
    s.seal().unwrap();

    let file = std::fs::File::create(&path).unwrap();
    let sched = Scheduler::new(s).unwrap().with_telemetry(JsonLinesSink::new(file));
    for t in 0..30 {
        sched.push_sensory(a, vec![1.0; 10], t).unwrap();
        sched.tick().unwrap();
    }

    let text = std::fs::read_to_string(&path).unwrap();
    let records: Vec<TelemetryRecord> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(
        records.iter().map(|r| r.tick).collect::<Vec<_>>(),
        vec![10, 20, 30]
    );
    assert!(records.iter().all(|r| r.active_synapses == 50));

    std::fs::remove_dir_all(&dir).unwrap();
}
