//! Line-delimited JSON protocol spoken over TCP.
//!
//! Each request is one JSON object with a `type` field; each gets exactly
//! one response line.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use neurite::boundary::{
    ActivationReader, ActivationSnapshot, RewardInput, SensoryInput, SubstrateSnapshot,
};
use neurite::scheduler::Scheduler;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{info, warn};

/// Longest request line accepted before the connection is dropped.
pub const MAX_LINE_BYTES: usize = 4 << 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Queue a feature vector for a region.
    Sense {
        region: String,
        features: Vec<f32>,
        #[serde(default)]
        timestamp: u64,
    },
    Reward {
        #[serde(default)]
        novelty: f32,
        #[serde(default)]
        task_reward: f32,
        #[serde(default)]
        timestamp: u64,
    },
    Activations {
        region: String,
    },
    Stats,
    Save,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Activations(ActivationSnapshot),
    Stats(SubstrateSnapshot),
    Success { message: String },
    Error { message: String },
}

impl Response {
    fn error(e: impl std::fmt::Display) -> Self {
        Response::Error {
            message: e.to_string(),
        }
    }
}

/// Everything a connection needs to serve requests.
#[derive(Clone)]
pub struct Daemon {
    sensory: SensoryInput,
    reward: RewardInput,
    reader: ActivationReader,
    scheduler: Scheduler,
    checkpoint_path: PathBuf,
    stop: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl Daemon {
    pub fn new(scheduler: Scheduler, checkpoint_path: PathBuf) -> Self {
        Self {
            sensory: SensoryInput::new(&scheduler),
            reward: RewardInput::new(&scheduler),
            reader: ActivationReader::new(&scheduler),
            scheduler,
            checkpoint_path,
            stop: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn checkpoint_path(&self) -> &PathBuf {
        &self.checkpoint_path
    }

    /// Flag polled by the tick loop.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Resolves once a client has requested shutdown.
    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await
    }

    /// Serve one request. May block on the substrate lock or on disk, so
    /// async callers run it on the blocking pool.
    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::Sense {
                region,
                features,
                timestamp,
            } => {
                let pushed = self
                    .sensory
                    .region_id(&region)
                    .and_then(|id| self.sensory.push(id, features, timestamp));
                match pushed {
                    Ok(()) => Response::Success {
                        message: "Queued".to_string(),
                    },
                    Err(e) => Response::error(e),
                }
            }
            Request::Reward {
                novelty,
                task_reward,
                timestamp,
            } => match self.reward.push(novelty, task_reward, timestamp) {
                Ok(()) => Response::Success {
                    message: "Queued".to_string(),
                },
                Err(e) => Response::error(e),
            },
            Request::Activations { region } => match self.reader.snapshot_by_name(&region) {
                Ok(snapshot) => Response::Activations(snapshot),
                Err(e) => Response::error(e),
            },
            Request::Stats => Response::Stats(self.scheduler.snapshot()),
            Request::Save => match self.scheduler.checkpoint(&self.checkpoint_path) {
                Ok(()) => Response::Success {
                    message: format!("Saved to {}", self.checkpoint_path.display()),
                },
                Err(e) => {
                    warn!(error = %e, "save request failed");
                    Response::error(e)
                }
            },
            Request::Shutdown => {
                info!("shutdown requested by client");
                self.stop.store(true, Ordering::Release);
                self.shutdown.notify_one();
                Response::Success {
                    message: "Shutting down".to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neurite::prelude::*;

    fn daemon(name: &str) -> Daemon {
        let mut s = Substrate::new(SubstrateConfig::default().with_seed(4)).unwrap();
        let a = s.create_region("eye", RegionKind::Sensory, 4).unwrap();
        let b = s.create_region("hand", RegionKind::Motor, 2).unwrap();
        s.connect(a, b, 0.5, 0.2..=0.6).unwrap();
        s.seal().unwrap();
        let path = std::env::temp_dir().join(format!(
            "neurited-ipc-{name}-{}.nck",
            std::process::id()
        ));
        Daemon::new(Scheduler::new(s).unwrap(), path)
    }

    #[test]
    fn requests_parse_from_tagged_json() {
        let req: Request = serde_json::from_str(
            r#"{"type":"sense","region":"eye","features":[1.0,0.5],"timestamp":3}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            Request::Sense {
                region: "eye".into(),
                features: vec![1.0, 0.5],
                timestamp: 3,
            }
        );
        let req: Request = serde_json::from_str(r#"{"type":"reward","task_reward":1.0}"#).unwrap();
        assert_eq!(
            req,
            Request::Reward {
                novelty: 0.0,
                task_reward: 1.0,
                timestamp: 0,
            }
        );
        assert_eq!(
            serde_json::from_str::<Request>(r#"{"type":"stats"}"#).unwrap(),
            Request::Stats
        );
        assert!(serde_json::from_str::<Request>(r#"{"type":"dream"}"#).is_err());
    }

    #[test]
    fn sense_then_tick_is_visible_to_activations() {
        let d = daemon("sense");
        let resp = d.handle(Request::Sense {
            region: "eye".into(),
            features: vec![0.25; 4],
            timestamp: 0,
        });
        assert!(matches!(resp, Response::Success { .. }));
        d.scheduler().tick().unwrap();

        match d.handle(Request::Activations {
            region: "eye".into(),
        }) {
            Response::Activations(snap) => {
                assert_eq!(snap.tick, 1);
                assert_eq!(snap.values, vec![0.25; 4]);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn bad_requests_get_error_responses() {
        let d = daemon("errors");
        let unknown = d.handle(Request::Sense {
            region: "ear".into(),
            features: vec![1.0],
            timestamp: 0,
        });
        assert!(matches!(unknown, Response::Error { .. }));
        let nan = d.handle(Request::Reward {
            novelty: f32::NAN,
            task_reward: 0.0,
            timestamp: 0,
        });
        assert!(matches!(nan, Response::Error { .. }));
        assert_eq!(d.scheduler().pending_inputs(), 0);
    }

    #[test]
    fn save_writes_a_loadable_checkpoint() {
        let d = daemon("save");
        d.scheduler().tick().unwrap();
        assert!(matches!(d.handle(Request::Save), Response::Success { .. }));
        let loaded = Substrate::load(d.checkpoint_path()).unwrap();
        assert_eq!(loaded.tick(), 1);
        let _ = std::fs::remove_file(d.checkpoint_path());
    }

    #[test]
    fn shutdown_sets_the_stop_flag() {
        let d = daemon("shutdown");
        assert!(!d.is_stopping());
        assert!(matches!(d.handle(Request::Shutdown), Response::Success { .. }));
        assert!(d.stop_flag().load(Ordering::Acquire));
    }

    #[test]
    fn stats_response_serializes_with_type_tag() {
        let d = daemon("stats");
        let json = serde_json::to_value(d.handle(Request::Stats)).unwrap();
        assert_eq!(json["type"], "stats");
        assert_eq!(json["diagnostics"]["neuron_count"], 6);
    }
}
