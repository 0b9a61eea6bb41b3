//! Iterated hash-chain VDF.
//!
//! The chain is `s_0 = H(input)`, `s_{i+1} = H(s_i)`. Computation is
//! inherently sequential; verification replays one bounded segment, so a
//! block's worth of work is checked in at most `VDF_CHECKPOINT_INTERVAL`
//! hashes regardless of the cumulative iteration count.
//!
//! The engine runs the chain on a dedicated thread paced to
//! `VDF_TARGET_ITERS_PER_SEC`, emitting a checkpoint with a per-segment
//! proof after every completed segment. Cancellation mid-segment emits
//! nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::core::codec::{Decodable, Encodable, Reader, Writer};
use crate::core::constants::{
    VDF_CHECKPOINT_INTERVAL, VDF_SUBSTEP_ITERATIONS, VDF_TARGET_ITERS_PER_SEC,
};
use crate::core::crypto::sha256;
use crate::core::errors::DecodeError;
use crate::core::types::{now_ms, Hash};

/// Succinct proof of one contiguous chain segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VdfProof {
    pub segment_start: Hash,
    pub segment_iterations: u64,
    pub segment_end: Hash,
}

impl Encodable for VdfProof {
    fn encode_into(&self, w: &mut Writer) {
        w.put_hash(&self.segment_start);
        w.put_u64(self.segment_iterations);
        w.put_hash(&self.segment_end);
    }
}

impl Decodable for VdfProof {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(VdfProof {
            segment_start: r.hash()?,
            segment_iterations: r.u64()?,
            segment_end: r.hash()?,
        })
    }
}

/// Apply `iterations` chain steps starting from an existing chain state.
fn chain_steps(start: &Hash, iterations: u64) -> Hash {
    let mut state = *start;
    for _ in 0..iterations {
        state = sha256(state.as_bytes());
    }
    state
}

/// Run the chain from `input` for `iterations` steps, returning the
/// output state and a proof over the whole run as one segment.
pub fn advance(input: &Hash, iterations: u64) -> (Hash, VdfProof) {
    let s0 = sha256(input.as_bytes());
    let output = chain_steps(&s0, iterations);
    (
        output,
        VdfProof {
            segment_start: s0,
            segment_iterations: iterations,
            segment_end: output,
        },
    )
}

/// Re-derive one segment. Rejects segments longer than the checkpoint
/// interval so verification cost stays bounded.
pub fn verify_segment(proof: &VdfProof) -> bool {
    if proof.segment_iterations > VDF_CHECKPOINT_INTERVAL {
        return false;
    }
    chain_steps(&proof.segment_start, proof.segment_iterations) == proof.segment_end
}

/// Full verification of an `advance` run against its claimed inputs.
pub fn verify(input: &Hash, output: &Hash, iterations: u64, proof: &VdfProof) -> bool {
    proof.segment_start == sha256(input.as_bytes())
        && proof.segment_end == *output
        && proof.segment_iterations == iterations
        && verify_segment(proof)
}

/// One published checkpoint of the continuously running chain.
#[derive(Debug, Clone)]
pub struct VdfCheckpoint {
    /// Input the whole run was seeded from.
    pub input: Hash,
    /// Chain state after this segment.
    pub output: Hash,
    pub segment_iterations: u64,
    pub total_iterations: u64,
    pub proof: VdfProof,
    pub timestamp_ms: u64,
}

/// Observable engine state for heartbeat and block construction.
#[derive(Debug, Clone)]
pub struct VdfStatus {
    pub input: Hash,
    pub output: Hash,
    pub total_iterations: u64,
    pub last_checkpoint: Option<VdfCheckpoint>,
}

struct EngineShared {
    input: Hash,
    state: Hash,
    total_iterations: u64,
    last_checkpoint: Option<VdfCheckpoint>,
}

/// Background chain computation with checkpoint publication.
pub struct VdfEngine {
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    shared: Arc<RwLock<EngineShared>>,
    subscribers: Arc<Mutex<Vec<SyncSender<VdfCheckpoint>>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl VdfEngine {
    /// Seed the engine. The chain state starts at `s_0 = H(input)` with
    /// zero completed iterations.
    pub fn new(input: Hash) -> Self {
        let state = sha256(input.as_bytes());
        VdfEngine {
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            shared: Arc::new(RwLock::new(EngineShared {
                input,
                state,
                total_iterations: 0,
                last_checkpoint: None,
            })),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            handle: None,
        }
    }

    /// Register a checkpoint consumer. Slow consumers drop checkpoints
    /// rather than stalling the chain.
    pub fn subscribe(&self) -> Receiver<VdfCheckpoint> {
        let (tx, rx) = mpsc::sync_channel(16);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn status(&self) -> VdfStatus {
        let shared = self.shared.read().unwrap();
        VdfStatus {
            input: shared.input,
            output: shared.state,
            total_iterations: shared.total_iterations,
            last_checkpoint: shared.last_checkpoint.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Start the computation thread. Idempotent.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let running = self.running.clone();
        let paused = self.paused.clone();
        let shared = self.shared.clone();
        let subscribers = self.subscribers.clone();

        let handle = thread::Builder::new()
            .name("vdf-engine".into())
            .spawn(move || {
                info!("VDF engine started");
                Self::run(running, paused, shared, subscribers);
                info!("VDF engine stopped");
            })
            .expect("spawn vdf engine thread");

        self.handle = Some(handle);
    }

    /// Signal cancellation and join the thread. The in-flight segment is
    /// abandoned without emitting a checkpoint.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn run(
        running: Arc<AtomicBool>,
        paused: Arc<AtomicBool>,
        shared: Arc<RwLock<EngineShared>>,
        subscribers: Arc<Mutex<Vec<SyncSender<VdfCheckpoint>>>>,
    ) {
        // Pace substeps so the chain advances at the network's target
        // rate instead of saturating a core.
        let substep_target = Duration::from_secs_f64(
            VDF_SUBSTEP_ITERATIONS as f64 / VDF_TARGET_ITERS_PER_SEC as f64,
        );

        while running.load(Ordering::SeqCst) {
            if paused.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(50));
                continue;
            }

            let segment_start = shared.read().unwrap().state;
            let mut state = segment_start;
            let mut done: u64 = 0;
            let mut cancelled = false;

            while done < VDF_CHECKPOINT_INTERVAL {
                let substep_started = Instant::now();
                let step = VDF_SUBSTEP_ITERATIONS.min(VDF_CHECKPOINT_INTERVAL - done);
                state = chain_steps(&state, step);
                done += step;

                if !running.load(Ordering::SeqCst) {
                    cancelled = true;
                    break;
                }

                let elapsed = substep_started.elapsed();
                if elapsed < substep_target {
                    thread::sleep(substep_target - elapsed);
                }
            }

            if cancelled {
                // No partial checkpoint on cancellation.
                break;
            }

            let checkpoint = {
                let mut guard = shared.write().unwrap();
                guard.state = state;
                guard.total_iterations += done;
                let checkpoint = VdfCheckpoint {
                    input: guard.input,
                    output: state,
                    segment_iterations: done,
                    total_iterations: guard.total_iterations,
                    proof: VdfProof {
                        segment_start,
                        segment_iterations: done,
                        segment_end: state,
                    },
                    timestamp_ms: now_ms(),
                };
                guard.last_checkpoint = Some(checkpoint.clone());
                checkpoint
            };

            debug!(
                "VDF checkpoint: {} iterations total, output {}",
                checkpoint.total_iterations,
                checkpoint.output.short()
            );

            let mut subs = subscribers.lock().unwrap();
            subs.retain(|tx| match tx.try_send(checkpoint.clone()) {
                Ok(()) => true,
                Err(mpsc::TrySendError::Full(_)) => {
                    warn!("VDF subscriber lagging, checkpoint dropped");
                    true
                }
                Err(mpsc::TrySendError::Disconnected(_)) => false,
            });
        }
    }
}

impl Drop for VdfEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
