//! Worker pool and shared fuzzing state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use std::collections::HashSet;

use crate::corpus::Corpus;
use crate::coverage::Coverage;
use crate::executor::{self, ExecConfig, ExecResult};
use crate::mutator::{Dict, Mutator};
use crate::rng::Rng;
use crate::triage::{self, CrashInfo};
use crate::util::now_iso8601;

/// Run-wide configuration shared by every worker.
pub struct RunConfig {
    pub argv_template: Vec<String>,
    pub out_dir: PathBuf,
    pub iterations: u64,
    pub threads: u64,
    pub timeout_ms: u64,
    pub mem_mb: u64,
    pub max_size: usize,
    pub seed: u64,
    pub allowed_exits: Vec<i32>,
}

/// Summary returned once every worker has exhausted the iteration budget.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub iterations_done: u64,
    pub crashes: u64,
    pub saved: u64,
    pub corpus_size: usize,
}

struct Shared {
    corpus: Corpus,
    seen: Mutex<HashSet<String>>,
    iter_done: AtomicU64,
    crashes: AtomicU64,
    saved: AtomicU64,
    crash_id: AtomicU64,
}

/// Runs the configured number of worker threads to completion and returns the
/// aggregate summary. Each worker owns its own `Mutator` (seeded per-worker) and
/// `ExecConfig`; all workers share one `Corpus` and one seen-signatures set.
pub fn run(cfg: RunConfig, dict: Dict, corpus: Corpus) -> RunSummary {
    let shared = Arc::new(Shared {
        corpus,
        seen: Mutex::new(HashSet::new()),
        iter_done: AtomicU64::new(0),
        crashes: AtomicU64::new(0),
        saved: AtomicU64::new(0),
        crash_id: AtomicU64::new(0),
    });
    let cfg = Arc::new(cfg);
    let dict = Arc::new(dict);

    let threads = cfg.threads.max(1);
    let mut handles = Vec::with_capacity(threads as usize);
    for worker_idx in 0..threads {
        let shared = Arc::clone(&shared);
        let cfg = Arc::clone(&cfg);
        let dict = Arc::clone(&dict);
        handles.push(thread::spawn(move || {
            worker_loop(worker_idx, &cfg, &dict, &shared);
        }));
    }
    for h in handles {
        let _ = h.join();
    }

    RunSummary {
        iterations_done: shared.iter_done.load(Ordering::Relaxed).min(cfg.iterations),
        crashes: shared.crashes.load(Ordering::Relaxed),
        saved: shared.saved.load(Ordering::Relaxed),
        corpus_size: shared.corpus.size(),
    }
}

fn worker_loop(worker_idx: u64, cfg: &RunConfig, dict: &Dict, shared: &Shared) {
    let worker_seed = Rng::worker_seed(cfg.seed, worker_idx);
    let mut mutator = Mutator::new(Rng::new(worker_seed), cfg.max_size, dict.clone());

    let mut coverage = Coverage::new();
    if !coverage.setup() {
        log::warn!("worker {worker_idx}: coverage setup failed, running without feedback");
    }

    loop {
        let done = shared.iter_done.fetch_add(1, Ordering::Relaxed);
        if done >= cfg.iterations {
            break;
        }

        let crossover_turn = (cfg.seed.wrapping_add(done)) % 5 == 0;
        let input = if crossover_turn && shared.corpus.size() >= 2 {
            match shared.corpus.pick_pair() {
                Some((a, b)) => mutator.crossover(&a, &b),
                None => continue,
            }
        } else {
            match shared.corpus.pick() {
                Some(seed) => mutator.mutate(&seed),
                None => continue,
            }
        };

        coverage.reset();
        let exec_cfg = ExecConfig {
            timeout_ms: cfg.timeout_ms,
            mem_mb: cfg.mem_mb,
            cov_shm_name: coverage.shm_name().to_string(),
        };
        let result = executor::run(&cfg.argv_template, &input, &exec_cfg);
        let info = triage::analyze_and_sig(
            result.exit_code,
            result.term_signal,
            result.timed_out,
            &result.stdout,
            &result.stderr,
            &cfg.allowed_exits,
        );

        if info.crashed {
            shared.crashes.fetch_add(1, Ordering::Relaxed);
            let mut seen = shared.seen.lock().expect("seen-set lock poisoned");
            if seen.insert(info.signature.clone()) {
                let id = shared.crash_id.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = save_crash(&cfg.out_dir, id, &input, &result, &info) {
                    log::warn!("failed to persist crash {id}: {e}");
                } else {
                    shared.saved.fetch_add(1, Ordering::Relaxed);
                }
            }
        } else {
            let new_edge = coverage.is_active() && coverage.has_new_edge();
            let sample = (cfg.seed.wrapping_add(done)) & 0xFF;
            if new_edge || sample < 3 {
                shared.corpus.add(input, 1);
            }
        }
        coverage.merge();

        if done > 0 && done % 1000 == 0 {
            log::info!(
                "worker {worker_idx}: {done}/{} iterations, {} crashes, {} saved, corpus {}",
                cfg.iterations,
                shared.crashes.load(Ordering::Relaxed),
                shared.saved.load(Ordering::Relaxed),
                shared.corpus.size(),
            );
        }
    }
}

/// Writes `crash-<id>.bin` (raw reproducer) and `crash-<id>.meta.txt` (human-readable
/// metadata) into `out_dir`.
fn save_crash(
    out_dir: &Path,
    id: u64,
    data: &[u8],
    result: &ExecResult,
    info: &CrashInfo,
) -> std::io::Result<()> {
    std::fs::create_dir_all(out_dir)?;
    let bin_path = out_dir.join(format!("crash-{id}.bin"));
    let meta_path = out_dir.join(format!("crash-{id}.meta.txt"));

    std::fs::write(&bin_path, data)?;

    let meta = format!(
        "time: {}\nreason: {}\nsignature: {}\nexit_code: {}\nterm_signal: {}\ntimed_out: {}\nstdout:\n{}\nstderr:\n{}\n",
        now_iso8601(),
        info.reason,
        info.signature,
        result.exit_code,
        result.term_signal,
        result.timed_out,
        String::from_utf8_lossy(&result.stdout),
        String::from_utf8_lossy(&result.stderr),
    );
    std::fs::write(&meta_path, meta)?;
    Ok(())
}
