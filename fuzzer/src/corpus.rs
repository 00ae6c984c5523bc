//! Seed corpus storage and weighted selection.

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use crate::rng::Rng;

/// Default cap on the number of entries retained; beyond this, new entries no longer
/// displace existing ones (the corpus simply stops growing).
pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct Entry {
    pub data: Vec<u8>,
    pub score: u64,
    pub picks: u64,
}

struct Inner {
    entries: Vec<Entry>,
    rng: Rng,
    capacity: usize,
}

/// A thread-safe pool of test cases, favoring entries with a higher score-to-picks
/// ratio: `weight = max(1, score / (1 + picks/8))`.
pub struct Corpus {
    inner: Mutex<Inner>,
    max_size: usize,
}

impl Corpus {
    /// Creates an empty corpus whose internal selection RNG is seeded from `seed`, so
    /// that a fixed global seed yields a fully reproducible `pick()` sequence for a
    /// single worker thread. `max_size` bounds every stored entry's data length.
    pub fn new(seed: u64, max_size: usize) -> Self {
        Self::with_capacity(seed, max_size, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(seed: u64, max_size: usize, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                rng: Rng::new(seed),
                capacity,
            }),
            max_size,
        }
    }

    /// Loads every regular file in `dir` as a seed entry with score 1; empty files are
    /// skipped and oversized ones truncated to `max_size`. Missing or unreadable files
    /// are skipped (logged at warn level) rather than aborting the whole load. If
    /// nothing is loaded, injects the literal `"seed"` so the corpus is never empty.
    pub fn load_dir(&self, dir: &Path) -> std::io::Result<usize> {
        let mut loaded = 0;
        if dir.is_dir() {
            let mut paths: Vec<_> = fs::read_dir(dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            paths.sort();
            let mut inner = self.inner.lock().expect("corpus lock poisoned");
            for path in paths {
                match fs::read(&path) {
                    Ok(mut data) => {
                        if data.is_empty() {
                            continue;
                        }
                        data.truncate(self.max_size.max(1));
                        inner.entries.push(Entry {
                            data,
                            score: 1,
                            picks: 0,
                        });
                        loaded += 1;
                    }
                    Err(e) => log::warn!("corpus: skipping {}: {e}", path.display()),
                }
            }
        }
        if loaded == 0 {
            self.add(b"seed".to_vec(), 1);
        }
        Ok(loaded)
    }

    /// Adds an entry unless the corpus is already at capacity. `data` is truncated to
    /// `max_size`; `score == 0` is coerced to 1.
    pub fn add(&self, mut data: Vec<u8>, score: u64) {
        data.truncate(self.max_size.max(1));
        let mut inner = self.inner.lock().expect("corpus lock poisoned");
        if inner.entries.len() >= inner.capacity {
            return;
        }
        inner.entries.push(Entry {
            data,
            score: score.max(1),
            picks: 0,
        });
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("corpus lock poisoned").entries.len()
    }

    /// Weighted-random selection: `weight(e) = max(1, score / (1 + picks/8))`.
    /// Increments the chosen entry's pick count. Returns `None` only if the corpus is
    /// empty (which should not occur once [`Corpus::load_dir`] has run).
    pub fn pick(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().expect("corpus lock poisoned");
        if inner.entries.is_empty() {
            return None;
        }
        let weights: Vec<u64> = inner
            .entries
            .iter()
            .map(|e| (e.score / (1 + e.picks / 8)).max(1))
            .collect();
        let total: u64 = weights.iter().sum();
        let mut roll = if total == 0 { 0 } else { inner.rng.next_u64() % total };
        let mut chosen = inner.entries.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            if roll < *w {
                chosen = i;
                break;
            }
            roll -= *w;
        }
        inner.entries[chosen].picks += 1;
        Some(inner.entries[chosen].data.clone())
    }

    /// Picks two independent entries for crossover (with replacement).
    pub fn pick_pair(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let a = self.pick()?;
        let b = self.pick()?;
        Some((a, b))
    }
}
