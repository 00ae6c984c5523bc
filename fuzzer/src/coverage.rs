//! Host side of the coverage channel: owns a shared-memory edge-hit bitmap and the
//! cumulative total-coverage bitmap it is compared against.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

/// Length of the coverage region, in bytes. Fixed at a power of two.
pub const MAP_SIZE: usize = 1 << 17;

static NEXT_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A process-local handle onto one shared-memory coverage region.
///
/// Each worker owns a distinct `Coverage` (derived from pid plus a per-worker counter)
/// so concurrent workers never collide in kernel shared-memory namespace.
pub struct Coverage {
    shm_name: String,
    map_ptr: *mut u8,
    total: Box<[u8; MAP_SIZE]>,
}

// SAFETY: `map_ptr` refers to a shared-memory mapping owned exclusively by this
// `Coverage`, which is used by exactly one worker thread at a time; we don't rely on
// `Coverage` being `Sync`, only `Send` so a worker thread can own one.
unsafe impl Send for Coverage {}

impl Coverage {
    /// Creates an unmapped `Coverage`; call [`Coverage::setup`] before use.
    pub fn new() -> Self {
        Self {
            shm_name: String::new(),
            map_ptr: std::ptr::null_mut(),
            total: Box::new([0u8; MAP_SIZE]),
        }
    }

    /// Creates a uniquely named shared-memory object of size [`MAP_SIZE`] and maps it
    /// read-write. Returns `false` (logging a warning) on any failure; the caller
    /// continues without coverage feedback.
    pub fn setup(&mut self) -> bool {
        let counter = NEXT_COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!("/fuzz_{}_{}", std::process::id(), counter);

        let fd = match shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o600),
        ) {
            Ok(fd) => fd,
            Err(e) => {
                log::warn!("coverage: shm_open failed: {e}");
                return false;
            }
        };

        if let Err(e) = ftruncate(&fd, MAP_SIZE as i64) {
            log::warn!("coverage: ftruncate failed: {e}");
            let _ = shm_unlink(name.as_str());
            return false;
        }

        let len = NonZeroUsize::new(MAP_SIZE).expect("MAP_SIZE is non-zero");
        // SAFETY: `fd` is backed by a just-truncated shared-memory object of at least
        // `len` bytes; the mapping is torn down in `Drop`.
        let map = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                Some(&fd),
                0,
            )
        };

        match map {
            Ok(ptr) => {
                self.shm_name = name;
                self.map_ptr = ptr.as_ptr() as *mut u8;
                true
            }
            Err(e) => {
                log::warn!("coverage: mmap failed: {e}");
                let _ = shm_unlink(name.as_str());
                false
            }
        }
    }

    fn map(&self) -> &[u8] {
        if self.map_ptr.is_null() {
            &[]
        } else {
            // SAFETY: map_ptr, when non-null, points at a MAP_SIZE-byte shared mapping
            // for the lifetime of this Coverage.
            unsafe { std::slice::from_raw_parts(self.map_ptr, MAP_SIZE) }
        }
    }

    /// Zeroes the entire region. Must be called before every executor invocation.
    pub fn reset(&self) {
        if self.map_ptr.is_null() {
            return;
        }
        // SAFETY: see `map()`.
        unsafe { std::ptr::write_bytes(self.map_ptr, 0, MAP_SIZE) };
    }

    /// `true` if any index has a hit this run that was never seen before.
    pub fn has_new_edge(&self) -> bool {
        let map = self.map();
        map.iter()
            .zip(self.total.iter())
            .any(|(&hit, &seen)| hit != 0 && seen == 0)
    }

    /// Appends the index of every new edge to `out`, returning the count appended.
    pub fn collect_new_edges(&self, out: &mut Vec<u32>) -> usize {
        let map = self.map();
        let mut count = 0;
        for (i, (&hit, &seen)) in map.iter().zip(self.total.iter()).enumerate() {
            if hit != 0 && seen == 0 {
                out.push(i as u32);
                count += 1;
            }
        }
        count
    }

    /// Folds this run's hits into the cumulative total-coverage bitmap.
    pub fn merge(&mut self) {
        let map_ptr = self.map_ptr;
        if map_ptr.is_null() {
            return;
        }
        // SAFETY: see `map()`.
        let map = unsafe { std::slice::from_raw_parts(map_ptr, MAP_SIZE) };
        for (seen, &hit) in self.total.iter_mut().zip(map.iter()) {
            if hit != 0 {
                *seen = 1;
            }
        }
    }

    /// Name of the shared-memory object, for propagation to children via `__FUZZ_SHARE`.
    pub fn shm_name(&self) -> &str {
        &self.shm_name
    }

    /// Whether [`Coverage::setup`] succeeded.
    pub fn is_active(&self) -> bool {
        !self.map_ptr.is_null()
    }
}

impl Default for Coverage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Coverage {
    fn drop(&mut self) {
        if !self.map_ptr.is_null() {
            // SAFETY: map_ptr was returned by a successful mmap of MAP_SIZE bytes and is
            // not aliased elsewhere once this Coverage is dropped.
            unsafe {
                let _ = munmap(
                    std::ptr::NonNull::new_unchecked(self.map_ptr.cast()),
                    MAP_SIZE,
                );
            }
        }
        if !self.shm_name.is_empty() {
            let _ = shm_unlink(self.shm_name.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_coverage_reports_no_new_edges() {
        let cov = Coverage::new();
        assert!(!cov.is_active());
        assert!(!cov.has_new_edge());
        let mut out = Vec::new();
        assert_eq!(cov.collect_new_edges(&mut out), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn setup_reset_merge_roundtrip() {
        let mut cov = Coverage::new();
        assert!(cov.setup(), "shm_open/mmap should succeed in a test sandbox");
        assert!(cov.shm_name().starts_with("/fuzz_"));

        cov.reset();
        assert!(!cov.has_new_edge());

        // SAFETY: test-only direct write into our own just-mapped region.
        unsafe {
            std::ptr::write(cov.map_ptr.add(5), 1);
            std::ptr::write(cov.map_ptr.add(9), 3);
        }
        assert!(cov.has_new_edge());

        let mut edges = Vec::new();
        let n = cov.collect_new_edges(&mut edges);
        assert_eq!(n, 2);
        assert_eq!(edges, vec![5, 9]);

        cov.merge();
        assert!(!cov.has_new_edge(), "merge should fold hits into total");

        // collect_new_edges after merge with an unchanged map is idempotent.
        let mut edges2 = Vec::new();
        assert_eq!(cov.collect_new_edges(&mut edges2), 0);
        assert!(edges2.is_empty());
    }

    #[test]
    fn has_new_edge_iff_collect_nonempty() {
        let mut cov = Coverage::new();
        assert!(cov.setup());
        unsafe {
            std::ptr::write(cov.map_ptr.add(100), 9);
        }
        let mut out = Vec::new();
        assert_eq!(cov.has_new_edge(), cov.collect_new_edges(&mut out) > 0);
    }

    #[test]
    fn distinct_coverage_objects_get_distinct_names() {
        let mut a = Coverage::new();
        let mut b = Coverage::new();
        assert!(a.setup());
        assert!(b.setup());
        assert_ne!(a.shm_name(), b.shm_name());
    }
}
