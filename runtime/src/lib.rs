//! Instrumentation runtime linked into fuzz targets.
//!
//! Provides the `__sanitizer_cov_trace_pc_guard*` and `__sanitizer_cov_trace_cmp*`
//! symbols a trace-PC-guard-instrumented binary calls into. On first use the runtime
//! maps the shared coverage region named by the `__FUZZ_SHARE` environment variable
//! and increments edge-hit counters into it; if the variable is absent or the mapping
//! fails, every symbol here is a no-op and the target runs uninstrumented.

use std::cell::Cell;
use std::env;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Once;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, shm_open, MapFlags, ProtFlags};
use nix::sys::stat::Mode;

/// Name of the environment variable carrying the shared-memory object name.
pub const SHM_ENV_VAR: &str = "__FUZZ_SHARE";

/// Size of the coverage region, in bytes. Must match the host's [`edgefuzz::coverage`].
pub const COV_MAP_SIZE: usize = 1 << 17;

static MAP_PTR: AtomicPtr<u8> = AtomicPtr::new(std::ptr::null_mut());
static MAP_INIT: Once = Once::new();
static NEXT_GUARD_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    /// Per-thread predecessor register used by the edge hash.
    static PREV_LOC: Cell<u32> = const { Cell::new(0) };
}

/// Lazily maps the coverage shared-memory region on first use. A no-op (and permanently
/// inert) if `__FUZZ_SHARE` is unset or the mapping fails.
fn map_ptr() -> *mut u8 {
    MAP_INIT.call_once(|| {
        if let Some(ptr) = open_and_map() {
            MAP_PTR.store(ptr, Ordering::Relaxed);
        }
    });
    MAP_PTR.load(Ordering::Relaxed)
}

fn open_and_map() -> Option<*mut u8> {
    let name = env::var(SHM_ENV_VAR).ok()?;
    if name.is_empty() {
        return None;
    }
    let fd = shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty()).ok()?;
    let len = NonZeroUsize::new(COV_MAP_SIZE)?;
    // SAFETY: `fd` refers to a POSIX shared-memory object at least COV_MAP_SIZE bytes
    // long, created by the host's Coverage::setup(). The mapping is never unmapped by
    // this process; it lives for the lifetime of the target.
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
    map.ok().map(|p| p.as_ptr() as *mut u8)
}

#[inline]
fn bump(idx: usize) {
    let ptr = map_ptr();
    if ptr.is_null() {
        return;
    }
    // SAFETY: idx is masked into [0, COV_MAP_SIZE), and ptr points at a COV_MAP_SIZE-byte
    // mapping for the remainder of the process. Concurrent increments from other threads
    // may race and lose updates; the host only tests non-zero-ness, so a torn or dropped
    // increment is harmless.
    unsafe {
        let byte = ptr.add(idx);
        let cur = byte.read_volatile();
        byte.write_volatile(cur.wrapping_add(1));
    }
}

fn record_edge(guard_id: u32) {
    PREV_LOC.with(|prev| {
        let p = prev.get();
        let idx = ((p ^ guard_id) as usize) & (COV_MAP_SIZE - 1);
        bump(idx);
        prev.set(guard_id >> 1);
    });
}

fn record_cmp(a: u64, b: u64, width: u32) {
    PREV_LOC.with(|prev| {
        let p = prev.get();
        let mixed = (a ^ b) ^ ((p as u64) << 4) ^ ((width as u64) << 1);
        let idx = (mixed as usize) & (COV_MAP_SIZE - 1);
        bump(idx);
    });
}

/// Assigns each not-yet-seen guard in `[start, stop)` a unique non-zero id.
///
/// # Safety
/// `start` and `stop` must either be equal, or both point into the same
/// instrumentation-generated array of `u32` guards, with `start <= stop`.
#[no_mangle]
pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard_init(start: *mut u32, stop: *mut u32) {
    if start.is_null() || start == stop {
        return;
    }
    let mut guard = start;
    while guard < stop {
        if *guard == 0 {
            *guard = NEXT_GUARD_ID.fetch_add(1, Ordering::Relaxed);
        }
        guard = guard.add(1);
    }
}

/// Records one edge hit for the transition ending at `guard`.
///
/// # Safety
/// `guard` must be null or point at a valid `u32` previously initialized by
/// [`__sanitizer_cov_trace_pc_guard_init`].
#[no_mangle]
pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard(guard: *mut u32) {
    if guard.is_null() {
        return;
    }
    let guard_id = *guard;
    if guard_id == 0 {
        return;
    }
    record_edge(guard_id);
}

macro_rules! trace_cmp_fns {
    ($runtime:ident, $runtime_const:ident, $ty:ty, $width:expr) => {
        #[no_mangle]
        pub extern "C" fn $runtime(arg1: $ty, arg2: $ty) {
            record_cmp(arg1 as u64, arg2 as u64, $width);
        }

        #[no_mangle]
        pub extern "C" fn $runtime_const(arg1: $ty, arg2: $ty) {
            record_cmp(arg1 as u64, arg2 as u64, $width);
        }
    };
}

trace_cmp_fns!(
    __sanitizer_cov_trace_cmp1,
    __sanitizer_cov_trace_const_cmp1,
    u8,
    1
);
trace_cmp_fns!(
    __sanitizer_cov_trace_cmp2,
    __sanitizer_cov_trace_const_cmp2,
    u16,
    2
);
trace_cmp_fns!(
    __sanitizer_cov_trace_cmp4,
    __sanitizer_cov_trace_const_cmp4,
    u32,
    4
);
trace_cmp_fns!(
    __sanitizer_cov_trace_cmp8,
    __sanitizer_cov_trace_const_cmp8,
    u64,
    8
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_init_skips_already_assigned() {
        let mut guards = [0u32, 7u32, 0u32];
        unsafe {
            let start = guards.as_mut_ptr();
            let stop = start.add(guards.len());
            __sanitizer_cov_trace_pc_guard_init(start, stop);
        }
        assert_ne!(guards[0], 0);
        assert_eq!(guards[1], 7, "pre-assigned guard must not be overwritten");
        assert_ne!(guards[2], 0);
        assert_ne!(guards[0], guards[2]);
    }

    #[test]
    fn null_guard_is_a_no_op() {
        unsafe {
            __sanitizer_cov_trace_pc_guard(std::ptr::null_mut());
        }
    }

    #[test]
    fn zero_guard_is_ignored() {
        let mut g = 0u32;
        unsafe {
            __sanitizer_cov_trace_pc_guard(&mut g as *mut u32);
        }
        // No shared memory mapped in this test process; just confirm no panic/UB.
    }

    #[test]
    fn uninstrumented_without_env_var_is_inert() {
        env::remove_var(SHM_ENV_VAR);
        let mut g = 42u32;
        unsafe {
            __sanitizer_cov_trace_pc_guard(&mut g as *mut u32);
        }
        __sanitizer_cov_trace_cmp4(1, 2);
    }
}
