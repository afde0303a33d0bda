//! Virtual memory reservation
//!
//! The heap lives in one reserved range that must end below the colored
//! address space, so the reservation asks for addresses starting at 1TB and
//! rejects anything the kernel places elsewhere.

use crate::colored::ADDRESS_SPACE;
use crate::error::{GcError, GcResult};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// First address tried for a reservation
const HINT_BASE: usize = 1 << 40;
/// Spacing between successive reservation hints
const HINT_STEP: usize = 1 << 34;
const MAX_ATTEMPTS: usize = 64;

static NEXT_HINT: AtomicUsize = AtomicUsize::new(HINT_BASE);

/// System page size
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        {
            // SAFETY: sysconf has no preconditions
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size > 0 { size as usize } else { 4096 }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    })
}

/// A reserved, readable and writable address range
#[derive(Debug)]
pub struct VirtualRange {
    base: usize,
    size: usize,
}

impl VirtualRange {
    /// Reserve `size` bytes below [`ADDRESS_SPACE`]
    pub fn reserve(size: usize) -> GcResult<Self> {
        if size == 0 || size > ADDRESS_SPACE - HINT_BASE {
            return Err(GcError::HeapInitialization(format!(
                "cannot reserve {size} bytes"
            )));
        }
        let step = size.div_ceil(HINT_STEP).max(1) * HINT_STEP;

        for _ in 0..MAX_ATTEMPTS {
            let hint = next_hint(step);
            let base = os::reserve(hint, size)?;
            if base + size <= ADDRESS_SPACE {
                tracing::debug!(
                    target: "hue::gc",
                    base = %format!("{base:#x}"),
                    size,
                    "reserved heap range"
                );
                return Ok(Self { base, size });
            }
            os::release(base, size);
        }
        Err(GcError::HeapInitialization(format!(
            "no {size}-byte range available below {ADDRESS_SPACE:#x}"
        )))
    }

    /// First byte of the range
    pub fn base(&self) -> usize {
        self.base
    }

    /// Length of the range
    pub fn size(&self) -> usize {
        self.size
    }

    /// End of the range (exclusive)
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Whether `addr` lies inside the range
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    /// Hand the pages of `[start, start+len)` back to the OS; they read as zero afterwards
    pub fn decommit(&self, start: usize, len: usize) {
        debug_assert!(self.contains(start) && start + len <= self.end());
        os::decommit(start, len);
    }
}

impl Drop for VirtualRange {
    fn drop(&mut self) {
        os::release(self.base, self.size);
    }
}

fn next_hint(step: usize) -> usize {
    let mut current = NEXT_HINT.load(Ordering::Relaxed);
    loop {
        let (hint, next) = if current + step > ADDRESS_SPACE {
            (HINT_BASE, HINT_BASE + step)
        } else {
            (current, current + step)
        };
        match NEXT_HINT.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return hint,
            Err(actual) => current = actual,
        }
    }
}

#[cfg(unix)]
mod os {
    use crate::error::{GcError, GcResult};

    pub(super) fn reserve(hint: usize, size: usize) -> GcResult<usize> {
        // SAFETY: anonymous private mapping; the hint is only advisory
        let ptr = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(GcError::HeapInitialization(format!(
                "mmap of {size} bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(ptr as usize)
    }

    pub(super) fn release(base: usize, size: usize) {
        // SAFETY: the range was obtained from mmap with this length
        unsafe {
            libc::munmap(base as *mut libc::c_void, size);
        }
    }

    pub(super) fn decommit(start: usize, len: usize) {
        // SAFETY: the range is inside our own anonymous mapping
        let rc = unsafe { libc::madvise(start as *mut libc::c_void, len, libc::MADV_DONTNEED) };
        if rc != 0 {
            tracing::warn!(
                target: "hue::gc",
                error = %std::io::Error::last_os_error(),
                "madvise failed; zeroing instead"
            );
            // SAFETY: as above, the range is mapped read/write
            unsafe { std::ptr::write_bytes(start as *mut u8, 0, len) };
        }
    }
}

#[cfg(not(unix))]
mod os {
    use crate::error::{GcError, GcResult};
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    const ALIGN: usize = 1 << 21;

    pub(super) fn reserve(_hint: usize, size: usize) -> GcResult<usize> {
        let layout = Layout::from_size_align(size, ALIGN)
            .map_err(|e| GcError::HeapInitialization(e.to_string()))?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(GcError::HeapInitialization(format!(
                "allocation of {size} bytes failed"
            )));
        }
        Ok(ptr as usize)
    }

    pub(super) fn release(base: usize, size: usize) {
        if let Ok(layout) = Layout::from_size_align(size, ALIGN) {
            // SAFETY: allocated in reserve() with the same layout
            unsafe { dealloc(base as *mut u8, layout) };
        }
    }

    pub(super) fn decommit(start: usize, len: usize) {
        // SAFETY: inside our own allocation
        unsafe { std::ptr::write_bytes(start as *mut u8, 0, len) };
    }
}
