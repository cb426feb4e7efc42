//! Anonymous memory regions backing value slices.
//!
//! Two kinds of region are produced:
//!
//! - **Device** regions model the fast, budget-limited tier. They are mapped
//!   with a hugepage preference (explicit 2MB pages, falling back to regular
//!   pages with a THP hint) and pre-faulted so first access is not penalized.
//! - **Pinned** regions model page-locked host memory. They are mapped with
//!   regular pages and locked with `mlock`. If the process is not allowed to
//!   lock that much memory the region is kept unlocked and a warning is
//!   logged.
//!
//! Both kinds are zero filled by the kernel.

use std::io;
use std::ptr::NonNull;
use tracing::{debug, warn};

const KB: usize = 1024;
const MB: usize = 1024 * KB;
const PAGE: usize = 4 * KB;

/// Hugepage preference for device regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HugepageSize {
    /// Regular pages with a transparent hugepage hint.
    #[default]
    None,
    /// Explicit 2MB hugepages (MAP_HUGETLB), falling back to regular pages.
    TwoMegabyte,
}

/// Page size actually used for a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatedPageSize {
    /// Explicit 2MB hugepages.
    TwoMegabyte,
    /// Regular 4KB pages (possibly backed by THP).
    Regular,
}

impl std::fmt::Display for AllocatedPageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocatedPageSize::TwoMegabyte => write!(f, "2MB hugepages"),
            AllocatedPageSize::Regular => write!(f, "4KB pages"),
        }
    }
}

/// An owned anonymous mapping, unmapped on drop.
#[derive(Debug)]
pub struct Region {
    ptr: NonNull<u8>,
    requested_size: usize,
    allocated_size: usize,
    page_size: AllocatedPageSize,
    locked: bool,
}

// SAFETY: the region is plain memory owned by this value. Concurrent access
// to its contents is coordinated by the bucket locks of the table.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Base pointer (page aligned).
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size that was asked for.
    pub fn requested_size(&self) -> usize {
        self.requested_size
    }

    /// Mapped size after rounding to the page size.
    pub fn allocated_size(&self) -> usize {
        self.allocated_size
    }

    /// Page size used for the mapping.
    pub fn page_size(&self) -> AllocatedPageSize {
        self.page_size
    }

    /// Whether the region is locked into physical memory.
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            if self.locked {
                libc::munlock(self.ptr.as_ptr() as *const libc::c_void, self.allocated_size);
            }
            let result = libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.allocated_size);
            debug_assert_eq!(result, 0, "munmap failed");
        }
    }
}

#[inline]
fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

fn invalid_size() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "cannot allocate zero bytes")
}

/// Map a device-tier region of at least `size` bytes.
pub fn allocate_device(size: usize, hugepage_size: HugepageSize) -> io::Result<Region> {
    if size == 0 {
        return Err(invalid_size());
    }

    if hugepage_size == HugepageSize::TwoMegabyte {
        let rounded = round_up(size, 2 * MB);
        match map_hugetlb(rounded) {
            Ok(ptr) => {
                prefault(ptr, rounded, 2 * MB);
                debug!(bytes = rounded, "mapped device region with 2MB hugepages");
                return Ok(Region {
                    ptr,
                    requested_size: size,
                    allocated_size: rounded,
                    page_size: AllocatedPageSize::TwoMegabyte,
                    locked: false,
                });
            }
            Err(e) => {
                warn!(error = %e, bytes = rounded, "2MB hugepage mapping failed, using regular pages");
            }
        }
    }

    let rounded = round_up(size, PAGE);
    let ptr = map_regular(rounded)?;

    // Best-effort transparent hugepage hint.
    #[cfg(target_os = "linux")]
    unsafe {
        let _ = libc::madvise(ptr.as_ptr() as *mut libc::c_void, rounded, libc::MADV_HUGEPAGE);
    }

    prefault(ptr, rounded, PAGE);
    debug!(bytes = rounded, "mapped device region with regular pages");

    Ok(Region {
        ptr,
        requested_size: size,
        allocated_size: rounded,
        page_size: AllocatedPageSize::Regular,
        locked: false,
    })
}

/// Map a pinned host-tier region of at least `size` bytes.
pub fn allocate_pinned(size: usize) -> io::Result<Region> {
    if size == 0 {
        return Err(invalid_size());
    }

    let rounded = round_up(size, PAGE);
    let ptr = map_regular(rounded)?;

    let locked = unsafe { libc::mlock(ptr.as_ptr() as *const libc::c_void, rounded) } == 0;
    if !locked {
        warn!(
            error = %io::Error::last_os_error(),
            bytes = rounded,
            "mlock failed, host region left unpinned"
        );
    } else {
        debug!(bytes = rounded, "mapped pinned host region");
    }

    Ok(Region {
        ptr,
        requested_size: size,
        allocated_size: rounded,
        page_size: AllocatedPageSize::Regular,
        locked,
    })
}

fn map_regular(size: usize) -> io::Result<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    NonNull::new(ptr as *mut u8).ok_or_else(io::Error::last_os_error)
}

#[cfg(target_os = "linux")]
fn map_hugetlb(size: usize) -> io::Result<NonNull<u8>> {
    // MAP_HUGE_2MB = 21 << MAP_HUGE_SHIFT
    const MAP_HUGE_SHIFT: libc::c_int = 26;
    let flags =
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB | (21 << MAP_HUGE_SHIFT);

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    NonNull::new(ptr as *mut u8).ok_or_else(io::Error::last_os_error)
}

#[cfg(not(target_os = "linux"))]
fn map_hugetlb(_size: usize) -> io::Result<NonNull<u8>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "hugepages not supported on this platform",
    ))
}

/// Touch every page so physical memory is committed up front.
fn prefault(ptr: NonNull<u8>, size: usize, page_size: usize) {
    unsafe {
        for offset in (0..size).step_by(page_size) {
            std::ptr::write_volatile(ptr.as_ptr().add(offset), 0);
        }
    }
}
