//! Tiered storage for bucket value arrays.
//!
//! [`TierAllocator`] owns every value slice of a table. A slice is one
//! contiguous region holding the value arrays of `buckets_per_slice`
//! consecutive buckets. Slices are placed in the device tier while the
//! device budget (`max_hbm_for_vectors`) can hold them and spill to pinned
//! host memory afterwards.
//!
//! Buckets never own their storage. They are given a [`SliceHandle`]
//! (slice index + bucket offset) that the table resolves to a raw pointer
//! when it builds a bucket generation. Growing the table appends slices for
//! the new buckets; existing slices and their placement are kept, so the
//! fill-device-first order survives every resize.

use crate::error::{TableError, TableResult};
use crate::region::{HugepageSize, Region, allocate_device, allocate_pinned};
use std::io;
use std::ptr::NonNull;
use tracing::debug;

const PAGE: usize = 4096;

/// Memory tier backing a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Fast, budget-limited memory.
    Device,
    /// Large, slower pinned host memory.
    Host,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Device => write!(f, "device"),
            Tier::Host => write!(f, "host"),
        }
    }
}

/// Location of one bucket's value array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceHandle {
    /// Index of the slice in the allocator.
    pub slice: u32,
    /// Bucket position within the slice.
    pub offset: u32,
}

/// Bytes and slice counts per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierUsage {
    /// Bytes mapped in the device tier.
    pub device_bytes: usize,
    /// Bytes mapped in the host tier.
    pub host_bytes: usize,
    /// Number of device slices.
    pub device_slices: usize,
    /// Number of host slices.
    pub host_slices: usize,
}

struct Slice {
    region: Region,
    tier: Tier,
}

/// Owner of all value slices of a table.
pub struct TierAllocator {
    slices: Vec<Slice>,
    handles: Vec<SliceHandle>,
    bucket_bytes: usize,
    buckets_per_slice: usize,
    max_hbm: usize,
    remaining_hbm: usize,
    hugepage_size: HugepageSize,
    /// Slices `grow_to` may still map before failing.
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl TierAllocator {
    /// Create an allocator with no slices.
    ///
    /// `bucket_bytes` is the size of one bucket's value array. Each slice
    /// holds as many buckets as fit in `max_slice_bytes` (at least one).
    pub fn new(
        bucket_bytes: usize,
        max_slice_bytes: usize,
        max_hbm: usize,
        hugepage_size: HugepageSize,
    ) -> Self {
        debug_assert!(bucket_bytes > 0);
        let buckets_per_slice = (max_slice_bytes / bucket_bytes).max(1);
        Self {
            slices: Vec::new(),
            handles: Vec::new(),
            bucket_bytes,
            buckets_per_slice,
            max_hbm,
            remaining_hbm: max_hbm,
            hugepage_size,
            #[cfg(test)]
            fail_after: None,
        }
    }

    /// Make the next `grow_to` fail after mapping `slices` slices.
    #[cfg(test)]
    pub(crate) fn fail_after(&mut self, slices: usize) {
        self.fail_after = Some(slices);
    }

    /// Number of buckets with storage.
    #[inline]
    pub fn num_buckets(&self) -> usize {
        self.handles.len()
    }

    /// Size of one bucket's value array in bytes.
    #[inline]
    pub fn bucket_bytes(&self) -> usize {
        self.bucket_bytes
    }

    /// Buckets per full slice.
    #[inline]
    pub fn buckets_per_slice(&self) -> usize {
        self.buckets_per_slice
    }

    /// Device budget in bytes.
    #[inline]
    pub fn max_hbm(&self) -> usize {
        self.max_hbm
    }

    /// Device budget not yet allocated.
    #[inline]
    pub fn remaining_hbm(&self) -> usize {
        self.remaining_hbm
    }

    /// Handle of a bucket's value array.
    #[inline]
    pub fn handle(&self, bucket: usize) -> SliceHandle {
        self.handles[bucket]
    }

    /// Tier backing a bucket.
    pub fn tier_of(&self, bucket: usize) -> Tier {
        self.slices[self.handles[bucket].slice as usize].tier
    }

    /// Resolve a handle to the start of its value array.
    #[inline]
    pub fn resolve(&self, handle: SliceHandle) -> NonNull<u8> {
        let slice = &self.slices[handle.slice as usize];
        let offset = handle.offset as usize * self.bucket_bytes;
        debug_assert!(offset + self.bucket_bytes <= slice.region.allocated_size());
        // SAFETY: offset stays inside the slice, checked when the slice was sized.
        unsafe { NonNull::new_unchecked(slice.region.as_ptr().add(offset)) }
    }

    /// Pointer to a bucket's value array.
    #[inline]
    pub fn bucket_ptr(&self, bucket: usize) -> NonNull<u8> {
        self.resolve(self.handles[bucket])
    }

    /// Per-tier usage.
    pub fn usage(&self) -> TierUsage {
        let mut usage = TierUsage::default();
        for slice in &self.slices {
            match slice.tier {
                Tier::Device => {
                    usage.device_bytes += slice.region.allocated_size();
                    usage.device_slices += 1;
                }
                Tier::Host => {
                    usage.host_bytes += slice.region.allocated_size();
                    usage.host_slices += 1;
                }
            }
        }
        usage
    }

    /// Extend storage to cover `num_buckets` buckets.
    ///
    /// On failure every slice mapped by this call is released and the device
    /// budget is restored; the allocator is left as it was.
    pub fn grow_to(&mut self, num_buckets: usize) -> TableResult<()> {
        let hugepage_size = self.hugepage_size;
        #[cfg(test)]
        let mut fail_after = self.fail_after.take();
        self.grow_with(num_buckets, |tier, bytes| {
            #[cfg(test)]
            if let Some(left) = fail_after.as_mut() {
                if *left == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::OutOfMemory,
                        "injected allocation failure",
                    ));
                }
                *left -= 1;
            }
            match tier {
                Tier::Device => allocate_device(bytes, hugepage_size),
                Tier::Host => allocate_pinned(bytes),
            }
        })
    }

    fn grow_with<F>(&mut self, num_buckets: usize, mut alloc: F) -> TableResult<()>
    where
        F: FnMut(Tier, usize) -> io::Result<Region>,
    {
        let first_slice = self.slices.len();
        let first_bucket = self.handles.len();
        let saved_remaining = self.remaining_hbm;

        let mut bucket = first_bucket;
        while bucket < num_buckets {
            let count = self.buckets_per_slice.min(num_buckets - bucket);
            let bytes = count * self.bucket_bytes;

            match self.map_slice(bytes, &mut alloc) {
                Ok(slice) => {
                    let slice_index = self.slices.len() as u32;
                    debug!(
                        slice = slice_index,
                        tier = %slice.tier,
                        buckets = count,
                        bytes = slice.region.allocated_size(),
                        remaining_hbm = self.remaining_hbm,
                        "mapped value slice"
                    );
                    self.slices.push(slice);
                    self.handles.extend((0..count as u32).map(|offset| SliceHandle {
                        slice: slice_index,
                        offset,
                    }));
                }
                Err(e) => {
                    self.slices.truncate(first_slice);
                    self.handles.truncate(first_bucket);
                    self.remaining_hbm = saved_remaining;
                    return Err(e);
                }
            }

            bucket += count;
        }

        Ok(())
    }

    /// Map one slice, preferring the device tier while the budget allows.
    fn map_slice<F>(&mut self, bytes: usize, alloc: &mut F) -> TableResult<Slice>
    where
        F: FnMut(Tier, usize) -> io::Result<Region>,
    {
        let page_rounded = bytes.div_ceil(PAGE) * PAGE;
        if self.remaining_hbm >= page_rounded {
            let region = alloc(Tier::Device, bytes).map_err(|source| {
                TableError::AllocationFailure {
                    tier: Tier::Device,
                    bytes,
                    source,
                }
            })?;

            // Hugepage rounding may overshoot the budget; such a slice goes to host.
            if let Some(remaining) = self.remaining_hbm.checked_sub(region.allocated_size()) {
                self.remaining_hbm = remaining;
                return Ok(Slice {
                    region,
                    tier: Tier::Device,
                });
            }
        }

        let region = alloc(Tier::Host, bytes).map_err(|source| TableError::AllocationFailure {
            tier: Tier::Host,
            bytes,
            source,
        })?;

        Ok(Slice {
            region,
            tier: Tier::Host,
        })
    }
}
