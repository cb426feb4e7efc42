//! Element types stored in the table: keys, metas and vector values.

use std::fmt::Debug;
use std::hash::Hash;

/// Integer key type.
///
/// `EMPTY` is the sentinel marking a free slot. It can never be stored.
pub trait Key: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Sentinel for unoccupied slots.
    const EMPTY: Self;

    /// Whether this key is the empty-slot sentinel.
    #[inline]
    fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

/// Ordering value used to choose eviction victims.
///
/// Smaller metas are evicted first. Auto-assigned metas come from a per-bucket
/// counter converted through [`Meta::from_counter`].
pub trait Meta: Copy + Ord + Debug + Send + Sync + 'static {
    /// Largest representable meta. An empty bucket reports this as its minimum.
    const MAX: Self;

    /// Convert a bucket's recency counter to a meta.
    fn from_counter(counter: u64) -> Self;
}

/// Plain-old-data vector element.
///
/// # Safety
///
/// Implementors must be valid for every bit pattern, including all zeroes,
/// and contain no padding. Value slices are raw anonymous mappings that are
/// handed out as `&[Self]` without initialization beyond zero fill.
pub unsafe trait Value: Copy + Default + PartialEq + Debug + Send + Sync + 'static {}

macro_rules! impl_key {
    ($($t:ty),*) => {
        $(impl Key for $t {
            const EMPTY: Self = <$t>::MAX;
        })*
    };
}

impl_key!(u64, i64, u32, i32);

impl Meta for u64 {
    const MAX: Self = u64::MAX;

    #[inline]
    fn from_counter(counter: u64) -> Self {
        counter
    }
}

impl Meta for i64 {
    const MAX: Self = i64::MAX;

    #[inline]
    fn from_counter(counter: u64) -> Self {
        counter.min(i64::MAX as u64) as i64
    }
}

impl Meta for u32 {
    const MAX: Self = u32::MAX;

    #[inline]
    fn from_counter(counter: u64) -> Self {
        counter.min(u32::MAX as u64) as u32
    }
}

macro_rules! impl_value {
    ($($t:ty),*) => {
        $(unsafe impl Value for $t {})*
    };
}

impl_value!(f32, f64, u8, i8, u16, i16, u32, i32, u64, i64);

/// View a value buffer as bytes.
#[inline]
pub(crate) fn value_bytes<V: Value>(values: &[V]) -> &[u8] {
    // SAFETY: `Value` types have no padding, so every byte is initialized.
    unsafe { std::slice::from_raw_parts(values.as_ptr() as *const u8, std::mem::size_of_val(values)) }
}

/// View a value buffer as mutable bytes.
#[inline]
pub(crate) fn value_bytes_mut<V: Value>(values: &mut [V]) -> &mut [u8] {
    let len = std::mem::size_of_val(values);
    // SAFETY: `Value` types accept any bit pattern.
    unsafe { std::slice::from_raw_parts_mut(values.as_mut_ptr() as *mut u8, len) }
}
