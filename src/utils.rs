//! Helper functions shared by the backends and the placement code.
//! They don't particularly belong to any concrete module of the crate.


/// Rounds `to_be_aligned` up to the next multiple of `alignment`.
///
/// Used to round mapping lengths up to whole pages and to keep placement
/// hints on allocation-granularity boundaries. `alignment` must be a power
/// of two. Saturates instead of wrapping near `usize::MAX`.
pub fn align(to_be_aligned: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    to_be_aligned.saturating_add(alignment - 1) & !(alignment - 1)
}

/// Rounds `offset` down to a multiple of `alignment`.
///
/// File offsets handed to `mmap` / `MapViewOfFileEx` must be multiples of
/// the page size (allocation granularity on windows), so an arbitrary
/// `open` offset is split into an aligned part and a skew.
pub fn align_down(offset: u64, alignment: usize) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    offset & !(alignment as u64 - 1)
}
