//! Debug assertion macros for buffer invariants.
//!
//! Active only in debug builds, so there is zero overhead in release
//! builds. Messages state the violated condition; the checks cover block
//! conservation, run bounds and double-free detection in the free list.

/// Assert that a block run lies inside the block array.
macro_rules! debug_assert_run_in_bounds {
    ($start:expr, $len:expr, $total:expr) => {
        debug_assert!(
            $len > 0 && $start < $total && $total - $start >= $len,
            "block run [{}, +{}) escapes array of {} blocks",
            $start,
            $len,
            $total
        )
    };
}

/// Assert that a block being pushed to the free list is not already free.
///
/// Pushing the same block twice corrupts the list linkage; the mark table
/// makes the violation detectable here.
macro_rules! debug_assert_not_free {
    ($mark:expr, $idx:expr) => {
        debug_assert!(
            $mark == crate::freelist::FreeMark::None,
            "block {} pushed to free list twice",
            $idx
        )
    };
}

/// Assert block conservation: every block is free, staged, or in flight.
macro_rules! debug_assert_conservation {
    ($free:expr, $staged:expr, $in_flight:expr, $total:expr) => {
        debug_assert!(
            $free + $staged + $in_flight <= $total,
            "block accounting exceeds capacity: {} free + {} staged + {} in flight > {}",
            $free,
            $staged,
            $in_flight,
            $total
        )
    };
}

pub(crate) use debug_assert_conservation;
pub(crate) use debug_assert_not_free;
pub(crate) use debug_assert_run_in_bounds;
