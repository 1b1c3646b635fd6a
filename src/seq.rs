/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */

//! Sequence number comparisons modulo 2^32.

#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn seq_leq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[inline]
pub fn seq_geq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// `low <= current <= high`. A zeroed range (`low == high == 0`) accepts anything,
/// which is the state of a tracker that has not seen its peer yet.
#[inline]
pub fn is_between(low: u32, high: u32, current: u32) -> bool {
    if low == 0 && high == 0 {
        return true;
    }
    seq_geq(current, low) && seq_leq(current, high)
}

/// Bigger of two sequence numbers.
#[inline]
pub fn seq_max(a: u32, b: u32) -> u32 {
    if seq_geq(a, b) {
        a
    } else {
        b
    }
}

/// Smaller of two sequence numbers.
#[inline]
pub fn seq_min(a: u32, b: u32) -> u32 {
    if seq_leq(a, b) {
        a
    } else {
        b
    }
}
