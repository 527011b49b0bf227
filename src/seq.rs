//! Wrapping sequence number arithmetic.
//!
//! Sequence numbers grow without bound and are compared modulo 2^64, so a
//! stream can run forever without a reset. Two sequence numbers are only
//! meaningfully ordered when they are within 2^63 of each other, which is
//! always the case for the ring depths used here.

/// Returns `a - b` as a signed distance.
///
/// Positive when `a` is ahead of `b`, negative when behind.
#[inline(always)]
pub fn seq_diff(a: u64, b: u64) -> i64 {
    a.wrapping_sub(b) as i64
}

#[inline(always)]
pub fn seq_inc(a: u64, delta: u64) -> u64 {
    a.wrapping_add(delta)
}

#[inline(always)]
pub fn seq_dec(a: u64, delta: u64) -> u64 {
    a.wrapping_sub(delta)
}

#[inline(always)]
pub fn seq_gt(a: u64, b: u64) -> bool {
    seq_diff(a, b) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_is_signed_distance() {
        assert_eq!(seq_diff(10, 3), 7);
        assert_eq!(seq_diff(3, 10), -7);
        assert_eq!(seq_diff(5, 5), 0);
    }

    #[test]
    fn ordering_survives_wrap_around() {
        let before_wrap = u64::MAX - 1;
        let after_wrap = seq_inc(before_wrap, 4);
        assert_eq!(after_wrap, 2);
        assert!(seq_gt(after_wrap, before_wrap), "2 must be after u64::MAX-1");
        assert!(!seq_gt(before_wrap, after_wrap));
        assert_eq!(seq_diff(after_wrap, before_wrap), 4);
        assert_eq!(seq_dec(after_wrap, 4), before_wrap);
    }
}
