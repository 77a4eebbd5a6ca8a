//! Integer conversions between wire widths and in-memory sizes.

/// Widening conversions that can not lose information on any supported platform.
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self.into()
    }
}

/// For narrowing casts where the caller has already checked the range, e.g. a payload length
///  that was validated against [crate::packet::MAX_LINK_PAYLOAD_SIZE].
///
/// NB: The implementations panic if that check was missed
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("value range should have been checked by the caller")
    }
}

impl PrecheckedCast<u32> for u64 {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("value range should have been checked by the caller")
    }
}

/// Saturating conversion for values that are bounded in practice but come from untrusted input
pub trait SaturatingCast<T> {
    fn saturating_cast(self) -> T;
}

impl SaturatingCast<u32> for usize {
    fn saturating_cast(self) -> u32 {
        self.try_into().unwrap_or(u32::MAX)
    }
}

impl SaturatingCast<i32> for u64 {
    fn saturating_cast(self) -> i32 {
        self.try_into().unwrap_or(i32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 0)]
    #[case::small(17, 17)]
    #[case::max(u32::MAX as usize, u32::MAX)]
    #[case::beyond(u32::MAX as usize + 1, u32::MAX)]
    fn test_saturating_usize_to_u32(#[case] value: usize, #[case] expected: u32) {
        let actual: u32 = value.saturating_cast();
        assert_eq!(actual, expected);
    }

    #[rstest]
    #[case::small(5, 5)]
    #[case::max(i32::MAX as u64, i32::MAX)]
    #[case::beyond(i32::MAX as u64 + 1, i32::MAX)]
    fn test_saturating_u64_to_i32(#[case] value: u64, #[case] expected: i32) {
        let actual: i32 = value.saturating_cast();
        assert_eq!(actual, expected);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_cast_panics_out_of_range() {
        let _: u32 = (u32::MAX as u64 + 1).prechecked_cast();
    }
}
