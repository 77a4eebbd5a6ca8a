use std::fmt::{Debug, Display, Formatter};

/// Per-connection sequence number of a sequenced packet (data, close, option).
///
/// Sequence numbers are 64 bit and start at [SeqNo::FIRST], so they never wrap around during the
///  lifetime of a connection and a value is never handed out twice. [SeqNo::ZERO] is used as the
///  ack sequence meaning 'nothing received yet'.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct SeqNo(u64);

impl Display for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Debug for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl SeqNo {
    pub const ZERO: SeqNo = SeqNo(0);
    pub const FIRST: SeqNo = SeqNo(1);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn next(self) -> SeqNo {
        self.plus(1)
    }

    /// Saturates instead of overflowing - a connection can not send 2^64 packets
    pub fn plus(self, n: u64) -> SeqNo {
        SeqNo(self.0.saturating_add(n))
    }

    /// the predecessor, [SeqNo::ZERO] stays at zero
    pub fn prev(self) -> SeqNo {
        SeqNo(self.0.saturating_sub(1))
    }

    /// number of sequence numbers from `other` (inclusive) to `self` (exclusive), `None` if
    ///  `other` is after `self`
    pub fn distance_from(self, other: SeqNo) -> Option<u64> {
        self.0.checked_sub(other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::same(5, 5, Some(0))]
    #[case::after(9, 5, Some(4))]
    #[case::before(5, 9, None)]
    fn test_distance_from(#[case] this: u64, #[case] other: u64, #[case] expected: Option<u64>) {
        assert_eq!(SeqNo::from_raw(this).distance_from(SeqNo::from_raw(other)), expected);
    }

    #[test]
    fn test_prev_saturates() {
        assert_eq!(SeqNo::ZERO.prev(), SeqNo::ZERO);
        assert_eq!(SeqNo::FIRST.prev(), SeqNo::ZERO);
        assert_eq!(SeqNo::from_raw(u64::MAX).next(), SeqNo::from_raw(u64::MAX));
    }

    #[test]
    fn test_debug() {
        assert_eq!(format!("{:?}", SeqNo::from_raw(17)), "#17");
        assert_eq!(format!("{}", SeqNo::from_raw(17)), "17");
    }
}
