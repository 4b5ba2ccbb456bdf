use std::fmt::{Display, Formatter};

/// Sequence number of a message within one channel. Sequence numbers are 32 bits and wrap
///  around; all ordering decisions go through [`SequenceNr::is_newer_than`], which is correct
///  across the wrap as long as two compared numbers are less than half the value space apart.
///
/// Every channel (reliable, unreliable, handshake) keeps its own independent sequence state -
///  nothing relates sequence numbers across channels.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SequenceNr(u32);

impl Display for SequenceNr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNr {
    pub const ZERO: SequenceNr = SequenceNr(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    /// `a.is_newer_than(b)` <=> `(a - b) mod 2^32 < 2^31`. Note that a sequence number counts
    ///  as newer than itself - callers that want strict newness must exclude equality
    ///  themselves.
    pub fn is_newer_than(&self, other: SequenceNr) -> bool {
        self.0.wrapping_sub(other.0) < (1 << 31)
    }

    /// Returns the current value and advances by one, wrapping.
    pub fn fetch_increment(&mut self) -> SequenceNr {
        let result = *self;
        self.0 = self.0.wrapping_add(1);
        result
    }

    pub fn next(&self) -> SequenceNr {
        SequenceNr(self.0.wrapping_add(1))
    }

    pub fn plus(&self, offset: u32) -> SequenceNr {
        SequenceNr(self.0.wrapping_add(offset))
    }

    /// Number of steps from `other` up to `self`, wrapping.
    pub fn minus(&self, other: SequenceNr) -> u32 {
        self.0.wrapping_sub(other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::equal(5, 5, true)]
    #[case::one_newer(6, 5, true)]
    #[case::one_older(5, 6, false)]
    #[case::zero_zero(0, 0, true)]
    #[case::wrap_newer(0, u32::MAX, true)]
    #[case::wrap_older(u32::MAX, 0, false)]
    #[case::wrap_newer_2(5, u32::MAX - 5, true)]
    #[case::half_window_edge(1 << 31, 0, false)]
    #[case::just_below_half_window((1 << 31) - 1, 0, true)]
    #[case::high_boundary(u32::MAX, u32::MAX - 1, true)]
    fn test_is_newer_than(#[case] incoming: u32, #[case] having: u32, #[case] expected: bool) {
        let actual = SequenceNr::from_raw(incoming).is_newer_than(SequenceNr::from_raw(having));
        assert_eq!(actual, expected);

        // the definition from first principles
        let reference = incoming.wrapping_sub(having) < (1u32 << 31);
        assert_eq!(actual, reference);
    }

    #[test]
    fn test_fetch_increment_wraps() {
        let mut seq = SequenceNr::from_raw(u32::MAX);
        assert_eq!(seq.fetch_increment(), SequenceNr::from_raw(u32::MAX));
        assert_eq!(seq, SequenceNr::ZERO);
    }

    #[rstest]
    #[case(4, 3, 1)]
    #[case(3, 3, 0)]
    #[case(2, u32::MAX, 3)]
    fn test_minus(#[case] a: u32, #[case] b: u32, #[case] expected: u32) {
        assert_eq!(SequenceNr::from_raw(a).minus(SequenceNr::from_raw(b)), expected);
    }
}
