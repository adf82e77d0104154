use std::fmt;

/// Generates consecutive RTP sequence numbers and counts wraps.
#[derive(Clone)]
pub struct Sequencer {
    sequence_number: u16,
    roll_over_count: u64,
}

impl fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequencer")
            .field("sequence_number", &self.sequence_number)
            .field("roll_over_count", &self.roll_over_count)
            .finish()
    }
}

impl Sequencer {
    /// Starts from a random sequence number, as RFC 3550 recommends.
    pub fn new_random() -> Self {
        Self {
            sequence_number: rand::random::<u16>(),
            roll_over_count: 0,
        }
    }

    /// The first call to [`Sequencer::next_sequence_number`] returns `s + 1`.
    pub fn new_fixed(s: u16) -> Self {
        Self {
            sequence_number: s,
            roll_over_count: 0,
        }
    }

    pub fn next_sequence_number(&mut self) -> u16 {
        self.sequence_number = self.sequence_number.wrapping_add(1);
        if self.sequence_number == 0 {
            self.roll_over_count += 1;
        }
        self.sequence_number
    }

    pub fn roll_over_count(&self) -> u64 {
        self.roll_over_count
    }
}

/// Extends 16-bit sequence numbers into a monotonic 64-bit space, tolerating
/// reordering within half the sequence space.
#[derive(Debug, Default, Clone)]
pub struct SequenceUnwrapper {
    last: Option<i64>,
}

impl SequenceUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unwrap(&mut self, seq: u16) -> i64 {
        let unwrapped = match self.last {
            None => seq as i64,
            Some(last) => {
                let delta = seq.wrapping_sub(last as u16) as i16 as i64;
                last + delta
            }
        };

        if self.last.is_none_or(|last| unwrapped > last) {
            self.last = Some(unwrapped);
        }
        unwrapped
    }

    /// Extends `seq` relative to the highest value seen without recording it.
    pub fn peek(&self, seq: u16) -> i64 {
        match self.last {
            None => seq as i64,
            Some(last) => last + seq.wrapping_sub(last as u16) as i16 as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequencer_wraps() {
        let mut s = Sequencer::new_fixed(65534);
        assert_eq!(s.next_sequence_number(), 65535);
        assert_eq!(s.next_sequence_number(), 0);
        assert_eq!(s.roll_over_count(), 1);
        assert_eq!(s.next_sequence_number(), 1);
    }

    #[test]
    fn test_unwrapper() {
        let mut u = SequenceUnwrapper::new();
        let tests = vec![
            (65534u16, 65534i64),
            (65535, 65535),
            (0, 65536),
            (65533, 65533),
            (2, 65538),
        ];

        for (seq, expected) in tests {
            assert_eq!(u.unwrap(seq), expected, "seq {seq}");
        }
        assert_eq!(u.peek(3), 65539);
    }
}
