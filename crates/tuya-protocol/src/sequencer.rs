//! Transaction ID management
//!
//! Tuya requires the transaction ID to advance with each command. One
//! sequencer belongs to one physical device and is never shared.

/// Wrapping 0-255 transaction counter
#[derive(Debug, Default, Clone)]
pub struct Sequencer {
    current: u8,
}

impl Sequencer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the current transaction ID and advance
    pub fn next(&mut self) -> u8 {
        let id = self.current;
        self.current = self.current.wrapping_add(1);
        id
    }

    /// The ID the next call to [`Sequencer::next`] will return
    #[must_use]
    pub fn peek(&self) -> u8 {
        self.current
    }

    /// Reset to 0 (recovery, testing)
    pub fn reset(&mut self) {
        self.current = 0;
        tracing::debug!("Transaction ID reset to 0");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraps_after_255() {
        let mut seq = Sequencer::new();
        for expected in 0..=255u8 {
            assert_eq!(seq.next(), expected);
        }
        assert_eq!(seq.next(), 0);
    }

    #[test]
    fn test_reset() {
        let mut seq = Sequencer::new();
        seq.next();
        seq.next();
        assert_eq!(seq.peek(), 2);
        seq.reset();
        assert_eq!(seq.next(), 0);
    }
}
