// CPU side of the frame fence.

/// Monotonic counter paired with a GPU fence. Every frame signals the next
/// value; a command list is only reused once that value has completed.
#[derive(Debug, Default)]
pub struct FrameFence {
    value: u64,
}

impl FrameFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the value the coming signal will use.
    pub fn next(&mut self) -> u64 {
        self.value += 1;
        self.value
    }

    /// Last value handed out (0 before the first frame).
    #[cfg(test)]
    pub fn current(&self) -> u64 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_step_by_one() {
        let mut fence = FrameFence::new();
        assert_eq!(fence.current(), 0);
        let values: Vec<u64> = (0..4).map(|_| fence.next()).collect();
        assert_eq!(values, vec![1, 2, 3, 4]);
        assert_eq!(fence.current(), 4);
    }
}
