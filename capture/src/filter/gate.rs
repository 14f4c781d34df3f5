use camdrop_common::config::Sensitivity;

/// Duplicate classification for continuous capture.
///
/// A frame is a duplicate when its score is *strictly greater* than the
/// threshold. Raising the sensitivity raises the threshold, which makes it
/// harder for a frame to count as a duplicate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityGate {
    threshold: f64,
}

impl SimilarityGate {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn for_sensitivity(sensitivity: Sensitivity) -> Self {
        Self::new(sensitivity.threshold())
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn is_duplicate(&self, score: f64) -> bool {
        score > self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_itself_is_not_a_duplicate() {
        let gate = SimilarityGate::new(0.90);
        assert!(!gate.is_duplicate(0.90));
        assert!(gate.is_duplicate(0.9000001));
        assert!(!gate.is_duplicate(0.5));
    }

    #[test]
    fn higher_sensitivity_discards_less() {
        let score = 0.96;
        assert!(SimilarityGate::for_sensitivity(Sensitivity::Low).is_duplicate(score));
        assert!(SimilarityGate::for_sensitivity(Sensitivity::Medium).is_duplicate(score));
        assert!(!SimilarityGate::for_sensitivity(Sensitivity::High).is_duplicate(score));
    }

    #[test]
    fn nan_never_counts_as_duplicate() {
        assert!(!SimilarityGate::new(0.9).is_duplicate(f64::NAN));
    }
}
