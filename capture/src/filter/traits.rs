use image::GrayImage;

use super::ssim::ScoreError;

/// Scores how alike two consecutive frames are.
///
/// Implementations receive grayscale rasters of the previously kept frame
/// and the new candidate and return a similarity in `[-1, 1]`, where 1
/// means identical.
pub trait SimilarityScorer: Send + Sync {
    fn score(&mut self, prior: &GrayImage, candidate: &GrayImage) -> Result<f64, ScoreError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}
