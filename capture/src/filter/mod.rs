pub mod gate;
pub mod ssim;
pub mod traits;

pub use gate::SimilarityGate;
pub use ssim::{to_gray, ScoreError, Ssim};
pub use traits::SimilarityScorer;
