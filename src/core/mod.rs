pub mod features;
pub mod index;
pub mod matcher;
pub mod preprocess;
pub mod ransac;

pub use features::{Descriptor, FeatureExtractor, Keypoint, DESCRIPTOR_LEN};
pub use index::{CandidateVotes, MatchIndex};
pub use matcher::{subject_in_namespace, MatchEngine};
pub use preprocess::preprocess;
pub use ransac::{ransac_similarity, RansacFit, SimilarityTransform};
