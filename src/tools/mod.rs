pub mod profile;

pub use profile::{NodeProfile, NodeSummary, ProfileSummary};
