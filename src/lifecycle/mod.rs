pub mod failure;
pub mod health;

pub use failure::{FailureOutcome, FailureTracker};
pub use health::HealthPolicy;
