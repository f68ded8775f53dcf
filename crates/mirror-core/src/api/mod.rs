//! Public client surface, split by concern.

mod builder;
mod queries;
mod session;

pub use builder::MirrorClientBuilder;
pub use queries::MutationOutcome;
