//! Domain models for the offline registry.

mod actor;
mod patient;
mod queue;

pub use actor::*;
pub use patient::*;
pub use queue::*;
