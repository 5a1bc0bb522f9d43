//! Build engine data models.

pub mod artifact;
pub mod job;
pub mod snapshot;
