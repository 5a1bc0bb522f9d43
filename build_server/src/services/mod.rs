//! Build engine services.

pub mod artifact_service;
pub mod customizer;
pub mod drivers;
pub mod error_service;
pub mod executor;
pub mod job_service;
pub mod process;
pub mod scheduler;
pub mod workspace;
