//! AppForge build engine.
//!
//! Turns a website configuration into installable Android and iOS packages:
//! jobs are queued, run one per worker in an isolated copy of a Capacitor
//! template, built with the native toolchains, and their packages stored
//! for download.

pub mod config;
pub mod events;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
