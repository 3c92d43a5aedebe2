//! Infrastructure layer: configuration, job stores, and the worker runtime.

pub mod config;
pub mod jobs;
