//! Worker process: engine wiring, built-in handlers, and the admin HTTP surface.

pub mod app;
pub mod handlers;
pub mod settings;
pub mod shutdown;
