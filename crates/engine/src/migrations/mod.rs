//! Migration System
//!
//! Entity model, file loading and scaffolding, tracking tables, and the
//! [`Manager`] that runs both pipelines.

pub mod definitions;
pub mod loader;
pub mod manager;
pub mod scaffold;
pub mod tracking;

pub use definitions::*;
pub use loader::FileLoader;
pub use manager::Manager;
