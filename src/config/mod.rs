//! Configuration models for the scheduler and its engine.

pub mod manager;

pub use manager::ManagerConfig;
