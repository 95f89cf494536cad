//! Infrastructure adapters for task persistence.

pub mod store;

pub use store::{InMemoryTaskStore, JsonlTaskStore};
