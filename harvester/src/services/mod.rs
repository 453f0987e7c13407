//! Service layer module.

pub mod container;

pub use container::ServiceContainer;
