//! Chainforge - declarative content-generation chains
//!
//! This library crate exposes the built-in adapters for the CLI and for
//! integration testing. The engine itself lives in `cf-pipeline`.

pub mod adapters;

pub use adapters::default_registry;
