//! Configuration and core types
//!
//! Domain types, the error enum, config loading and validation.

pub mod loader;
pub mod types;
pub mod validator;
