//! Testing utilities and mock implementations
//!
//! Lets the relay be exercised end to end without a running broker.

pub mod mocks;

pub use mocks::*;
