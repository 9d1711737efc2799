//! Test utilities
//!
//! Available in both test and production builds so integration tests can
//! use the same fixture builders as unit tests.

pub mod fixtures;
