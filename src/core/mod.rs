//! Core deterministic primitives.
//!
//! All types in this module are designed for perfect cross-platform
//! determinism. Round outcomes computed here must replay identically
//! from the same seed on any host.

pub mod fixed;
pub mod rng;

// Re-export core types
pub use fixed::{Fixed, FIXED_HALF, FIXED_ONE, FIXED_SCALE};
pub use rng::DeterministicRng;
