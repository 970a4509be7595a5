//! Portable, exact implementations of scaled dot-product attention.
//!
//! These paths favour clarity over absolute performance and serve as the
//! default kernel for hosts and the baseline for tests.

pub mod exact;

pub use exact::ExactAttention;
