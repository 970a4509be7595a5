//! Interoperability helpers bridging kernels with host tensor layouts.

pub mod heads;

pub use heads::{attend_packed, merge_heads, split_heads};
