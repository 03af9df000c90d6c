//! Portable, exact scaled dot-product attention.
//!
//! This path favours numerical fidelity over raw speed and backs every
//! [`MultiHeadAttention`](crate::MultiHeadAttention) module.

pub mod exact;

pub use exact::ExactAttention;
