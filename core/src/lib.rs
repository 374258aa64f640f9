//! Core packed structures of packtree.
//!
//! A tree node is a fixed-size block sub-divided by a [`packed::PackedAllocator`] into
//! tagged, independently resizable segments. Each segment holds one packed structure:
//! a multi-column sum tree, a symbol sequence, a plain array or a sparse optional array.
//! The structures carry an embedded multi-level index giving logarithmic prefix-sum,
//! rank and select queries.
//!
//! [`Accumulator`] is the fixed-width aggregate propagated from a node to its ancestors.

pub mod accumulator;
pub mod packed;

pub use accumulator::{Accumulator, ACCUMULATOR_WIDTH};
