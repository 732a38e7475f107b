//! Canonical thread assembly.
//!
//! Split into a pure half and a stateful half: [`tree`] deterministically
//! materializes a member set into a forest (placeholders, parent links,
//! cycle guard), and [`assembler`] drives key resolution, membership
//! updates, and merges against the shared state store with
//! compare-and-retry.

pub mod assembler;
pub mod tree;

pub use assembler::{AttachError, ThreadAssembler};
pub use tree::{ThreadTree, rebuild};
