//! Pure, deterministic engine logic.
//!
//! Nothing in this module performs I/O or talks to the oracle; everything is
//! testable in isolation and must stay deterministic across runs.

pub mod budget;
pub mod context;
pub mod deps;
pub mod eligible;
pub mod plan;
