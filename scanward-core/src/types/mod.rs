//! Shared identifier types.

pub mod ids;
