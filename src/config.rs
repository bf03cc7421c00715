//! Configuration types and loading.

pub mod persistence;
pub mod types;
