//! Core types for state distributions and measurement records

pub mod gaussian;
pub mod measurement;
