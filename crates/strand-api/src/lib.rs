//! Strand API - Node protocol definitions
//!
//! This crate provides:
//! - Node status, node info and change package models
//! - Protocol opcodes and node-to-node messages
//! - Length-prefixed frame encoding

pub mod model;
pub mod node;

// Re-export commonly used types
pub use model::*;
