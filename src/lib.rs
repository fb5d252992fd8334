//! GAMMSIM: Monte Carlo type-I error simulation for GAMM strategies
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod data;
pub mod model;
pub mod simulation;
pub mod storage;
pub mod harness;
