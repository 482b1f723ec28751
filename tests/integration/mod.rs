//! Integration test suite for swarm-router.
//!
//! These tests drive requests through classification, arbitration, and
//! execution together, with scripted executors standing in for workers.
//!
//! # Test Categories
//!
//! - `routing_e2e`: Free text to routed output, and stage-tagged rejections
//! - `hierarchical_e2e`: Subordinate outputs handed to the lead
//! - `cancellation`: Stop causes reported on steps that never ran
//! - `parallel_steps`: Independent step outcomes under the parallel strategy
//! - `circuit_breaker`: Exclusion after repeated failures and recovery
//! - `concurrency`: Capacity and circuit invariants under concurrent load
//!
//! # CI Compatibility
//!
//! No test spawns external processes or sleeps on the wall clock; timing
//! tests run with tokio's paused clock.

mod fixtures;

mod cancellation;
mod circuit_breaker;
mod concurrency;
mod hierarchical_e2e;
mod parallel_steps;
mod routing_e2e;
