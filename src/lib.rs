//! Fleetquota - Distributed Fixed-Window Quota Enforcement
//!
//! This crate gates requests flowing through a multi-node pipeline against a
//! quota shared by the whole fleet. Every node publishes its own usage under a
//! window-scoped key in a shared expiring store, and admission is decided from
//! the sum of all nodes' contributions.

pub mod config;
pub mod error;
pub mod mesh;
pub mod pipeline;
pub mod ratelimit;
