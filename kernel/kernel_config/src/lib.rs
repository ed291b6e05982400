//! Configuration constants used across the per-CPU slab core.
//!
//! These are fixed at build time. Values that can change at runtime,
//! such as a cache's `cpu_partial` limit, start from the defaults here
//! and are then adjusted through the owning cache.

#![no_std]

pub mod memory;
