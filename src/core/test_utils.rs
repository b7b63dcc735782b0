//! Test utilities for arena-based testing.
//!
//! A selection pass borrows its scratch arena from the embedding host; these
//! helpers give tests the same shape with a test-owned arena.
