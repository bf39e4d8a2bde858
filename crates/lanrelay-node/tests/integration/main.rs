//! Integration test entry point for lanrelay-node.
//!
//! Everything runs over loopback on ephemeral ports.
//! Run with: cargo test --test integration

mod harness;
mod discovery;
mod transfer;
mod transport;
