//! Rpcgate - an on-demand reverse proxy for a JSON-RPC backend cluster
//!
//! This library provides a proxy that:
//! - Fronts a backend cluster that is expensive to keep running
//! - Starts the cluster on first traffic, with concurrent callers sharing one startup
//! - Polls a JSON-RPC health probe until the cluster is ready, within a deadline
//! - Forwards requests byte-for-byte once the cluster is up
//! - Stops the cluster after a configurable period without traffic

pub mod cluster;
pub mod config;
pub mod error;
pub mod forward;
pub mod lifecycle;
pub mod probe;
pub mod proxy;
