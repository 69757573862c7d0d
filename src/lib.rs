//! Rategate - Fixed-Window Rate Limiting for gRPC Handlers
//!
//! This crate implements an admission gate placed in front of RPC method
//! handlers. Each call is attributed to an identity, checked against global
//! and per-method fixed-window rules held in a shared counter store, and
//! either passed to its handler or rejected with the names of every exceeded
//! rule.

pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
