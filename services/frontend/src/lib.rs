//! Query frontend service library.
//!
//! # Purpose
//! Exposes the frontend subsystems (config, HTTP handler, querier RPC,
//! pending-result correlation, observability) for the frontend binary
//! and the integration tests.
pub mod config;
pub mod error;
pub mod frontend;
pub mod handler;
pub mod observability;
pub mod rpc;
