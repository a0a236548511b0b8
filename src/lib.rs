//! Front-door request gateway of a FaaS runtime.
//!
//! External clients submit function invocations over HTTP or gRPC; the
//! gateway admits them, dispatches each to a locally-connected worker
//! process over a Unix-socket message protocol, and returns the result.
//! Payloads over the inline limit travel through named shared-memory
//! regions instead of the IPC channel.

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod func_config;
pub mod gateway;
pub mod grpc;
pub mod message_connection;
pub mod metrics;
pub mod protocol;
pub mod routes;
pub mod service;
pub mod shm;
pub mod worker_manager;

#[cfg(test)]
mod integration_test;
