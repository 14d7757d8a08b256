//! Runner: leases executions from the coordinator, drives the container
//! executor and streams progress, logs and outputs back.

pub mod client;
pub mod config;
pub mod runner;

pub use client::{Client, ClientError};
pub use config::RunnerConfig;
pub use runner::Runner;
