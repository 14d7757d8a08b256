//! SQLite-backed persistent store: tasks, executions, logs, files, runners.
//!
//! A single writer connection behind a mutex serializes all access, so
//! queued-write contention degrades to waiting instead of transient lock
//! errors. The execution queue's claim path additionally runs under the
//! busy-retry helper for the cases where the engine still reports busy.

pub mod entities;
pub mod error;
pub mod execution;
pub mod runner;
pub mod store;
pub mod task;
pub mod token;

pub use entities::{
    NewTask, NewTaskExecution, Runner, Task, TaskConfiguration, TaskExecution, TaskExecutionFile,
    TaskExecutionLog,
};
pub use error::StoreError;
pub use execution::{ExecutionRepository, ExecutionStatusUpdate};
pub use runner::{RunnerRepository, EMBEDDED_RUNNER_NAME};
pub use store::Store;
pub use task::TaskRepository;
pub use token::{random_token, RUNNER_TOKEN_BYTES};
