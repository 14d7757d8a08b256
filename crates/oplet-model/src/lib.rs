//! Shared execution vocabulary and runner-protocol wire models.

pub mod protocol;
pub mod status;

pub use protocol::{
    HeartbeatResponse, InputFileInfo, LogEntry, TaskInputsResponse, TaskOutputsResponse,
    TaskRequestResponse, TaskStatusRequest, TaskStatusResponse, TaskTraceRequest,
    TaskTraceResponse,
};
pub use status::{LogSource, TaskExecutionStatus};
