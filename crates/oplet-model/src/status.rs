//! Execution status and log-source enums with their stable wire strings.

use serde::{Deserialize, Serialize};

/// Persisted status of a task execution.
///
/// The string forms are stable: they appear in the database, in the runner
/// protocol, and in system log lines. `Killed` is a legal terminal state
/// reserved for external cancellation; nothing transitions into it today.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskExecutionStatus {
    Pending,
    PullingImage,
    ImagePulled,
    CreatingContainer,
    ContainerCreated,
    UploadingFiles,
    FilesUploaded,
    StartingContainer,
    ContainerStarted,
    Running,
    Finished,
    DownloadingFiles,
    FilesDownloaded,
    Succeeded,
    Failed,
    Killed,
}

impl TaskExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PullingImage => "pulling_image",
            Self::ImagePulled => "image_pulled",
            Self::CreatingContainer => "creating_container",
            Self::ContainerCreated => "container_created",
            Self::UploadingFiles => "uploading_files",
            Self::FilesUploaded => "files_uploaded",
            Self::StartingContainer => "starting_container",
            Self::ContainerStarted => "container_started",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::DownloadingFiles => "downloading_files",
            Self::FilesDownloaded => "files_downloaded",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "pulling_image" => Some(Self::PullingImage),
            "image_pulled" => Some(Self::ImagePulled),
            "creating_container" => Some(Self::CreatingContainer),
            "container_created" => Some(Self::ContainerCreated),
            "uploading_files" => Some(Self::UploadingFiles),
            "files_uploaded" => Some(Self::FilesUploaded),
            "starting_container" => Some(Self::StartingContainer),
            "container_started" => Some(Self::ContainerStarted),
            "running" => Some(Self::Running),
            "finished" => Some(Self::Finished),
            "downloading_files" => Some(Self::DownloadingFiles),
            "files_downloaded" => Some(Self::FilesDownloaded),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "killed" => Some(Self::Killed),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Killed)
    }
}

impl Default for TaskExecutionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin of a recorded log line.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Container,
    System,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::System => "system",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "container" => Some(Self::Container),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        let all = [
            TaskExecutionStatus::Pending,
            TaskExecutionStatus::PullingImage,
            TaskExecutionStatus::ImagePulled,
            TaskExecutionStatus::CreatingContainer,
            TaskExecutionStatus::ContainerCreated,
            TaskExecutionStatus::UploadingFiles,
            TaskExecutionStatus::FilesUploaded,
            TaskExecutionStatus::StartingContainer,
            TaskExecutionStatus::ContainerStarted,
            TaskExecutionStatus::Running,
            TaskExecutionStatus::Finished,
            TaskExecutionStatus::DownloadingFiles,
            TaskExecutionStatus::FilesDownloaded,
            TaskExecutionStatus::Succeeded,
            TaskExecutionStatus::Failed,
            TaskExecutionStatus::Killed,
        ];
        for status in all {
            assert_eq!(TaskExecutionStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TaskExecutionStatus::from_str("resumed"), None);
    }

    #[test]
    fn status_serializes_as_snake_case() {
        let json = serde_json::to_string(&TaskExecutionStatus::PullingImage).unwrap();
        assert_eq!(json, "\"pulling_image\"");
        let back: TaskExecutionStatus = serde_json::from_str("\"container_started\"").unwrap();
        assert_eq!(back, TaskExecutionStatus::ContainerStarted);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskExecutionStatus::Succeeded.is_terminal());
        assert!(TaskExecutionStatus::Failed.is_terminal());
        assert!(TaskExecutionStatus::Killed.is_terminal());
        assert!(!TaskExecutionStatus::Running.is_terminal());
    }
}
