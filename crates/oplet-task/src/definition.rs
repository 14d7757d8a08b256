//! Typed task schema declared by an image.

use serde::{Deserialize, Serialize};

/// Task definition assembled from the image's label namespace. Fetched live
/// from the registry; never persisted.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Definition {
    pub name: String,
    pub description: String,
    pub author: String,
    pub url: String,
    pub image_ref: String,
    /// End-user-set at submission time.
    pub inputs: Vec<Input>,
    /// Admin-set at task creation time.
    pub configuration: Vec<Input>,
}

/// One declared input or configuration item.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Input {
    pub name: String,
    pub input_type: InputType,
    pub value_type: ValueType,
    pub description: String,
    pub required: bool,
}

/// How a value is delivered to the container.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// Injected as an environment variable.
    Env,
    /// Materialized as a file under the inputs mount.
    File,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Env => "env",
            Self::File => "file",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "env" => Some(Self::Env),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// Shape of the value the submitter provides.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Text,
    Number,
    File,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::File => "file",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "number" => Some(Self::Number),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}
