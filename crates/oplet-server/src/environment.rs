//! Container environment assembly from input parameters and task
//! configuration.

use std::collections::HashMap;

use serde_json::Value;

use oplet_store::TaskConfiguration;
use oplet_task::{Definition, InputType};

/// Merges the submitter's non-file input parameters with the task's
/// admin-set configuration values. File inputs are delivered through the
/// inputs mount instead and never appear here.
pub fn build_environment(
    definition: &Definition,
    input_parameters: &str,
    configurations: &[TaskConfiguration],
) -> HashMap<String, String> {
    let mut environment = HashMap::new();

    if !input_parameters.is_empty() {
        match serde_json::from_str::<HashMap<String, Value>>(input_parameters) {
            Ok(parameters) => {
                for input in &definition.inputs {
                    if input.input_type == InputType::File {
                        continue;
                    }
                    if let Some(value) = parameters.get(&input.name) {
                        environment.insert(input.name.clone(), stringify(value));
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not parse input parameters");
            }
        }
    }

    for configuration in configurations {
        let declared = definition
            .configuration
            .iter()
            .any(|input| input.name == configuration.name);
        if declared {
            environment.insert(configuration.name.clone(), configuration.value.clone());
        }
    }

    environment
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oplet_task::{Input, ValueType};

    fn definition() -> Definition {
        Definition {
            name: "hello".into(),
            image_ref: "registry/example/hello:latest".into(),
            inputs: vec![
                Input {
                    name: "greeting".into(),
                    input_type: InputType::Env,
                    value_type: ValueType::Text,
                    description: String::new(),
                    required: true,
                },
                Input {
                    name: "count".into(),
                    input_type: InputType::Env,
                    value_type: ValueType::Number,
                    description: String::new(),
                    required: false,
                },
                Input {
                    name: "payload".into(),
                    input_type: InputType::File,
                    value_type: ValueType::File,
                    description: String::new(),
                    required: false,
                },
            ],
            configuration: vec![Input {
                name: "LOG_LEVEL".into(),
                input_type: InputType::Env,
                value_type: ValueType::Text,
                description: String::new(),
                required: false,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn merges_parameters_and_configuration() {
        let environment = build_environment(
            &definition(),
            r#"{"greeting":"world","count":3,"payload":"ignored.bin"}"#,
            &[TaskConfiguration {
                name: "LOG_LEVEL".into(),
                value: "debug".into(),
            }],
        );

        assert_eq!(environment.get("greeting").map(String::as_str), Some("world"));
        assert_eq!(environment.get("count").map(String::as_str), Some("3"));
        assert_eq!(environment.get("LOG_LEVEL").map(String::as_str), Some("debug"));
        // File inputs travel through the inputs mount, not the environment.
        assert!(!environment.contains_key("payload"));
    }

    #[test]
    fn undeclared_configuration_is_dropped() {
        let environment = build_environment(
            &definition(),
            "",
            &[TaskConfiguration {
                name: "UNDECLARED".into(),
                value: "x".into(),
            }],
        );
        assert!(environment.is_empty());
    }

    #[test]
    fn malformed_parameters_degrade_to_configuration_only() {
        let environment = build_environment(
            &definition(),
            "{not json",
            &[TaskConfiguration {
                name: "LOG_LEVEL".into(),
                value: "warn".into(),
            }],
        );
        assert_eq!(environment.len(), 1);
        assert_eq!(environment.get("LOG_LEVEL").map(String::as_str), Some("warn"));
    }

    #[test]
    fn booleans_become_canonical_strings() {
        let environment = build_environment(&definition(), r#"{"greeting":true}"#, &[]);
        assert_eq!(environment.get("greeting").map(String::as_str), Some("true"));
    }
}
