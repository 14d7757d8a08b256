//! Parser for the `io.oplet.task.*` label namespace.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::definition::{Definition, Input, InputType, ValueType};

pub const LABEL_PREFIX_TASK: &str = "io.oplet.task";
pub const LABEL_PREFIX_META: &str = "io.oplet.task.meta";
pub const LABEL_PREFIX_INPUTS: &str = "io.oplet.task.inputs";
pub const LABEL_PREFIX_CONFIG: &str = "io.oplet.task.config";

pub const LABEL_META_NAME: &str = "io.oplet.task.meta.name";
pub const LABEL_META_DESCRIPTION: &str = "io.oplet.task.meta.description";
pub const LABEL_META_AUTHOR: &str = "io.oplet.task.meta.author";
pub const LABEL_META_URL: &str = "io.oplet.task.meta.url";

const PROPERTY_TYPE: &str = "type";
const PROPERTY_VALUE_TYPE: &str = "value_type";
const PROPERTY_DESCRIPTION: &str = "description";
const PROPERTY_REQUIRED: &str = "required";

/// Label parsing failures. All of them surface to the task author as an
/// invalid-labels condition with the offending name in context.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("invalid label format: {0}")]
    MalformedKey(String),

    #[error("invalid {group} '{name}': missing required property '{property}'")]
    MissingProperty {
        group: &'static str,
        name: String,
        property: &'static str,
    },

    #[error("invalid {group} '{name}': invalid type '{value}', must be 'env' or 'file'")]
    InvalidInputType {
        group: &'static str,
        name: String,
        value: String,
    },

    #[error(
        "invalid {group} '{name}': invalid value_type '{value}', must be 'text', 'number' or 'file'"
    )]
    InvalidValueType {
        group: &'static str,
        name: String,
        value: String,
    },

    #[error("invalid {group} '{name}': invalid required value '{value}', must be 'true' or 'false'")]
    InvalidRequired {
        group: &'static str,
        name: String,
        value: String,
    },

    #[error("missing required meta.name label")]
    MissingName,
}

/// Structured form of the namespace before typing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedLabels {
    pub meta: MetaLabels,
    pub inputs: BTreeMap<String, InputProperties>,
    pub config: BTreeMap<String, InputProperties>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetaLabels {
    pub name: String,
    pub description: String,
    pub author: String,
    pub url: String,
}

/// Raw property values collected for one input or configuration name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InputProperties {
    pub input_type: String,
    pub value_type: String,
    pub description: String,
    pub required: String,
}

/// Extracts the namespace from a raw label map.
pub fn parse_labels(labels: &HashMap<String, String>) -> Result<ParsedLabels, LabelError> {
    let mut parsed = ParsedLabels {
        meta: MetaLabels {
            name: labels.get(LABEL_META_NAME).cloned().unwrap_or_default(),
            description: labels
                .get(LABEL_META_DESCRIPTION)
                .cloned()
                .unwrap_or_default(),
            author: labels.get(LABEL_META_AUTHOR).cloned().unwrap_or_default(),
            url: labels.get(LABEL_META_URL).cloned().unwrap_or_default(),
        },
        ..Default::default()
    };

    let mut input_groups: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut config_groups: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();

    for (key, value) in labels {
        if let Some(suffix) = strip_group_prefix(key, LABEL_PREFIX_INPUTS) {
            group_label(key, suffix, value, &mut input_groups)?;
        } else if let Some(suffix) = strip_group_prefix(key, LABEL_PREFIX_CONFIG) {
            group_label(key, suffix, value, &mut config_groups)?;
        }
    }

    for (name, properties) in input_groups {
        parsed
            .inputs
            .insert(name.clone(), build_properties("input", &name, properties)?);
    }
    for (name, properties) in config_groups {
        parsed
            .config
            .insert(name.clone(), build_properties("config", &name, properties)?);
    }

    Ok(parsed)
}

/// Builds the typed definition from parsed labels. `meta.name` is the only
/// hard requirement on the metadata side.
pub fn build_definition(
    parsed: &ParsedLabels,
    image_ref: &str,
) -> Result<Definition, LabelError> {
    if parsed.meta.name.is_empty() {
        return Err(LabelError::MissingName);
    }

    let mut definition = Definition {
        name: parsed.meta.name.clone(),
        description: parsed.meta.description.clone(),
        author: parsed.meta.author.clone(),
        url: parsed.meta.url.clone(),
        image_ref: image_ref.to_string(),
        ..Default::default()
    };

    for (name, properties) in &parsed.inputs {
        definition
            .inputs
            .push(typed_input("input", name, properties)?);
    }
    for (name, properties) in &parsed.config {
        definition
            .configuration
            .push(typed_input("config", name, properties)?);
    }

    Ok(definition)
}

fn strip_group_prefix<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix)?.strip_prefix('.')
}

fn group_label(
    key: &str,
    suffix: &str,
    value: &str,
    groups: &mut BTreeMap<String, BTreeMap<String, String>>,
) -> Result<(), LabelError> {
    let Some((name, property)) = suffix.split_once('.') else {
        return Err(LabelError::MalformedKey(key.to_string()));
    };
    if name.is_empty() || property.is_empty() {
        return Err(LabelError::MalformedKey(key.to_string()));
    }
    groups
        .entry(name.to_string())
        .or_default()
        .insert(property.to_string(), value.to_string());
    Ok(())
}

fn build_properties(
    group: &'static str,
    name: &str,
    mut properties: BTreeMap<String, String>,
) -> Result<InputProperties, LabelError> {
    let built = InputProperties {
        input_type: properties.remove(PROPERTY_TYPE).unwrap_or_default(),
        value_type: properties.remove(PROPERTY_VALUE_TYPE).unwrap_or_default(),
        description: properties.remove(PROPERTY_DESCRIPTION).unwrap_or_default(),
        required: properties.remove(PROPERTY_REQUIRED).unwrap_or_default(),
    };

    if built.input_type.is_empty() {
        return Err(LabelError::MissingProperty {
            group,
            name: name.to_string(),
            property: PROPERTY_TYPE,
        });
    }
    if built.value_type.is_empty() {
        return Err(LabelError::MissingProperty {
            group,
            name: name.to_string(),
            property: PROPERTY_VALUE_TYPE,
        });
    }
    if InputType::from_str(&built.input_type).is_none() {
        return Err(LabelError::InvalidInputType {
            group,
            name: name.to_string(),
            value: built.input_type,
        });
    }
    if ValueType::from_str(&built.value_type).is_none() {
        return Err(LabelError::InvalidValueType {
            group,
            name: name.to_string(),
            value: built.value_type,
        });
    }

    Ok(built)
}

fn typed_input(
    group: &'static str,
    name: &str,
    properties: &InputProperties,
) -> Result<Input, LabelError> {
    let required = match properties.required.as_str() {
        "" | "false" => false,
        "true" => true,
        other => {
            return Err(LabelError::InvalidRequired {
                group,
                name: name.to_string(),
                value: other.to_string(),
            })
        }
    };

    // Types were validated while grouping; treat a miss here as malformed.
    let input_type = InputType::from_str(&properties.input_type).ok_or_else(|| {
        LabelError::InvalidInputType {
            group,
            name: name.to_string(),
            value: properties.input_type.clone(),
        }
    })?;
    let value_type = ValueType::from_str(&properties.value_type).ok_or_else(|| {
        LabelError::InvalidValueType {
            group,
            name: name.to_string(),
            value: properties.value_type.clone(),
        }
    })?;

    Ok(Input {
        name: name.to_string(),
        input_type,
        value_type,
        description: properties.description.clone(),
        required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn hello_labels() -> HashMap<String, String> {
        labels(&[
            ("io.oplet.task.meta.name", "hello"),
            ("io.oplet.task.meta.description", "prints a greeting"),
            ("io.oplet.task.meta.author", "ops"),
            ("io.oplet.task.meta.url", "https://example.com/hello"),
            ("io.oplet.task.inputs.greeting.type", "env"),
            ("io.oplet.task.inputs.greeting.value_type", "text"),
            ("io.oplet.task.inputs.greeting.required", "true"),
            ("io.oplet.task.inputs.greeting.description", "who to greet"),
            ("io.oplet.task.inputs.payload.type", "file"),
            ("io.oplet.task.inputs.payload.value_type", "file"),
            ("io.oplet.task.config.LOG_LEVEL.type", "env"),
            ("io.oplet.task.config.LOG_LEVEL.value_type", "text"),
            ("unrelated.label", "ignored"),
        ])
    }

    #[test]
    fn parses_and_builds_full_definition() {
        let parsed = parse_labels(&hello_labels()).unwrap();
        let definition = build_definition(&parsed, "registry/example/hello:latest").unwrap();

        assert_eq!(definition.name, "hello");
        assert_eq!(definition.author, "ops");
        assert_eq!(definition.image_ref, "registry/example/hello:latest");
        assert_eq!(definition.inputs.len(), 2);
        assert_eq!(definition.configuration.len(), 1);

        let greeting = definition
            .inputs
            .iter()
            .find(|i| i.name == "greeting")
            .unwrap();
        assert_eq!(greeting.input_type, InputType::Env);
        assert_eq!(greeting.value_type, ValueType::Text);
        assert!(greeting.required);
        assert_eq!(greeting.description, "who to greet");

        let payload = definition
            .inputs
            .iter()
            .find(|i| i.name == "payload")
            .unwrap();
        assert_eq!(payload.input_type, InputType::File);
        assert!(!payload.required);
    }

    #[test]
    fn round_trips_by_name_type_and_required() {
        let parsed = parse_labels(&hello_labels()).unwrap();
        let definition = build_definition(&parsed, "registry/example/hello:latest").unwrap();

        for (name, properties) in &parsed.inputs {
            let input = definition.inputs.iter().find(|i| &i.name == name).unwrap();
            assert_eq!(input.input_type.as_str(), properties.input_type);
            assert_eq!(input.value_type.as_str(), properties.value_type);
            assert_eq!(input.description, properties.description);
            assert_eq!(input.required, properties.required == "true");
        }
        for (name, _) in &parsed.config {
            assert!(definition.configuration.iter().any(|i| &i.name == name));
        }
    }

    #[test]
    fn missing_name_fails() {
        let parsed = parse_labels(&labels(&[(
            "io.oplet.task.meta.description",
            "anonymous",
        )]))
        .unwrap();
        assert_eq!(
            build_definition(&parsed, "registry/example/x:latest").unwrap_err(),
            LabelError::MissingName
        );
    }

    #[test]
    fn malformed_key_fails() {
        let err = parse_labels(&labels(&[("io.oplet.task.inputs.greeting", "env")])).unwrap_err();
        assert!(matches!(err, LabelError::MalformedKey(key) if key.ends_with("greeting")));
    }

    #[test]
    fn unknown_type_fails() {
        let err = parse_labels(&labels(&[
            ("io.oplet.task.inputs.greeting.type", "socket"),
            ("io.oplet.task.inputs.greeting.value_type", "text"),
        ]))
        .unwrap_err();
        assert!(matches!(err, LabelError::InvalidInputType { value, .. } if value == "socket"));
    }

    #[test]
    fn missing_value_type_fails() {
        let err = parse_labels(&labels(&[("io.oplet.task.inputs.greeting.type", "env")]))
            .unwrap_err();
        assert!(matches!(
            err,
            LabelError::MissingProperty {
                property: "value_type",
                ..
            }
        ));
    }

    #[test]
    fn unparseable_required_fails() {
        let parsed = parse_labels(&labels(&[
            ("io.oplet.task.meta.name", "hello"),
            ("io.oplet.task.inputs.greeting.type", "env"),
            ("io.oplet.task.inputs.greeting.value_type", "text"),
            ("io.oplet.task.inputs.greeting.required", "yes"),
        ]))
        .unwrap();
        let err = build_definition(&parsed, "registry/example/hello:latest").unwrap_err();
        assert!(matches!(err, LabelError::InvalidRequired { value, .. } if value == "yes"));
    }

    #[test]
    fn omitted_required_defaults_to_false() {
        let parsed = parse_labels(&labels(&[
            ("io.oplet.task.meta.name", "hello"),
            ("io.oplet.task.inputs.greeting.type", "env"),
            ("io.oplet.task.inputs.greeting.value_type", "text"),
        ]))
        .unwrap();
        let definition = build_definition(&parsed, "registry/example/hello:latest").unwrap();
        assert!(!definition.inputs[0].required);
    }
}
