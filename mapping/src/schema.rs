// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Load-time JSON Schema validation of a mapping document.
//!
//! This replaces the original implementation's nlohmann json-schema
//! "default patch" validator: here validation only rejects malformed
//! documents, while field defaults are supplied by `#[serde(default)]` on
//! the typed structs in [`crate::document`] once validation passes.

use serde_json::{json, Value};

use crate::error::{MappingError, MappingErrorKind};

fn schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "connection": {
                "type": "object",
                "additionalProperties": false,
                "required": ["client_id"],
                "properties": {
                    "keep_alive": { "type": "integer", "minimum": 0, "maximum": 65535 },
                    "client_id": { "type": "string", "minLength": 1 },
                    "clean_session": { "type": "boolean" },
                    "will_topic": { "type": "string" },
                    "will_message": { "type": "string" },
                    "will_qos": { "type": "integer", "minimum": 0, "maximum": 2 },
                    "will_retain": { "type": "boolean" },
                    "username": { "type": "string" },
                    "password": { "type": "string" }
                }
            },
            "mappings": {
                "oneOf": [
                    { "$ref": "#/$defs/node" },
                    { "type": "array", "items": { "$ref": "#/$defs/node" } }
                ]
            }
        },
        "$defs": {
            "node": {
                "type": "object",
                "additionalProperties": false,
                "required": ["name"],
                "properties": {
                    "name": { "type": "string" },
                    "subscription": { "$ref": "#/$defs/subscription" },
                    "topic_level": {
                        "oneOf": [
                            { "$ref": "#/$defs/node" },
                            { "type": "array", "items": { "$ref": "#/$defs/node" } }
                        ]
                    }
                }
            },
            "subscription": {
                "type": "object",
                "properties": {
                    "qos": { "type": "integer", "minimum": 0, "maximum": 2 },
                    "static": { "$ref": "#/$defs/static_mapping" },
                    "value": {
                        "oneOf": [
                            { "$ref": "#/$defs/template_mapping" },
                            { "type": "array", "items": { "$ref": "#/$defs/template_mapping" } }
                        ]
                    },
                    "json": {
                        "oneOf": [
                            { "$ref": "#/$defs/template_mapping" },
                            { "type": "array", "items": { "$ref": "#/$defs/template_mapping" } }
                        ]
                    }
                },
                "oneOf": [
                    { "required": ["static"] },
                    { "required": ["value"] },
                    { "required": ["json"] }
                ]
            },
            "static_mapping": {
                "type": "object",
                "additionalProperties": false,
                "required": ["mapped_topic", "retain_message", "message_mapping"],
                "properties": {
                    "mapped_topic": { "type": "string" },
                    "retain_message": { "type": "boolean" },
                    "qos_override": { "type": "integer", "minimum": 0, "maximum": 2 },
                    "message_mapping": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "additionalProperties": false,
                            "required": ["message", "mapped_message"],
                            "properties": {
                                "message": { "type": "string" },
                                "mapped_message": { "type": "string" }
                            }
                        }
                    }
                }
            },
            "template_mapping": {
                "type": "object",
                "additionalProperties": false,
                "required": ["mapped_topic", "retain_message", "mapping_template"],
                "properties": {
                    "mapped_topic": { "type": "string" },
                    "retain_message": { "type": "boolean" },
                    "qos_override": { "type": "integer", "minimum": 0, "maximum": 2 },
                    "mapping_template": { "type": "string" }
                }
            }
        }
    })
}

/// Validate `instance` against the embedded mapping-document schema.
pub fn validate(instance: &Value) -> Result<(), MappingError> {
    let schema = schema();
    let validator = jsonschema::validator_for(&schema).map_err(|err| {
        MappingError::new(
            MappingErrorKind::SchemaViolation,
            format!("invalid embedded schema: {err}"),
        )
    })?;
    if let Err(err) = validator.validate(instance) {
        return Err(MappingError::new(
            MappingErrorKind::SchemaViolation,
            err.to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_subscription_with_no_mapping_kind() {
        let doc = json!({
            "mappings": { "name": "a", "subscription": { "qos": 0 } }
        });
        assert!(validate(&doc).is_err());
    }

    #[test]
    fn accepts_minimal_static_mapping() {
        let doc = json!({
            "mappings": {
                "name": "test01",
                "topic_level": {
                    "name": "button1",
                    "subscription": {
                        "qos": 0,
                        "static": {
                            "mapped_topic": "test02/onboard/set",
                            "retain_message": false,
                            "message_mapping": [
                                { "message": "pressed", "mapped_message": "on" }
                            ]
                        }
                    }
                }
            }
        });
        assert!(validate(&doc).is_ok());
    }
}
