// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Load a mapping document and translate publishes through it.

use std::path::Path;

use serde_json::Value;

use crate::document::{MappingDocument, MappingKind, Node};
use crate::error::MappingError;
use crate::{schema, template};

/// One outbound publish derived from a mapping match.
#[derive(Debug, Clone, PartialEq)]
pub struct Derived {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

impl MappingDocument {
    /// Load, schema-validate and parse a mapping document from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MappingError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse_str(&text)
    }

    /// Schema-validate and parse a mapping document from its JSON text.
    pub fn parse_str(text: &str) -> Result<Self, MappingError> {
        let value: Value = serde_json::from_str(text)?;
        schema::validate(&value)?;
        Self::from_value(value)
    }

    /// Depth-first walk collecting `(filter, qos)` for every subscription
    /// node (§4.7 `extract_subscriptions`).
    pub fn extract_subscriptions(&self) -> Vec<(String, u8)> {
        let mut out = Vec::new();
        for root in &self.roots {
            walk_subscriptions(root, String::new(), &mut out);
        }
        out
    }

    /// Translate an incoming publish into the outbound publishes the
    /// mapping tree derives from it (§4.7 `translate`).
    pub fn translate(&self, topic: &str, payload: &[u8], publish_qos: u8) -> Vec<Derived> {
        let levels: Vec<&str> = topic.split('/').collect();
        for root in &self.roots {
            if let Some(node) = descend(root, &levels) {
                if let Some(subscription) = &node.subscription {
                    return apply_mapping(&subscription.kind, payload, publish_qos);
                }
            }
        }
        Vec::new()
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn walk_subscriptions(node: &Node, prefix: String, out: &mut Vec<(String, u8)>) {
    let path = join_path(&prefix, &node.name);
    if let Some(subscription) = &node.subscription {
        out.push((path.clone(), subscription.qos));
    }
    for child in &node.children {
        walk_subscriptions(child, path.clone(), out);
    }
}

/// Find the node reached by following `levels` from `node` (whose own
/// level is assumed already matched by the caller for the root case).
fn descend<'a>(node: &'a Node, levels: &[&str]) -> Option<&'a Node> {
    match levels.split_first() {
        None => None,
        Some((head, [])) if *head == node.name => Some(node),
        Some((head, rest)) if *head == node.name => {
            node.children.iter().find_map(|child| descend(child, rest))
        }
        _ => None,
    }
}

fn apply_mapping(kind: &MappingKind, payload: &[u8], publish_qos: u8) -> Vec<Derived> {
    match kind {
        MappingKind::Static(mapping) => {
            let message = String::from_utf8_lossy(payload);
            mapping
                .message_mapping
                .iter()
                .filter(|(incoming, _)| incoming == message.as_ref())
                .map(|(_, mapped)| Derived {
                    topic: mapping.mapped_topic.clone(),
                    payload: mapped.clone(),
                    qos: mapping.qos_override.unwrap_or(publish_qos),
                    retain: mapping.retain_message,
                })
                .collect()
        }
        MappingKind::Value(templates) => {
            let context = serde_json::json!({ "value": String::from_utf8_lossy(payload) });
            templates
                .iter()
                .filter_map(|t| render_template(t, &context, publish_qos))
                .collect()
        }
        MappingKind::Json(templates) => {
            let context: Value = match serde_json::from_slice(payload) {
                Ok(v) => v,
                Err(err) => {
                    log::warn!("mapping: payload is not valid json: {err}");
                    return Vec::new();
                }
            };
            templates
                .iter()
                .filter_map(|t| render_template(t, &context, publish_qos))
                .collect()
        }
    }
}

fn render_template(
    mapping: &crate::document::TemplateMapping,
    context: &Value,
    publish_qos: u8,
) -> Option<Derived> {
    match template::render(&mapping.mapping_template, context) {
        Ok(rendered) if rendered.is_empty() => None,
        Ok(rendered) => Some(Derived {
            topic: mapping.mapped_topic.clone(),
            payload: rendered,
            qos: mapping.qos_override.unwrap_or(publish_qos),
            retain: mapping.retain_message,
        }),
        Err(err) => {
            log::warn!(
                "mapping: rendering '{}' failed: {err}",
                mapping.mapping_template
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(json: serde_json::Value) -> MappingDocument {
        MappingDocument::parse_str(&json.to_string()).unwrap()
    }

    #[test]
    fn static_mapping_scenario() {
        let document = doc(serde_json::json!({
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
                                {"message": "pressed", "mapped_message": "on"},
                                {"message": "released", "mapped_message": "off"}
                            ]
                        }
                    }
                }
            }
        }));

        let derived = document.translate("test01/button1", b"pressed", 0);
        assert_eq!(
            derived,
            vec![Derived {
                topic: "test02/onboard/set".to_string(),
                payload: "on".to_string(),
                qos: 0,
                retain: false,
            }]
        );
    }

    #[test]
    fn template_mapping_scenario() {
        let document = doc(serde_json::json!({
            "mappings": {
                "name": "test02",
                "topic_level": {
                    "name": "onboard",
                    "subscription": {
                        "qos": 0,
                        "value": {
                            "mapped_topic": "test02/onboard/state",
                            "retain_message": true,
                            "mapping_template":
                                "{% if value == \"pressed\" %}on{% else if value == \"released\" %}off{% endif %}"
                        }
                    }
                }
            }
        }));

        let derived = document.translate("test02/onboard", b"released", 0);
        assert_eq!(derived[0].payload, "off");

        let derived = document.translate("test02/onboard", b"held", 0);
        assert!(derived.is_empty());
    }

    #[test]
    fn json_mapping_with_invalid_json_emits_nothing() {
        let document = doc(serde_json::json!({
            "mappings": {
                "name": "sensor",
                "subscription": {
                    "qos": 0,
                    "json": {
                        "mapped_topic": "sensor/out",
                        "retain_message": false,
                        "mapping_template": "{{ value }}"
                    }
                }
            }
        }));

        assert!(document.translate("sensor", b"not json", 0).is_empty());
    }

    #[test]
    fn extract_subscriptions_collects_every_filter() {
        let document = doc(serde_json::json!({
            "mappings": [
                {
                    "name": "a",
                    "subscription": {
                        "qos": 1,
                        "json": {"mapped_topic": "x", "retain_message": false, "mapping_template": "{{ value }}"}
                    }
                },
                {
                    "name": "b",
                    "topic_level": {
                        "name": "c",
                        "subscription": {
                            "qos": 2,
                            "json": {"mapped_topic": "y", "retain_message": false, "mapping_template": "{{ value }}"}
                        }
                    }
                }
            ]
        }));

        let mut subs = document.extract_subscriptions();
        subs.sort();
        assert_eq!(subs, vec![("a".to_string(), 1), ("b/c".to_string(), 2)]);
    }
}
