// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Typed model of a mapping document, built once at load time.
//!
//! Deserialization goes through the `Raw*` types, which mirror the JSON
//! shape exactly (including its "one of several optional keys" union for a
//! subscription's mapping kind), then converts into the typed tree below.
//! Everything downstream of [`MappingDocument::parse`] works against plain
//! enums and structs, never against `serde_json::Value` directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MappingError, MappingErrorKind};

fn default_qos() -> u8 {
    0
}

fn default_true() -> bool {
    true
}

/// Integrator connection parameters, the `connection` top-level key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u16,
    pub client_id: String,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default)]
    pub will_topic: Option<String>,
    #[serde(default)]
    pub will_message: Option<String>,
    #[serde(default = "default_qos")]
    pub will_qos: u8,
    #[serde(default)]
    pub will_retain: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_keep_alive() -> u16 {
    60
}

#[derive(Clone, Debug, Deserialize)]
struct RawTemplateMapping {
    mapped_topic: String,
    #[serde(default)]
    retain_message: bool,
    #[serde(default)]
    qos_override: Option<u8>,
    mapping_template: String,
}

/// A template-rendered outbound mapping (`value` or `json` kind).
#[derive(Clone, Debug)]
pub struct TemplateMapping {
    pub mapped_topic: String,
    pub retain_message: bool,
    pub qos_override: Option<u8>,
    pub mapping_template: String,
}

impl From<RawTemplateMapping> for TemplateMapping {
    fn from(raw: RawTemplateMapping) -> Self {
        TemplateMapping {
            mapped_topic: raw.mapped_topic,
            retain_message: raw.retain_message,
            qos_override: raw.qos_override,
            mapping_template: raw.mapping_template,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
struct RawMessageMapping {
    message: String,
    mapped_message: String,
}

#[derive(Clone, Debug, Deserialize)]
struct RawStaticMapping {
    mapped_topic: String,
    #[serde(default)]
    retain_message: bool,
    #[serde(default)]
    qos_override: Option<u8>,
    message_mapping: Vec<RawMessageMapping>,
}

/// An exact-payload-match outbound mapping (`static` kind).
#[derive(Clone, Debug)]
pub struct StaticMapping {
    pub mapped_topic: String,
    pub retain_message: bool,
    pub qos_override: Option<u8>,
    pub message_mapping: Vec<(String, String)>,
}

impl From<RawStaticMapping> for StaticMapping {
    fn from(raw: RawStaticMapping) -> Self {
        StaticMapping {
            mapped_topic: raw.mapped_topic,
            retain_message: raw.retain_message,
            qos_override: raw.qos_override,
            message_mapping: raw
                .message_mapping
                .into_iter()
                .map(|m| (m.message, m.mapped_message))
                .collect(),
        }
    }
}

/// Accepts either a bare object or an array of objects, as the mapping
/// document's `static`/`value`/`json` keys do.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
struct RawSubscription {
    #[serde(default = "default_qos")]
    qos: u8,
    #[serde(rename = "static", default)]
    static_mapping: Option<RawStaticMapping>,
    #[serde(default)]
    value: Option<OneOrMany<RawTemplateMapping>>,
    #[serde(default)]
    json: Option<OneOrMany<RawTemplateMapping>>,
}

/// The three shapes a subscription's outbound mapping may take (§3).
#[derive(Clone, Debug)]
pub enum MappingKind {
    Static(StaticMapping),
    Value(Vec<TemplateMapping>),
    Json(Vec<TemplateMapping>),
}

/// A topic-level node's `subscription` object: the QoS to subscribe at plus
/// the outbound mapping to apply to matching publishes.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub qos: u8,
    pub kind: MappingKind,
}

impl TryFrom<RawSubscription> for Subscription {
    type Error = MappingError;

    fn try_from(raw: RawSubscription) -> Result<Self, Self::Error> {
        let present = [
            raw.static_mapping.is_some(),
            raw.value.is_some(),
            raw.json.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count();
        if present != 1 {
            return Err(MappingError::new(
                MappingErrorKind::SchemaViolation,
                "subscription must carry exactly one of static/value/json",
            ));
        }
        let kind = if let Some(static_mapping) = raw.static_mapping {
            MappingKind::Static(static_mapping.into())
        } else if let Some(value) = raw.value {
            MappingKind::Value(value.into_vec().into_iter().map(Into::into).collect())
        } else {
            MappingKind::Json(
                raw.json
                    .unwrap()
                    .into_vec()
                    .into_iter()
                    .map(Into::into)
                    .collect(),
            )
        };
        Ok(Subscription { qos: raw.qos, kind })
    }
}

#[derive(Clone, Debug, Deserialize)]
struct RawNode {
    name: String,
    #[serde(default)]
    subscription: Option<RawSubscription>,
    #[serde(default)]
    topic_level: Option<OneOrMany<RawNode>>,
}

/// One level of the mapping tree (§3: a recursive tree of topic-level
/// nodes).
#[derive(Clone, Debug)]
pub struct Node {
    pub name: String,
    pub subscription: Option<Subscription>,
    pub children: Vec<Node>,
}

impl TryFrom<RawNode> for Node {
    type Error = MappingError;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let subscription = raw.subscription.map(Subscription::try_from).transpose()?;
        let children = raw
            .topic_level
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .into_iter()
            .map(Node::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Node {
            name: raw.name,
            subscription,
            children,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
struct RawMappingDocument {
    #[serde(default)]
    connection: Option<ConnectionConfig>,
    #[serde(default)]
    mappings: Option<OneOrMany<RawNode>>,
}

/// The top-level mapping document: integrator connection parameters plus
/// the topic-level mapping tree.
#[derive(Clone, Debug)]
pub struct MappingDocument {
    pub connection: Option<ConnectionConfig>,
    pub roots: Vec<Node>,
}

impl MappingDocument {
    /// Parse an already schema-validated JSON value into the typed tree.
    pub(crate) fn from_value(value: Value) -> Result<Self, MappingError> {
        let raw: RawMappingDocument = serde_json::from_value(value)?;
        let roots = raw
            .mappings
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .into_iter()
            .map(Node::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MappingDocument {
            connection: raw.connection,
            roots,
        })
    }
}
