// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};

/// Kind of failure that can occur while loading a mapping document.
#[derive(Clone, Debug)]
pub enum MappingErrorKind {
    /// The document failed JSON Schema validation.
    SchemaViolation,
    /// The document text was not valid JSON.
    Json,
    /// The document could not be read from disk.
    Io,
}

#[derive(Clone, Debug)]
pub struct MappingError {
    kind: MappingErrorKind,
    message: String,
}

impl MappingError {
    pub fn new(kind: MappingErrorKind, message: impl Into<String>) -> Self {
        MappingError {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &MappingErrorKind {
        &self.kind
    }
}

impl Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for MappingError {}

impl From<std::io::Error> for MappingError {
    fn from(err: std::io::Error) -> Self {
        MappingError::new(MappingErrorKind::Io, err.to_string())
    }
}

impl From<serde_json::Error> for MappingError {
    fn from(err: serde_json::Error) -> Self {
        MappingError::new(MappingErrorKind::Json, err.to_string())
    }
}

/// Kind of failure that can occur while rendering a template at dispatch
/// time. Render failures are logged and skip that one derived publication;
/// they never propagate as a hard error to the publisher.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RenderError {
    UnknownVariable(String),
    TypeMismatch(String),
    UnexpectedToken(String),
}

impl Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RenderError::UnknownVariable(path) => write!(f, "unknown variable: {path}"),
            RenderError::TypeMismatch(what) => write!(f, "type mismatch: {what}"),
            RenderError::UnexpectedToken(what) => write!(f, "unexpected token: {what}"),
        }
    }
}

impl std::error::Error for RenderError {}
