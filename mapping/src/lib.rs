// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Topic-to-topic mapping engine driven by a JSON mapping document.
//!
//! A document describes a recursive tree of topic levels; each node may
//! carry a `subscription` (a QoS to subscribe the integrator client at,
//! plus one of three ways to turn a matching publish into zero or more
//! outbound publishes). [`MappingDocument::load`] validates and parses the
//! document once; [`MappingDocument::extract_subscriptions`] and
//! [`MappingDocument::translate`] drive the integrator client and the
//! broker's mapping bridge respectively.

mod document;
mod engine;
mod error;
mod schema;
mod template;

pub use document::{
    ConnectionConfig, MappingDocument, MappingKind, Node, StaticMapping, Subscription,
    TemplateMapping,
};
pub use engine::Derived;
pub use error::{MappingError, MappingErrorKind, RenderError};
