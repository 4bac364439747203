/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::context::JsonLdContext;
use crate::object::ASObject;
use anyhow::{Context, Result};
use fedgraph_protocol::{AS_CONTEXT, MEDIA_ACTIVITY_JSON, MEDIA_LD_JSON_AS, SECURITY_CONTEXT};
use serde_json::Value;
use std::sync::Arc;

/// Parses and renders one family of document media types.
pub trait DocumentConverter: Send + Sync {
    fn media_types(&self) -> &[&'static str];
    fn parse(&self, body: &[u8]) -> Result<ASObject>;
    fn render(&self, doc: &ASObject) -> Result<Vec<u8>>;
}

pub struct ActivityStreamsConverter {
    ctx: Arc<JsonLdContext>,
}

impl ActivityStreamsConverter {
    pub fn new(ctx: Arc<JsonLdContext>) -> Self {
        Self { ctx }
    }
}

impl DocumentConverter for ActivityStreamsConverter {
    fn media_types(&self) -> &[&'static str] {
        &[MEDIA_ACTIVITY_JSON, MEDIA_LD_JSON_AS, "application/ld+json", "application/json"]
    }

    fn parse(&self, body: &[u8]) -> Result<ASObject> {
        let v: Value = serde_json::from_slice(body).context("parse activity json")?;
        ASObject::from_json(&self.ctx, &v)
    }

    fn render(&self, doc: &ASObject) -> Result<Vec<u8>> {
        let mut v = doc.to_json();
        if let Value::Object(map) = &mut v {
            map.insert(
                "@context".to_string(),
                serde_json::json!([AS_CONTEXT, SECURITY_CONTEXT]),
            );
        }
        Ok(serde_json::to_vec(&v)?)
    }
}

#[derive(Clone, Default)]
pub struct ConverterRegistry {
    converters: Vec<Arc<dyn DocumentConverter>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(ctx: Arc<JsonLdContext>) -> Self {
        let mut r = Self::new();
        r.register(Arc::new(ActivityStreamsConverter::new(ctx)));
        r
    }

    pub fn register(&mut self, c: Arc<dyn DocumentConverter>) {
        self.converters.push(c);
    }

    /// Converter able to parse a response with this `Content-Type`.
    pub fn for_content_type(&self, content_type: &str) -> Option<Arc<dyn DocumentConverter>> {
        let (essence, profile) = split_media_type(content_type);
        self.converters
            .iter()
            .find(|c| {
                c.media_types()
                    .iter()
                    .any(|m| media_matches(m, &essence, profile.as_deref()))
            })
            .cloned()
    }

    /// Best match for an `Accept` header, honouring q-values. `*/*` (or an
    /// absent header) selects the first registered converter.
    pub fn negotiate(&self, accept: Option<&str>) -> Option<(Arc<dyn DocumentConverter>, &'static str)> {
        let first = self.converters.first()?;
        let accept = accept.map(str::trim).filter(|a| !a.is_empty());
        let Some(accept) = accept else {
            return Some((first.clone(), first.media_types()[0]));
        };

        let mut ranges: Vec<(f32, usize, String, Option<String>)> = Vec::new();
        for (idx, part) in accept.split(',').enumerate() {
            let mut q = 1.0f32;
            for param in part.split(';').skip(1) {
                if let Some(v) = param.trim().strip_prefix("q=") {
                    q = v.trim().parse().unwrap_or(0.0);
                }
            }
            let (essence, profile) = split_media_type(part);
            if q > 0.0 && !essence.is_empty() {
                ranges.push((q, idx, essence, profile));
            }
        }
        ranges.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, _, essence, profile) in ranges {
            if essence == "*/*" || essence == "application/*" {
                return Some((first.clone(), first.media_types()[0]));
            }
            for c in &self.converters {
                if let Some(m) = c
                    .media_types()
                    .iter()
                    .find(|m| media_matches(m, &essence, profile.as_deref()))
                {
                    return Some((c.clone(), *m));
                }
            }
        }
        None
    }
}

fn split_media_type(raw: &str) -> (String, Option<String>) {
    let mut parts = raw.split(';');
    let essence = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let profile = parts.find_map(|p| {
        p.trim()
            .strip_prefix("profile=")
            .map(|v| v.trim_matches('"').to_string())
    });
    (essence, profile)
}

fn media_matches(registered: &str, essence: &str, profile: Option<&str>) -> bool {
    let (reg_essence, reg_profile) = split_media_type(registered);
    if reg_essence != essence {
        return false;
    }
    match (reg_profile.as_deref(), profile) {
        (Some(want), Some(got)) => want == got,
        (Some(_), None) => false,
        (None, _) => true,
    }
}
