/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::context::JsonLdContext;
use anyhow::{anyhow, Result};
use fedgraph_protocol::AS_PUBLIC;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Type recorded for entities that carry no `type` of their own.
pub const UNTYPED: &str = "_:untyped";
pub const TOMBSTONE: &str = "Tombstone";

pub const ACTOR_TYPES: &[&str] = &["Person", "Service", "Group", "Organization", "Application"];
pub const COLLECTION_TYPES: &[&str] = &[
    "Collection",
    "OrderedCollection",
    "CollectionPage",
    "OrderedCollectionPage",
];
pub const ACTIVITY_TYPES: &[&str] = &[
    "Create", "Update", "Delete", "Follow", "Accept", "Reject", "TentativeAccept",
    "TentativeReject", "Add", "Remove", "Like", "Announce", "Undo", "Block", "Flag",
    "Ignore", "Join", "Leave", "Offer", "Invite", "Move", "Dislike", "View", "Listen",
    "Read", "Arrive", "Travel", "Question",
];

/// A literal value with an optional datatype IRI in compact form.
#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    pub value: Value,
    pub datatype: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ASTerm {
    /// Reference to another node by id.
    Ref(String),
    /// Embedded node.
    Object(ASObject),
    Literal(Literal),
}

impl ASTerm {
    pub fn reference(id: impl Into<String>) -> Self {
        Self::Ref(id.into())
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::Literal(Literal {
            value: Value::String(s.into()),
            datatype: None,
        })
    }

    pub fn bool(b: bool) -> Self {
        Self::Literal(Literal {
            value: Value::Bool(b),
            datatype: None,
        })
    }

    pub fn integer(n: i64) -> Self {
        Self::Literal(Literal {
            value: Value::from(n),
            datatype: None,
        })
    }

    pub fn date_time(ms: i64) -> Self {
        Self::Literal(Literal {
            value: Value::String(rfc3339(ms)),
            datatype: Some("xsd:dateTime".to_string()),
        })
    }

    /// Node id for references and identified embedded nodes.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Ref(id) => Some(id),
            Self::Object(o) => o.id.as_deref(),
            Self::Literal(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Literal(l) => l.value.as_str(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Literal(l) => l.value.as_bool(),
            _ => None,
        }
    }
}

/// A node in a document tree (or, once flattened, one graph node whose nested
/// nodes are all [`ASTerm::Ref`]s).
#[derive(Debug, Clone, Default)]
pub struct ASObject {
    pub id: Option<String>,
    pub types: Vec<String>,
    props: BTreeMap<String, Vec<ASTerm>>,
}

/// Empty predicate lists (left behind by `get_mut`) do not affect equality.
impl PartialEq for ASObject {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.types == other.types
            && self.props().eq(other.props())
    }
}

impl ASObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn typed(ty: &str, id: Option<String>) -> Self {
        Self {
            id,
            types: vec![ty.to_string()],
            ..Self::default()
        }
    }

    pub fn type_name(&self) -> Option<&str> {
        self.types.first().map(String::as_str)
    }

    pub fn is_type(&self, ty: &str) -> bool {
        self.types.iter().any(|t| t == ty)
    }

    pub fn get(&self, pred: &str) -> &[ASTerm] {
        self.props.get(pred).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Read-or-create access: the list is created empty on first use.
    pub fn get_mut(&mut self, pred: &str) -> &mut Vec<ASTerm> {
        self.props.entry(pred.to_string()).or_default()
    }

    pub fn contains(&self, pred: &str) -> bool {
        self.props.get(pred).map(|v| !v.is_empty()).unwrap_or(false)
    }

    pub fn set(&mut self, pred: &str, term: ASTerm) {
        self.props.insert(pred.to_string(), vec![term]);
    }

    pub fn add(&mut self, pred: &str, term: ASTerm) {
        self.get_mut(pred).push(term);
    }

    pub fn remove(&mut self, pred: &str) -> Vec<ASTerm> {
        self.props.remove(pred).unwrap_or_default()
    }

    pub fn first(&self, pred: &str) -> Option<&ASTerm> {
        self.get(pred).first()
    }

    pub fn first_id(&self, pred: &str) -> Option<&str> {
        self.get(pred).iter().find_map(ASTerm::id)
    }

    pub fn first_str(&self, pred: &str) -> Option<&str> {
        self.get(pred).iter().find_map(ASTerm::as_str)
    }

    pub fn first_bool(&self, pred: &str) -> Option<bool> {
        self.get(pred).iter().find_map(ASTerm::as_bool)
    }

    pub fn ids(&self, pred: &str) -> Vec<String> {
        self.get(pred)
            .iter()
            .filter_map(ASTerm::id)
            .map(str::to_string)
            .collect()
    }

    pub fn props(&self) -> impl Iterator<Item = (&String, &Vec<ASTerm>)> {
        self.props.iter().filter(|(_, v)| !v.is_empty())
    }

    pub fn props_mut(&mut self) -> impl Iterator<Item = (&String, &mut Vec<ASTerm>)> {
        self.props.iter_mut()
    }

    pub fn retain_props(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.props.retain(|k, _| keep(k));
    }

    /// Whether any audience field names the public collection.
    pub fn is_public(&self) -> bool {
        ["to", "cc", "audience"]
            .iter()
            .any(|p| self.get(p).iter().any(|t| t.id() == Some(AS_PUBLIC)))
    }

    pub fn from_json(ctx: &JsonLdContext, v: &Value) -> Result<Self> {
        let Value::Object(map) = v else {
            return Err(anyhow!("document is not a JSON object"));
        };
        let mut out = ASObject::new();
        for (key, value) in map {
            match key.as_str() {
                "@context" => {}
                "id" | "@id" => {
                    out.id = value.as_str().map(str::to_string);
                }
                "type" | "@type" => match value {
                    Value::String(s) => out.types.push(s.clone()),
                    Value::Array(arr) => {
                        out.types
                            .extend(arr.iter().filter_map(|t| t.as_str()).map(str::to_string));
                    }
                    _ => {}
                },
                _ => {
                    let terms = out.get_mut(key);
                    match value {
                        Value::Array(arr) => {
                            for item in arr {
                                if let Some(t) = term_from_json(ctx, key, item)? {
                                    terms.push(t);
                                }
                            }
                        }
                        other => {
                            if let Some(t) = term_from_json(ctx, key, other)? {
                                terms.push(t);
                            }
                        }
                    }
                }
            }
        }
        out.props.retain(|_, v| !v.is_empty());
        Ok(out)
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        if let Some(id) = &self.id {
            map.insert("id".to_string(), Value::String(id.clone()));
        }
        match self.types.len() {
            0 => {}
            1 => {
                map.insert("type".to_string(), Value::String(self.types[0].clone()));
            }
            _ => {
                map.insert(
                    "type".to_string(),
                    Value::Array(self.types.iter().cloned().map(Value::String).collect()),
                );
            }
        }
        for (pred, terms) in self.props() {
            let mut values: Vec<Value> = terms.iter().map(term_to_json).collect();
            let v = if values.len() == 1 {
                values.remove(0)
            } else {
                Value::Array(values)
            };
            map.insert(pred.clone(), v);
        }
        Value::Object(map)
    }
}

fn term_from_json(ctx: &JsonLdContext, key: &str, v: &Value) -> Result<Option<ASTerm>> {
    Ok(match v {
        Value::Null => None,
        Value::String(s) if ctx.is_id_term(key) => Some(ASTerm::Ref(s.clone())),
        Value::String(_) | Value::Number(_) | Value::Bool(_) => Some(ASTerm::Literal(Literal {
            value: v.clone(),
            datatype: None,
        })),
        Value::Object(map) => {
            if let Some(value) = map.get("@value") {
                Some(ASTerm::Literal(Literal {
                    value: value.clone(),
                    datatype: map.get("@type").and_then(|t| t.as_str()).map(str::to_string),
                }))
            } else if map.len() == 1 && (map.contains_key("id") || map.contains_key("@id")) {
                map.values()
                    .next()
                    .and_then(|id| id.as_str())
                    .map(|id| ASTerm::Ref(id.to_string()))
            } else {
                Some(ASTerm::Object(ASObject::from_json(ctx, v)?))
            }
        }
        Value::Array(_) => return Err(anyhow!("nested arrays are not supported under {key}")),
    })
}

fn term_to_json(t: &ASTerm) -> Value {
    match t {
        ASTerm::Ref(id) => Value::String(id.clone()),
        ASTerm::Object(o) => o.to_json(),
        ASTerm::Literal(l) => match &l.datatype {
            None => l.value.clone(),
            Some(dt) => serde_json::json!({ "@value": l.value, "@type": dt }),
        },
    }
}

/// One stored graph node.
#[derive(Debug, Clone, PartialEq)]
pub struct APEntity {
    pub id: String,
    /// Flattened content: nested nodes appear as references.
    pub data: ASObject,
    pub type_name: String,
    pub updated_ms: i64,
    /// Authoritative on this node (mutable, federated) vs. a cached remote copy.
    pub is_owner: bool,
}

impl APEntity {
    pub fn new(data: ASObject, is_owner: bool) -> Result<Self> {
        let id = data
            .id
            .clone()
            .ok_or_else(|| anyhow!("entity without id"))?;
        Ok(Self {
            id,
            type_name: data.type_name().unwrap_or(UNTYPED).to_string(),
            data,
            updated_ms: now_ms(),
            is_owner,
        })
    }

    /// Replaces the content, keeping identity and ownership.
    pub fn with_data(&self, data: ASObject) -> Self {
        Self {
            id: self.id.clone(),
            type_name: data.type_name().unwrap_or(UNTYPED).to_string(),
            data,
            updated_ms: now_ms(),
            is_owner: self.is_owner,
        }
    }

    pub fn is_actor(&self) -> bool {
        ACTOR_TYPES.contains(&self.type_name.as_str())
    }

    pub fn is_activity(&self) -> bool {
        ACTIVITY_TYPES.contains(&self.type_name.as_str())
    }

    pub fn is_collection(&self) -> bool {
        COLLECTION_TYPES.contains(&self.type_name.as_str())
    }

    pub fn is_tombstone(&self) -> bool {
        self.type_name == TOMBSTONE
    }
}

pub fn is_activity_type(ty: &str) -> bool {
    ACTIVITY_TYPES.contains(&ty)
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn rfc3339(ms: i64) -> String {
    let nanos = (ms as i128) * 1_000_000;
    time::OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|t| t.format(&time::format_description::well_known::Rfc3339).ok())
        .unwrap_or_default()
}

pub fn host_of(url: &str) -> Option<String> {
    let uri: http::Uri = url.parse().ok()?;
    uri.host().map(|h| h.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strings_under_id_terms_become_references() {
        let ctx = JsonLdContext::activity_streams();
        let o = ASObject::from_json(
            &ctx,
            &json!({
                "@context": "https://www.w3.org/ns/activitystreams",
                "id": "https://a.example/notes/1",
                "type": "Note",
                "attributedTo": "https://a.example/users/alice",
                "content": "hello",
                "to": ["https://www.w3.org/ns/activitystreams#Public"]
            }),
        )
        .unwrap();
        assert_eq!(o.first("attributedTo"), Some(&ASTerm::reference("https://a.example/users/alice")));
        assert_eq!(o.first_str("content"), Some("hello"));
        assert!(o.is_public());
    }

    #[test]
    fn get_mut_creates_empty_list() {
        let mut o = ASObject::new();
        assert!(o.get("cc").is_empty());
        o.get_mut("cc").push(ASTerm::reference("https://b.example/u"));
        assert_eq!(o.ids("cc"), vec!["https://b.example/u".to_string()]);
    }

    #[test]
    fn typed_literal_survives_json() {
        let ctx = JsonLdContext::activity_streams();
        let mut o = ASObject::with_id("https://a.example/x");
        o.set("published", ASTerm::date_time(0));
        let back = ASObject::from_json(&ctx, &o.to_json()).unwrap();
        assert_eq!(back, o);
    }
}
