/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Tree documents <-> flattened graph nodes.

use crate::object::{APEntity, ASObject, ASTerm};
use crate::store::EntityStore;
use anyhow::{anyhow, Result};
use fedgraph_protocol::AS_PUBLIC;
use std::collections::{HashMap, HashSet};

/// Predicates whose references are links rather than embedded content.
const LINK_ONLY: &[&str] = &[
    "to", "cc", "bto", "bcc", "audience", "inbox", "outbox", "followers", "following",
    "liked", "likes", "shares", "blocks", "sharedInbox", "replies", "url", "inReplyTo",
    "first", "last", "next", "prev", "current", "partOf",
];

/// Never shown to anyone but the owner.
const OWNER_ONLY: &[&str] = &["bto", "bcc", "blocks"];

#[derive(Debug, Clone)]
pub struct Flattened {
    pub root: String,
    /// Root node first, then nested nodes in discovery order.
    pub nodes: Vec<ASObject>,
}

impl Flattened {
    pub fn into_entities(self, is_owner: bool) -> Result<Vec<APEntity>> {
        self.nodes
            .into_iter()
            .map(|n| APEntity::new(n, is_owner))
            .collect()
    }
}

/// Splits `doc` into one node per (nested) object. Nested objects without an
/// id get `<root>#b<n>`; an id seen twice is only flattened the first time.
pub fn flatten(doc: &ASObject) -> Result<Flattened> {
    let root = doc
        .id
        .clone()
        .ok_or_else(|| anyhow!("cannot flatten a document without id"))?;
    let mut state = FlattenState {
        base: base_of(&root).to_string(),
        next_blank: 0,
        seen: HashSet::new(),
        nodes: Vec::new(),
    };
    state.visit(doc.clone());
    Ok(Flattened {
        root,
        nodes: state.nodes.into_iter().flatten().collect(),
    })
}

struct FlattenState {
    base: String,
    next_blank: usize,
    seen: HashSet<String>,
    nodes: Vec<Option<ASObject>>,
}

impl FlattenState {
    fn visit(&mut self, mut obj: ASObject) -> String {
        let id = match obj.id.clone() {
            Some(id) => id,
            None => {
                let id = format!("{}#b{}", self.base, self.next_blank);
                self.next_blank += 1;
                id
            }
        };
        obj.id = Some(id.clone());
        if !self.seen.insert(id.clone()) {
            return id;
        }

        let slot = self.nodes.len();
        self.nodes.push(None);
        for (_, terms) in obj.props_mut() {
            for t in terms.iter_mut() {
                if let ASTerm::Object(child) = t {
                    let child_id = self.visit(std::mem::take(child));
                    *t = ASTerm::Ref(child_id);
                }
            }
        }
        self.nodes[slot] = Some(obj);
        id
    }
}

fn base_of(id: &str) -> &str {
    id.split_once('#').map(|(b, _)| b).unwrap_or(id)
}

/// Whether `id` is a blank-node id minted by [`flatten`] under `parent`'s document.
pub(crate) fn is_generated_under(id: &str, parent: &str) -> bool {
    match id.split_once('#') {
        Some((base, frag)) => {
            base == base_of(parent)
                && frag.len() > 1
                && frag.starts_with('b')
                && frag[1..].bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Rebuilds a tree rooted at `id`, embedding referenced nodes up to `depth`
/// levels. Every distinct node is read from `store` at most once; cycles end
/// as bare references. `is_owner = false` renders the public view.
pub async fn unflatten(
    store: &dyn EntityStore,
    id: &str,
    depth: u32,
    is_owner: bool,
) -> Result<Option<ASObject>> {
    let mut graph = Unflattener {
        root: id.to_string(),
        is_owner,
        cache: HashMap::new(),
        totals: HashMap::new(),
    };
    if !graph.load(store, id, depth).await? {
        return Ok(None);
    }
    let mut visiting = HashSet::new();
    Ok(Some(graph.build(id, depth, &mut visiting)))
}

struct Unflattener {
    /// Blank ids minted under this root are dropped again when embedded.
    root: String,
    is_owner: bool,
    cache: HashMap<String, Option<APEntity>>,
    totals: HashMap<String, u64>,
}

impl Unflattener {
    async fn load(&mut self, store: &dyn EntityStore, root: &str, depth: u32) -> Result<bool> {
        let Some(first) = self.read(store, root).await? else {
            return Ok(false);
        };
        let mut frontier = vec![first];
        let mut level = 0u32;
        while level < depth && !frontier.is_empty() {
            let mut next = Vec::new();
            for e in &frontier {
                for child in self.expandable_refs(&e.data) {
                    if self.cache.contains_key(&child) {
                        continue;
                    }
                    if let Some(loaded) = self.read(store, &child).await? {
                        next.push(loaded);
                    }
                }
            }
            frontier = next;
            level += 1;
        }
        Ok(true)
    }

    async fn read(&mut self, store: &dyn EntityStore, id: &str) -> Result<Option<APEntity>> {
        let got = store.get_entity(id, false).await?;
        if let Some(e) = &got {
            if e.is_owner && e.is_collection() {
                let page = store.collection_page(id, None, 0, self.is_owner).await?;
                self.totals.insert(id.to_string(), page.total);
            }
        }
        self.cache.insert(id.to_string(), got.clone());
        Ok(got)
    }

    fn expandable_refs(&self, data: &ASObject) -> Vec<String> {
        let mut out = Vec::new();
        for (pred, terms) in data.props() {
            if LINK_ONLY.contains(&pred.as_str()) {
                continue;
            }
            for t in terms {
                if let ASTerm::Ref(id) = t {
                    if id != AS_PUBLIC {
                        out.push(id.clone());
                    }
                }
            }
        }
        out
    }

    fn build(&self, id: &str, depth: u32, visiting: &mut HashSet<String>) -> ASObject {
        let Some(Some(entity)) = self.cache.get(id) else {
            return ASObject::with_id(id);
        };
        let mut obj = entity.data.clone();
        if !self.is_owner {
            obj.retain_props(|p| !OWNER_ONLY.contains(&p));
        }
        if let Some(total) = self.totals.get(id) {
            obj.set("totalItems", ASTerm::integer(*total as i64));
        }
        if depth == 0 {
            return obj;
        }

        visiting.insert(id.to_string());
        for (pred, terms) in obj.props_mut() {
            if LINK_ONLY.contains(&pred.as_str()) {
                continue;
            }
            for t in terms.iter_mut() {
                let ASTerm::Ref(child_id) = t else { continue };
                if visiting.contains(child_id.as_str()) {
                    continue;
                }
                if !matches!(self.cache.get(child_id.as_str()), Some(Some(_))) {
                    continue;
                }
                let mut child = self.build(child_id, depth - 1, visiting);
                if is_generated_under(child_id, &self.root) {
                    child.id = None;
                }
                *t = ASTerm::Object(child);
            }
        }
        visiting.remove(id);
        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JsonLdContext;
    use serde_json::json;

    #[test]
    fn nested_objects_become_nodes() {
        let ctx = JsonLdContext::activity_streams();
        let doc = ASObject::from_json(
            &ctx,
            &json!({
                "id": "https://a.example/act/1",
                "type": "Create",
                "actor": "https://a.example/users/alice",
                "object": {
                    "id": "https://a.example/notes/1",
                    "type": "Note",
                    "tag": [{"type": "Hashtag", "name": "#rust"}]
                }
            }),
        )
        .unwrap();
        let flat = flatten(&doc).unwrap();
        let ids: Vec<_> = flat.nodes.iter().map(|n| n.id.clone().unwrap()).collect();
        assert_eq!(
            ids,
            vec![
                "https://a.example/act/1",
                "https://a.example/notes/1",
                "https://a.example/act/1#b0"
            ]
        );
        assert_eq!(flat.nodes[0].first("object"), Some(&ASTerm::reference("https://a.example/notes/1")));
        assert!(flat
            .nodes
            .iter()
            .all(|n| n.props().all(|(_, ts)| ts.iter().all(|t| !matches!(t, ASTerm::Object(_))))));
    }

    #[test]
    fn repeated_id_is_flattened_once() {
        let mut inner = ASObject::typed("Note", Some("https://a.example/n".into()));
        inner.set("content", ASTerm::string("first"));
        let mut dup = ASObject::typed("Note", Some("https://a.example/n".into()));
        dup.set("content", ASTerm::string("second"));
        let mut root = ASObject::typed("Collection", Some("https://a.example/c".into()));
        root.add("items", ASTerm::Object(inner));
        root.add("items", ASTerm::Object(dup));

        let flat = flatten(&root).unwrap();
        assert_eq!(flat.nodes.len(), 2);
        assert_eq!(flat.nodes[1].first_str("content"), Some("first"));
        assert_eq!(flat.nodes[0].ids("items").len(), 2);
    }

    #[test]
    fn generated_ids_are_recognised() {
        assert!(is_generated_under("https://a.example/x#b12", "https://a.example/x"));
        assert!(is_generated_under("https://a.example/x#b0", "https://a.example/x#b3"));
        assert!(!is_generated_under("https://a.example/x#key", "https://a.example/x"));
        assert!(!is_generated_under("https://b.example/x#b0", "https://a.example/x"));
    }
}
