/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Term <-> IRI mapping for the ActivityStreams context.
//!
//! This is a deliberately small stand-in for a JSON-LD processor: documents are
//! handled in their compacted ActivityStreams form, and only the storage layer
//! needs full IRIs. An instance is built explicitly and passed to the components
//! that need it; there is no process-wide context cache.

use fedgraph_protocol::AS_NAMESPACE;
use std::collections::HashMap;

pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
pub const XSD: &str = "http://www.w3.org/2001/XMLSchema#";
pub const SEC: &str = "https://w3id.org/security#";
pub const LDP: &str = "http://www.w3.org/ns/ldp#";
pub const FG: &str = "https://ns.fedgraph.dev/#";

/// Terms whose plain string values are node references (`"@type": "@id"`).
const ID_TERMS: &[&str] = &[
    "actor", "object", "target", "origin", "result", "instrument",
    "to", "cc", "bto", "bcc", "audience", "attributedTo", "inReplyTo", "context",
    "inbox", "outbox", "followers", "following", "liked", "likes", "shares", "replies",
    "streams", "sharedInbox", "endpoints", "blocks",
    "first", "last", "next", "prev", "current", "partOf", "items", "orderedItems",
    "url", "href", "icon", "image", "tag", "attachment", "generator", "location", "preview",
    "subject", "relationship", "describes", "oneOf", "anyOf",
    "owner", "publicKey",
];

#[derive(Debug, Clone)]
pub struct JsonLdContext {
    prefixes: Vec<(String, String)>,
    terms: HashMap<String, String>,
    reverse: HashMap<String, String>,
    id_terms: std::collections::HashSet<String>,
}

impl Default for JsonLdContext {
    fn default() -> Self {
        Self::activity_streams()
    }
}

impl JsonLdContext {
    /// ActivityStreams 2.0 plus the security vocabulary and the local extensions.
    pub fn activity_streams() -> Self {
        let mut ctx = Self {
            prefixes: vec![
                ("as".to_string(), AS_NAMESPACE.to_string()),
                ("sec".to_string(), SEC.to_string()),
                ("ldp".to_string(), LDP.to_string()),
                ("xsd".to_string(), XSD.to_string()),
                ("fg".to_string(), FG.to_string()),
            ],
            terms: HashMap::new(),
            reverse: HashMap::new(),
            id_terms: ID_TERMS.iter().map(|t| t.to_string()).collect(),
        };
        ctx.define("inbox", &format!("{LDP}inbox"));
        for t in ["publicKey", "publicKeyPem", "owner"] {
            ctx.define(t, &format!("{SEC}{t}"));
        }
        for t in ["blocks", "formerOwnerType"] {
            ctx.define(t, &format!("{FG}{t}"));
        }
        ctx
    }

    pub fn define(&mut self, term: &str, iri: &str) {
        self.terms.insert(term.to_string(), iri.to_string());
        self.reverse.insert(iri.to_string(), term.to_string());
    }

    /// Expands a compact term, a `prefix:suffix` CURIE or passes a full IRI through.
    pub fn expand_term(&self, term: &str) -> String {
        if let Some(iri) = self.terms.get(term) {
            return iri.clone();
        }
        if let Some((prefix, suffix)) = term.split_once(':') {
            if suffix.starts_with("//") {
                return term.to_string();
            }
            if let Some((_, ns)) = self.prefixes.iter().find(|(p, _)| p == prefix) {
                return format!("{ns}{suffix}");
            }
            return term.to_string();
        }
        format!("{AS_NAMESPACE}{term}")
    }

    /// Inverse of [`expand_term`](Self::expand_term) for IRIs this context knows.
    pub fn compact_iri(&self, iri: &str) -> String {
        if let Some(term) = self.reverse.get(iri) {
            return term.clone();
        }
        if let Some(rest) = iri.strip_prefix(AS_NAMESPACE) {
            if !rest.is_empty() {
                return rest.to_string();
            }
        }
        for (prefix, ns) in &self.prefixes {
            if prefix == "as" {
                continue;
            }
            if let Some(rest) = iri.strip_prefix(ns.as_str()) {
                if !rest.is_empty() {
                    return format!("{prefix}:{rest}");
                }
            }
        }
        iri.to_string()
    }

    pub fn xsd(&self, name: &str) -> String {
        format!("{XSD}{name}")
    }

    /// Whether a plain string under `term` denotes a node reference.
    pub fn is_id_term(&self, term: &str) -> bool {
        self.id_terms.contains(term)
    }
}
