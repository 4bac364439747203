/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Layered entity resolution.
//!
//! A transaction is a chain built top-down: `StagingStore -> RetrievingStore -> LocalStore`.
//! Each layer owns the next one and implements the same [`EntityStore`] contract.

use crate::object::{APEntity, ASObject, ASTerm, UNTYPED};
use anyhow::Result;
use async_trait::async_trait;
use fedgraph_protocol::AS_PUBLIC;

pub mod local;
pub mod retrieving;
pub mod staging;

pub use local::LocalStore;
pub use retrieving::RetrievingStore;
pub use staging::StagingStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionOp {
    Add {
        collection: String,
        element: String,
        is_public: bool,
    },
    Remove {
        collection: String,
        element: String,
    },
}

impl CollectionOp {
    pub fn collection(&self) -> &str {
        match self {
            Self::Add { collection, .. } | Self::Remove { collection, .. } => collection,
        }
    }

    pub fn element(&self) -> &str {
        match self {
            Self::Add { element, .. } | Self::Remove { element, .. } => element,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub action: String,
    pub payload: String,
    /// Delay before the first attempt.
    pub delay_ms: i64,
}

/// A queue row together with the lease token of the worker holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobClaim {
    pub id: String,
    pub claim_token: String,
}

/// Everything one transaction wants to persist, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub entities: Vec<APEntity>,
    pub collection_ops: Vec<CollectionOp>,
    pub jobs: Vec<NewJob>,
    /// Queue rows whose action succeeded inside this transaction.
    pub completed_jobs: Vec<JobClaim>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.collection_ops.is_empty()
            && self.jobs.is_empty()
            && self.completed_jobs.is_empty()
    }

    pub fn merge(&mut self, other: ChangeSet) {
        for e in other.entities {
            self.put_entity(e);
        }
        self.collection_ops.extend(other.collection_ops);
        self.jobs.extend(other.jobs);
        self.completed_jobs.extend(other.completed_jobs);
    }

    /// Last write for an id wins.
    pub fn put_entity(&mut self, entity: APEntity) {
        if let Some(slot) = self.entities.iter_mut().find(|e| e.id == entity.id) {
            *slot = entity;
        } else {
            self.entities.push(entity);
        }
    }

    pub fn entity(&self, id: &str) -> Option<&APEntity> {
        self.entities.iter().find(|e| e.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionItem {
    /// Insertion order; `None` while the insert is only staged.
    pub item_id: Option<i64>,
    pub collection: String,
    pub element: String,
    pub is_public: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionPage {
    pub total: u64,
    pub items: Vec<CollectionItem>,
    /// Cursor for the following page.
    pub next: Option<i64>,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_entity(&self, id: &str, allow_remote: bool) -> Result<Option<APEntity>>;

    async fn store_entity(&self, entity: APEntity) -> Result<APEntity>;

    /// Persists a batch. The local layer writes it in one sqlite transaction,
    /// the staging layer buffers it.
    async fn apply(&self, changes: ChangeSet) -> Result<()>;

    async fn commit_changes(&self) -> Result<()>;

    async fn collection_contains(&self, collection: &str, element: &str) -> Result<bool>;

    async fn collection_page(
        &self,
        collection: &str,
        after: Option<i64>,
        limit: usize,
        include_private: bool,
    ) -> Result<CollectionPage>;
}

/// The public audience collection. Never stored, never fetched.
pub fn public_collection() -> APEntity {
    let mut data = ASObject::typed("Collection", Some(AS_PUBLIC.to_string()));
    data.set("name", ASTerm::string("Public"));
    APEntity {
        id: AS_PUBLIC.to_string(),
        type_name: data.type_name().unwrap_or(UNTYPED).to_string(),
        data,
        updated_ms: 0,
        is_owner: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_set_keeps_last_entity_write() {
        let mut cs = ChangeSet::default();
        let mut a = ASObject::typed("Note", Some("https://a.example/n/1".into()));
        cs.put_entity(APEntity::new(a.clone(), true).unwrap());
        a.set("content", ASTerm::string("second"));
        cs.put_entity(APEntity::new(a, true).unwrap());
        assert_eq!(cs.entities.len(), 1);
        assert_eq!(
            cs.entity("https://a.example/n/1").and_then(|e| e.data.first_str("content")),
            Some("second")
        );
    }
}
