/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use super::{public_collection, ChangeSet, CollectionItem, CollectionOp, CollectionPage, EntityStore};
use crate::object::APEntity;
use anyhow::Result;
use async_trait::async_trait;
use fedgraph_protocol::AS_PUBLIC;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Transaction overlay. Writes are buffered until [`commit_changes`](EntityStore::commit_changes);
/// dropping the store without committing discards them.
pub struct StagingStore {
    next: Box<dyn EntityStore>,
    staged: Mutex<ChangeSet>,
}

impl StagingStore {
    pub fn new(next: Box<dyn EntityStore>) -> Self {
        Self {
            next,
            staged: Mutex::new(ChangeSet::default()),
        }
    }

    pub fn next(&self) -> &dyn EntityStore {
        self.next.as_ref()
    }

    /// Drops everything buffered so far.
    pub async fn discard(&self) {
        *self.staged.lock().await = ChangeSet::default();
    }

    pub async fn has_changes(&self) -> bool {
        !self.staged.lock().await.is_empty()
    }

    /// Final staged op per element of `collection`, in staging order.
    async fn staged_ops(&self, collection: &str) -> Vec<CollectionOp> {
        let staged = self.staged.lock().await;
        let mut last: Vec<CollectionOp> = Vec::new();
        for op in staged.collection_ops.iter().filter(|o| o.collection() == collection) {
            last.retain(|o| o.element() != op.element());
            last.push(op.clone());
        }
        last
    }
}

#[async_trait]
impl EntityStore for StagingStore {
    async fn get_entity(&self, id: &str, allow_remote: bool) -> Result<Option<APEntity>> {
        if id == AS_PUBLIC {
            return Ok(Some(public_collection()));
        }
        if let Some(e) = self.staged.lock().await.entity(id) {
            return Ok(Some(e.clone()));
        }
        self.next.get_entity(id, allow_remote).await
    }

    async fn store_entity(&self, entity: APEntity) -> Result<APEntity> {
        self.staged.lock().await.put_entity(entity.clone());
        Ok(entity)
    }

    async fn apply(&self, changes: ChangeSet) -> Result<()> {
        self.staged.lock().await.merge(changes);
        Ok(())
    }

    async fn commit_changes(&self) -> Result<()> {
        let changes = std::mem::take(&mut *self.staged.lock().await);
        self.next.apply(changes).await?;
        self.next.commit_changes().await
    }

    async fn collection_contains(&self, collection: &str, element: &str) -> Result<bool> {
        let ops = self.staged_ops(collection).await;
        match ops.iter().find(|o| o.element() == element) {
            Some(CollectionOp::Add { .. }) => Ok(true),
            Some(CollectionOp::Remove { .. }) => Ok(false),
            None => self.next.collection_contains(collection, element).await,
        }
    }

    async fn collection_page(
        &self,
        collection: &str,
        after: Option<i64>,
        limit: usize,
        include_private: bool,
    ) -> Result<CollectionPage> {
        let ops = self.staged_ops(collection).await;
        let mut page = self
            .next
            .collection_page(collection, after, limit, include_private)
            .await?;
        if ops.is_empty() {
            return Ok(page);
        }

        let mut committed: HashMap<&str, bool> = HashMap::new();
        for op in &ops {
            let present = self.next.collection_contains(collection, op.element()).await?;
            committed.insert(op.element(), present);
        }

        for op in &ops {
            let was_present = committed.get(op.element()).copied().unwrap_or(false);
            match op {
                CollectionOp::Remove { element, .. } if was_present => {
                    page.items.retain(|i| &i.element != element);
                    page.total = page.total.saturating_sub(1);
                }
                CollectionOp::Add {
                    element, is_public, ..
                } if !was_present && (include_private || *is_public) => {
                    page.total += 1;
                    if page.next.is_none() && page.items.len() < limit {
                        page.items.push(CollectionItem {
                            item_id: None,
                            collection: collection.to_string(),
                            element: element.clone(),
                            is_public: *is_public,
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(page)
    }
}
