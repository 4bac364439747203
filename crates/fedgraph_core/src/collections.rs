/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::object::APEntity;
use crate::store::{ChangeSet, CollectionItem, CollectionOp, CollectionPage, EntityStore};
use crate::triple_store::EntityDb;
use anyhow::Result;
use rusqlite::params;
use tracing::info;

const PAGE: usize = 200;

/// Public if addressed to the public collection, or if it is an actor.
pub fn is_publicly_visible(e: &APEntity) -> bool {
    e.is_actor() || e.data.is_public()
}

/// Membership operations bound to one transaction's store.
pub struct CollectionTools<'a> {
    store: &'a dyn EntityStore,
}

impl<'a> CollectionTools<'a> {
    pub fn new(store: &'a dyn EntityStore) -> Self {
        Self { store }
    }

    /// Appends `element`; a no-op if it is already a member.
    pub async fn add(&self, collection: &str, element: &str) -> Result<CollectionItem> {
        let is_public = match self.store.get_entity(element, false).await? {
            Some(e) => is_publicly_visible(&e),
            None => false,
        };
        if !self.store.collection_contains(collection, element).await? {
            self.store
                .apply(ChangeSet {
                    collection_ops: vec![CollectionOp::Add {
                        collection: collection.to_string(),
                        element: element.to_string(),
                        is_public,
                    }],
                    ..ChangeSet::default()
                })
                .await?;
        }
        Ok(CollectionItem {
            item_id: None,
            collection: collection.to_string(),
            element: element.to_string(),
            is_public,
        })
    }

    /// Removes `element`; a no-op if absent.
    pub async fn remove(&self, collection: &str, element: &str) -> Result<()> {
        if !self.store.collection_contains(collection, element).await? {
            return Ok(());
        }
        self.store
            .apply(ChangeSet {
                collection_ops: vec![CollectionOp::Remove {
                    collection: collection.to_string(),
                    element: element.to_string(),
                }],
                ..ChangeSet::default()
            })
            .await
    }

    pub async fn contains(&self, collection: &str, element: &str) -> Result<bool> {
        self.store.collection_contains(collection, element).await
    }

    pub async fn page(
        &self,
        collection: &str,
        after: Option<i64>,
        limit: usize,
        include_private: bool,
    ) -> Result<CollectionPage> {
        self.store
            .collection_page(collection, after, limit, include_private)
            .await
    }

    /// Every element in insertion order.
    pub async fn elements(&self, collection: &str, include_private: bool) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut after = None;
        loop {
            let page = self.page(collection, after, PAGE, include_private).await?;
            out.extend(page.items.into_iter().map(|i| i.element));
            match page.next {
                Some(n) => after = Some(n),
                None => break,
            }
        }
        Ok(out)
    }
}

/// Recomputes `is_public` for every collection row. Returns how many rows changed.
pub async fn reconcile_visibility(db: &EntityDb) -> Result<usize> {
    let changed = tokio::task::spawn_blocking({
        let db = db.clone();
        move || -> Result<usize> {
            let mut conn = db.connect()?;
            let tx = conn.transaction()?;
            let rows: Vec<(i64, String, bool)> = {
                let mut stmt = tx.prepare(
                    r#"
                    SELECT ci.item_id, a.uri, ci.is_public
                    FROM collection_items ci
                    JOIN attributes a ON a.attribute_id = ci.element_attr
                    ORDER BY ci.item_id ASC
                    "#,
                )?;
                let mapped = stmt.query_map([], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get::<_, i64>(2)? != 0))
                })?;
                mapped.collect::<rusqlite::Result<_>>()?
            };
            let mut changed = 0usize;
            for (item_id, element, was_public) in rows {
                let now_public = db
                    .read_entity(&tx, &element)?
                    .map(|e| is_publicly_visible(&e))
                    .unwrap_or(false);
                if now_public != was_public {
                    tx.execute(
                        "UPDATE collection_items SET is_public=?1 WHERE item_id=?2",
                        params![now_public as i64, item_id],
                    )?;
                    changed += 1;
                }
            }
            tx.commit()?;
            Ok(changed)
        }
    })
    .await??;
    if changed > 0 {
        info!(changed, "collection visibility reconciled");
    }
    Ok(changed)
}
